//! Combinators over collections of futures.

use super::{ready, Future, Promise};
use crate::error::Fault;
use std::cell::RefCell;
use std::rc::Rc;

/// Resolves when every future has resolved, successfully or not. The result
/// carries each input future in a resolved state, in input order; no failure
/// is lost and none is reported as ignored.
pub fn when_all<T: 'static>(futs: Vec<Future<T>>) -> Future<Vec<Future<T>>> {
    struct State<T: 'static> {
        slots: Vec<Option<Future<T>>>,
        waiting: usize,
        promise: Option<Promise<Vec<Future<T>>>>,
    }

    impl<T: 'static> State<T> {
        fn resolve_one(&mut self, index: usize, resolved: Future<T>) {
            self.slots[index] = Some(resolved);
            self.release();
        }

        fn release(&mut self) {
            self.waiting -= 1;
            if self.waiting == 0 {
                let slots = std::mem::take(&mut self.slots);
                let mut pr = self.promise.take().expect("when_all completed twice");
                pr.set_value(slots.into_iter().map(|s| s.expect("slot unfilled")).collect());
            }
        }
    }

    let n = futs.len();
    let mut promise = Promise::new();
    let result = promise.get_future();
    let state = Rc::new(RefCell::new(State {
        slots: (0..n).map(|_| None).collect(),
        // One extra count held until the issue loop finishes, so an
        // all-ready input cannot complete the promise mid-loop.
        waiting: n + 1,
        promise: Some(promise),
    }));

    for (i, fut) in futs.into_iter().enumerate() {
        if fut.available() {
            state.borrow_mut().resolve_one(i, fut);
        } else {
            let state = Rc::clone(&state);
            fut.then_wrapped(move |resolved| {
                state.borrow_mut().resolve_one(i, resolved);
                ready(())
            })
            .ignore_ready_future();
        }
    }
    state.borrow_mut().release();
    result
}

/// Applies `func` to every item, running the resulting futures in parallel.
/// Every subtask runs to completion even when some fail; the aggregate
/// future fails with the first failure encountered in completion order.
pub fn parallel_for_each<I, F>(items: I, mut func: F) -> Future<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Future<()> + 'static,
{
    struct State {
        waiting: usize,
        first_fault: Option<Fault>,
        promise: Option<Promise<()>>,
    }

    impl State {
        fn complete_one(&mut self, outcome: Result<(), Fault>) {
            if let Err(fault) = outcome {
                if self.first_fault.is_none() {
                    self.first_fault = Some(fault);
                }
            }
            self.waiting -= 1;
            if self.waiting == 0 {
                let mut pr = self.promise.take().expect("parallel_for_each completed twice");
                match self.first_fault.take() {
                    Some(fault) => pr.set_exception(fault),
                    None => pr.set_value(()),
                }
            }
        }
    }

    let mut promise = Promise::new();
    let result = promise.get_future();
    let state = Rc::new(RefCell::new(State {
        waiting: 1,
        first_fault: None,
        promise: Some(promise),
    }));

    for item in items {
        state.borrow_mut().waiting += 1;
        let fut = func(item);
        if fut.available() {
            state.borrow_mut().complete_one(fut.into_result());
        } else {
            let state = Rc::clone(&state);
            fut.then_wrapped(move |resolved| {
                state.borrow_mut().complete_one(resolved.into_result());
                ready(())
            })
            .ignore_ready_future();
        }
    }
    state.borrow_mut().complete_one(Ok(()));
    result
}

/// Maps every item through an async `mapper` and folds the results with
/// `reduce`. Results are folded in completion order.
pub fn map_reduce<I, M, U, A, R>(items: I, mut mapper: M, initial: A, reduce: R) -> Future<A>
where
    I: IntoIterator,
    M: FnMut(I::Item) -> Future<U> + 'static,
    U: 'static,
    A: 'static,
    R: Fn(A, U) -> A + 'static,
{
    let acc = Rc::new(RefCell::new(Some(initial)));
    let reduce = Rc::new(reduce);
    let acc2 = Rc::clone(&acc);
    parallel_for_each(items, move |item| {
        let acc = Rc::clone(&acc);
        let reduce = Rc::clone(&reduce);
        mapper(item).map(move |v| {
            let mut slot = acc.borrow_mut();
            let folded = reduce(slot.take().expect("accumulator gone"), v);
            *slot = Some(folded);
        })
    })
    .map(move |()| acc2.borrow_mut().take().expect("accumulator gone"))
}

/// Runs `body` repeatedly until `stop` returns true. The condition is
/// checked before each iteration; a failure from `body` stops the loop and
/// fails the returned future.
pub fn do_until<S, B>(mut stop: S, mut body: B) -> Future<()>
where
    S: FnMut() -> bool + 'static,
    B: FnMut() -> Future<()> + 'static,
{
    if stop() {
        return ready(());
    }
    body().then(move |()| do_until(stop, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::failed;
    use crate::runtime::Builder;
    use anyhow::anyhow;

    #[test]
    fn test_when_all_mixed_ready_and_pending() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let res = runtime.block_on(|| {
            let futs: Vec<Future<usize>> = (0..1000)
                .map(|i| ready(()).map(move |()| i))
                .collect();
            // `map` never resolves inline, so both the pending path and (after
            // the first batch drains) the ready path get exercised.
            when_all(futs).map(|ret| {
                assert!(ret.iter().all(|f| f.available()));
                ret.into_iter()
                    .enumerate()
                    .all(|(i, f)| f.into_result().unwrap() == i)
            })
        })?;
        assert!(res);
        Ok(())
    }

    #[test]
    fn test_map_reduce_sum_of_squares() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let n: i64 = 1000;
        let res = runtime.block_on(move || {
            map_reduce(0..n, |x: i64| ready(x * x), 0i64, |a, b| a + b)
        })?;
        let m = n - 1;
        assert_eq!(res, m * (m + 1) * (2 * m + 1) / 6);
        Ok(())
    }

    #[test]
    fn test_parallel_for_each_runs_all_and_surfaces_failure() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let (ran, failed_chain) = runtime.block_on(|| {
            let count = Rc::new(RefCell::new(0usize));
            let count2 = Rc::clone(&count);
            parallel_for_each(0..11_000usize, move |i| {
                *count.borrow_mut() += 1;
                if i % 1777 == 1337 {
                    failed(anyhow!("subtask {} failed", i))
                } else {
                    ready(())
                }
            })
            .then_wrapped(move |f| ready((*count2.borrow(), f.failed())))
        })?;
        assert_eq!(ran, 11_000);
        assert!(failed_chain);
        Ok(())
    }

    #[test]
    fn test_do_until_counts_and_stops() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let res = runtime.block_on(|| {
            let n = Rc::new(RefCell::new(0u32));
            let n2 = Rc::clone(&n);
            let n3 = Rc::clone(&n);
            do_until(
                move || *n2.borrow() == 5,
                move || {
                    *n3.borrow_mut() += 1;
                    ready(())
                },
            )
            .map(move |()| *n.borrow())
        })?;
        assert_eq!(res, 5);
        Ok(())
    }

    #[test]
    fn test_do_until_body_failure_stops_loop() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let res = runtime.block_on(|| {
            let n = Rc::new(RefCell::new(0u32));
            let n2 = Rc::clone(&n);
            let n3 = Rc::clone(&n);
            do_until(
                move || false,
                move || {
                    let mut n = n3.borrow_mut();
                    *n += 1;
                    if *n == 3 {
                        failed(anyhow!("expected"))
                    } else {
                        ready(())
                    }
                },
            )
            .then_wrapped(move |f| ready((*n2.borrow(), f.failed())))
        })?;
        assert_eq!(res, (3, true));
        Ok(())
    }
}
