//! Futures-based counting semaphore with FIFO waiters.

use crate::error::{Fault, ReactorError};
use crate::future::{failed, ready, Future, Promise};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct Waiter {
    promise: Promise<()>,
    units: usize,
}

struct Inner {
    count: isize,
    waiters: VecDeque<Waiter>,
    broken: Option<String>,
}

/// Counting semaphore. `wait` returns a future that resolves once the
/// requested units are available; waiters resolve strictly in FIFO order,
/// so a large request blocks later smaller ones.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<Inner>>,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                count: count as isize,
                waiters: VecDeque::new(),
                broken: None,
            })),
        }
    }

    pub fn wait(&self, units: usize) -> Future<()> {
        let mut inner = self.inner.borrow_mut();
        if let Some(msg) = &inner.broken {
            return failed(Fault::from(ReactorError::SemaphoreBroken).context(msg.clone()));
        }
        if inner.waiters.is_empty() && inner.count >= units as isize {
            inner.count -= units as isize;
            return ready(());
        }
        let mut promise = Promise::new();
        let fut = promise.get_future();
        inner.waiters.push_back(Waiter { promise, units });
        fut
    }

    pub fn signal(&self, units: usize) {
        let mut woken = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            inner.count += units as isize;
            while let Some(front) = inner.waiters.front() {
                if inner.count < front.units as isize {
                    break;
                }
                let w = inner.waiters.pop_front().expect("front checked");
                inner.count -= w.units as isize;
                woken.push(w.promise);
            }
        }
        // Fulfil outside the borrow: set_value schedules continuations which
        // may re-enter this semaphore.
        for mut promise in woken {
            promise.set_value(());
        }
    }

    /// Takes units immediately if available; never waits.
    pub fn try_wait(&self, units: usize) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.broken.is_none() && inner.waiters.is_empty() && inner.count >= units as isize {
            inner.count -= units as isize;
            true
        } else {
            false
        }
    }

    pub fn available_units(&self) -> isize {
        self.inner.borrow().count
    }

    pub fn waiters(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Fails every current and future waiter.
    pub fn broken(&self, reason: &str) {
        let drained: Vec<Waiter> = {
            let mut inner = self.inner.borrow_mut();
            inner.broken = Some(reason.to_string());
            inner.waiters.drain(..).collect()
        };
        for mut w in drained {
            w.promise
                .set_exception(Fault::from(ReactorError::SemaphoreBroken).context(reason.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use std::cell::Cell;

    #[test]
    fn test_immediate_grant_and_exhaustion() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        runtime.block_on(|| {
            let sem = Semaphore::new(2);
            assert!(sem.try_wait(1));
            assert!(sem.try_wait(1));
            assert!(!sem.try_wait(1));
            sem.signal(1);
            assert!(sem.try_wait(1));
            ready(())
        })?;
        Ok(())
    }

    #[test]
    fn test_waiters_resolve_in_fifo_order() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let order = runtime.block_on(|| {
            let sem = Semaphore::new(0);
            let log = Rc::new(RefCell::new(Vec::new()));
            let futs: Vec<Future<()>> = (0..3)
                .map(|i| {
                    let log = Rc::clone(&log);
                    sem.wait(1).map(move |()| log.borrow_mut().push(i))
                })
                .collect();
            sem.signal(3);
            let log2 = Rc::clone(&log);
            crate::future::when_all(futs).map(move |_| log2.borrow().clone())
        })?;
        assert_eq!(order, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_large_waiter_blocks_later_small_ones() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        runtime.block_on(|| {
            let sem = Semaphore::new(1);
            let big_done = Rc::new(Cell::new(false));
            let big_done2 = Rc::clone(&big_done);
            let big = sem.wait(2).map(move |()| big_done2.set(true));
            // One unit is free, but FIFO order keeps it behind the waiter.
            assert!(!sem.try_wait(1));
            sem.signal(1);
            let big_done3 = Rc::clone(&big_done);
            big.map(move |()| assert!(big_done3.get()))
        })?;
        Ok(())
    }

    #[test]
    fn test_broken_fails_waiters() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let failed_chain = runtime.block_on(|| {
            let sem = Semaphore::new(0);
            let waiter = sem.wait(1);
            sem.broken("shutting down");
            waiter.then_wrapped(|f| ready(f.failed()))
        })?;
        assert!(failed_chain);
        Ok(())
    }
}
