//! Eager single-shard future/promise machinery.
//!
//! A future is a handle to an eventually-available value in one of three
//! states: not-ready (a generation-tagged handle into the shard's chain
//! arena), ready (value inline) or failed (fault inline). Futures are
//! move-only and consumed by attaching exactly one continuation; fulfilment
//! enqueues that continuation on the shard's ready-task queue. Nothing here
//! is `Send`: a chain lives and dies on the shard that created it.

use crate::error::{Fault, ReactorError};
use crate::reactor::Reactor;
use crate::task::make_task;
use std::marker::PhantomData;
use std::rc::Rc;

mod arena;
pub(crate) use arena::{ChainArena, ChainHandle, ChainValue, Continuation, Ready};

mod util;
pub use util::{do_until, map_reduce, parallel_for_each, when_all};

/// Ties futures and promises to their shard.
type NotSend = PhantomData<Rc<()>>;

enum FutureState<T> {
    Invalid,
    Ready(T),
    Failed(Fault),
    Pending(ChainHandle),
}

pub struct Future<T: 'static> {
    state: FutureState<T>,
    _local: NotSend,
}

pub struct Promise<T: 'static> {
    link: Option<ChainHandle>,
    future_obtained: bool,
    done: bool,
    /// Outcome delivered before `get_future` was called.
    early: Option<Result<T, Fault>>,
    _local: NotSend,
}

/// An immediately ready future.
pub fn ready<T: 'static>(value: T) -> Future<T> {
    Future {
        state: FutureState::Ready(value),
        _local: PhantomData,
    }
}

/// An immediately failed future.
pub fn failed<T: 'static>(fault: Fault) -> Future<T> {
    Future {
        state: FutureState::Failed(fault),
        _local: PhantomData,
    }
}

pub(crate) fn apply_ready(action: Ready) {
    apply(action)
}

fn apply(action: Ready) {
    match action {
        Ready::Schedule(cont, value) => {
            Reactor::local().add_task(make_task(move || cont(value)));
        }
        Ready::Ignored(fault) => report_ignored(&fault),
        Ready::Nothing => {}
    }
}

fn report_ignored(fault: &Fault) {
    tracing::warn!("ignoring failed future: {:#}", fault);
}

pub(crate) fn downcast<T: 'static>(value: Box<dyn std::any::Any>) -> T {
    *value
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("FATAL: chain value type mismatch"))
}

impl<T: 'static> Future<T> {
    fn pending(h: ChainHandle) -> Self {
        Future {
            state: FutureState::Pending(h),
            _local: PhantomData,
        }
    }

    fn from_result(r: Result<T, Fault>) -> Self {
        match r {
            Ok(v) => ready(v),
            Err(e) => failed(e),
        }
    }

    fn from_chain_value(cv: ChainValue) -> Self {
        match cv {
            Ok(boxed) => ready(downcast::<T>(boxed)),
            Err(e) => failed(e),
        }
    }

    fn take_state(&mut self) -> FutureState<T> {
        match std::mem::replace(&mut self.state, FutureState::Invalid) {
            FutureState::Invalid => panic!("FATAL: future already consumed"),
            state => state,
        }
    }

    /// Whether the outcome is already known (ready or failed).
    pub fn available(&self) -> bool {
        matches!(self.state, FutureState::Ready(_) | FutureState::Failed(_))
    }

    pub fn failed(&self) -> bool {
        matches!(self.state, FutureState::Failed(_))
    }

    /// Consumes a resolved future. Only legal when `available()`.
    pub fn into_result(mut self) -> Result<T, Fault> {
        match self.take_state() {
            FutureState::Ready(v) => Ok(v),
            FutureState::Failed(e) => Err(e),
            FutureState::Pending(_) => panic!("FATAL: into_result() on a pending future"),
            FutureState::Invalid => unreachable!(),
        }
    }

    /// Marks a resolved failure as observed so dropping it stays silent.
    pub fn ignore_ready_future(mut self) {
        match self.take_state() {
            FutureState::Ready(_) | FutureState::Failed(_) => {}
            FutureState::Pending(h) => {
                // Not resolved; equivalent to a plain drop.
                self.state = FutureState::Pending(h);
            }
            FutureState::Invalid => unreachable!(),
        }
    }

    /// Chains a continuation run only on success; a failure skips it and is
    /// forwarded to the returned future.
    pub fn then<U, F>(mut self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> Future<U> + 'static,
    {
        match self.take_state() {
            FutureState::Ready(v) => {
                let mut pr = Promise::new();
                let fut = pr.get_future();
                Reactor::local().add_task(make_task(move || f(v).forward_to(pr)));
                fut
            }
            FutureState::Failed(e) => failed(e),
            FutureState::Pending(h) => {
                let mut pr = Promise::new();
                let fut = pr.get_future();
                attach(
                    h,
                    Box::new(move |cv| {
                        let mut pr = pr;
                        match cv {
                            Ok(boxed) => f(downcast::<T>(boxed)).forward_to(pr),
                            Err(e) => pr.set_exception(e),
                        }
                    }),
                );
                fut
            }
            FutureState::Invalid => unreachable!(),
        }
    }

    /// Value-returning convenience over `then`.
    pub fn map<U, F>(mut self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        match self.take_state() {
            FutureState::Ready(v) => {
                let mut pr = Promise::new();
                let fut = pr.get_future();
                Reactor::local().add_task(make_task(move || pr.set_value(f(v))));
                fut
            }
            FutureState::Failed(e) => failed(e),
            FutureState::Pending(h) => {
                let mut pr = Promise::new();
                let fut = pr.get_future();
                attach(
                    h,
                    Box::new(move |cv| {
                        let mut pr = pr;
                        match cv {
                            Ok(boxed) => pr.set_value(f(downcast::<T>(boxed))),
                            Err(e) => pr.set_exception(e),
                        }
                    }),
                );
                fut
            }
            FutureState::Invalid => unreachable!(),
        }
    }

    /// Chains a continuation that observes the outcome either way: it
    /// receives this future in a resolved state.
    pub fn then_wrapped<U, F>(mut self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(Future<T>) -> Future<U> + 'static,
    {
        match self.take_state() {
            state @ (FutureState::Ready(_) | FutureState::Failed(_)) => {
                let resolved = Future { state, _local: PhantomData };
                let mut pr = Promise::new();
                let fut = pr.get_future();
                Reactor::local().add_task(make_task(move || f(resolved).forward_to(pr)));
                fut
            }
            FutureState::Pending(h) => {
                let mut pr = Promise::new();
                let fut = pr.get_future();
                attach(
                    h,
                    Box::new(move |cv| f(Future::from_chain_value(cv)).forward_to(pr)),
                );
                fut
            }
            FutureState::Invalid => unreachable!(),
        }
    }

    /// Runs `action` whatever the outcome, then forwards it. A failure from
    /// `action` supersedes a prior success but never a prior failure.
    pub fn finally<F>(self, action: F) -> Future<T>
    where
        F: FnOnce() -> Future<()> + 'static,
    {
        self.then_wrapped(move |result| {
            action().then_wrapped(move |af| match af.into_result() {
                Ok(()) => result,
                Err(e) => {
                    if result.failed() {
                        result
                    } else {
                        result.ignore_ready_future();
                        failed(e)
                    }
                }
            })
        })
    }

    /// Redirects this future's eventual outcome into `promise`.
    pub fn forward_to(mut self, mut promise: Promise<T>) {
        match self.take_state() {
            FutureState::Ready(v) => promise.set_value(v),
            FutureState::Failed(e) => promise.set_exception(e),
            FutureState::Pending(h) => attach(
                h,
                Box::new(move |cv| {
                    let mut promise = promise;
                    match cv {
                        Ok(boxed) => promise.set_value(downcast::<T>(boxed)),
                        Err(e) => promise.set_exception(e),
                    }
                }),
            ),
            FutureState::Invalid => unreachable!(),
        }
    }

    /// Waits for the value. Only legal inside a fiber: a not-ready future
    /// parks the fiber and yields to the reactor until fulfilment.
    pub fn get(mut self) -> Result<T, Fault> {
        match self.take_state() {
            FutureState::Ready(v) => Ok(v),
            FutureState::Failed(e) => Err(e),
            FutureState::Pending(h) => crate::fiber::park_on::<T>(h),
            FutureState::Invalid => unreachable!(),
        }
    }
}

fn attach(h: ChainHandle, cont: Continuation) {
    let action = Reactor::local().with_chains(|chains| chains.attach(h, cont));
    apply(action);
}

impl<T: 'static> Drop for Future<T> {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, FutureState::Invalid) {
            FutureState::Pending(h) => {
                // During reactor teardown the arena is already gone along
                // with the slot this handle names.
                if let Some(reactor) = Reactor::try_local() {
                    let action = reactor.with_chains(|chains| chains.abandon_future(h));
                    apply(action);
                }
            }
            FutureState::Failed(fault) => report_ignored(&fault),
            FutureState::Ready(_) | FutureState::Invalid => {}
        }
    }
}

impl<T: 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Promise<T> {
    pub fn new() -> Self {
        Promise {
            link: None,
            future_obtained: false,
            done: false,
            early: None,
            _local: PhantomData,
        }
    }

    /// The read end of this promise. May be called at most once.
    pub fn get_future(&mut self) -> Future<T> {
        if self.future_obtained {
            panic!("FATAL: future already obtained from this promise");
        }
        self.future_obtained = true;
        if let Some(outcome) = self.early.take() {
            self.done = true;
            return Future::from_result(outcome);
        }
        let h = Reactor::local().with_chains(|chains| chains.link());
        self.link = Some(h);
        Future::pending(h)
    }

    pub fn set_value(&mut self, value: T) {
        self.deliver(Ok(value));
    }

    pub fn set_exception(&mut self, fault: Fault) {
        self.deliver(Err(fault));
    }

    fn deliver(&mut self, outcome: Result<T, Fault>) {
        if self.done {
            panic!("FATAL: promise fulfilled twice");
        }
        self.done = true;
        match self.link.take() {
            Some(h) => {
                let value: ChainValue = match outcome {
                    Ok(v) => Ok(Box::new(v)),
                    Err(e) => Err(e),
                };
                let action = Reactor::local().with_chains(|chains| chains.fulfil(h, value));
                apply(action);
            }
            None => {
                if self.future_obtained {
                    // The future was handed out resolved; nothing waits.
                    panic!("FATAL: promise fulfilled twice");
                }
                self.early = Some(outcome);
            }
        }
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(h) = self.link.take() {
            if !self.done {
                if let Some(reactor) = Reactor::try_local() {
                    let action = reactor.with_chains(|chains| {
                        chains.abandon_promise(h, Fault::from(ReactorError::BrokenPromise))
                    });
                    apply(action);
                }
            }
        } else if let Some(Err(fault)) = self.early.take() {
            report_ignored(&fault);
        }
    }
}
