//! The per-shard reactor: sole owner of its task queues, timers, I/O
//! contexts and continuation arena. The loop drains ready tasks under the
//! task-quota slice, gives each registered poller one non-blocking step,
//! and when every poller reports idle and permits it, parks in
//! `epoll_pwait` until a timer is due or a wakeup eventfd is written.

use crate::clock::{Clock, LowresClock, SteadyClock, LOWRES_GRANULARITY};
use crate::error::Fault;
use crate::future::{ready, ChainArena, Future};
use crate::io_queue::IoQueue;
use crate::runtime::Config;
use crate::smp::SmpContext;
use crate::sys::{self, Iocb};
use crate::task::{make_task, Task};
use crate::thread_pool::ThreadPool;
use crate::timer::{Timer, TimerClock, TimerService};
use anyhow::Result;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

pub(crate) mod aio;
use aio::AioContext;

pub(crate) mod backend;
pub use backend::{PollFlags, PollableFd};
use backend::EpollBackend;

pub(crate) mod signals;
use signals::Signals;

/// Shard index within the runtime.
pub type ShardId = u32;

/// A non-blocking hook polled every loop turn.
///
/// `poll` does one step of work and reports whether any was done.
/// `try_enter_interrupt_mode` asks whether this poller's events can wake a
/// sleeping reactor; returning true commits it until `exit_interrupt_mode`.
pub trait Poller {
    fn poll(&self) -> bool;

    fn try_enter_interrupt_mode(&self) -> bool {
        false
    }

    fn exit_interrupt_mode(&self) {}
}

thread_local! {
    static REACTOR: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

pub struct Reactor {
    id: ShardId,
    cfg: Config,

    // Declaration order is drop order: the thread pool goes down before
    // the backend whose wakeup eventfd its worker writes.
    thread_pool: ThreadPool,
    backend: EpollBackend,
    aio: AioContext,
    signals: Signals,

    chains: RefCell<ChainArena>,
    pending_tasks: RefCell<VecDeque<Box<dyn Task>>>,
    high_priority_tasks: RefCell<VecDeque<Box<dyn Task>>>,
    at_destroy_tasks: RefCell<Vec<Box<dyn Task>>>,
    exit_funcs: RefCell<Vec<Box<dyn FnOnce() -> Future<()>>>>,

    steady_timers: RefCell<TimerService<SteadyClock>>,
    lowres_timers: RefCell<TimerService<LowresClock>>,

    pollers: RefCell<Vec<Rc<dyn Poller>>>,

    smp: Arc<SmpContext>,
    io_queue: RefCell<Option<Rc<IoQueue>>>,

    stopping: Cell<bool>,
    stopped: Cell<bool>,
    return_code: Cell<i32>,
    tasks_processed: Cell<u64>,
    fsyncs: Cell<u64>,
    strict_dma: Cell<bool>,

    // Keeps the task-quota interval timer and the shard-0 coarse-clock
    // update timer alive for the reactor's lifetime.
    quota_timer: RefCell<Option<sys::ThreadTimer>>,
    lowres_update_timer: RefCell<Option<Timer<SteadyClock>>>,

    /// Mask applied while parked in `epoll_pwait`: the task-quota SIGALRM
    /// stays blocked so an idle reactor is not woken twice a millisecond.
    sleep_sigmask: libc::sigset_t,
}

impl Reactor {
    /// The reactor owning the calling thread. Panics outside a runtime.
    pub fn local() -> Rc<Reactor> {
        REACTOR.with(|r| {
            r.borrow()
                .as_ref()
                .expect("no reactor on this thread; build a Runtime first")
                .clone()
        })
    }

    pub(crate) fn try_local() -> Option<Rc<Reactor>> {
        REACTOR.with(|r| r.borrow().clone())
    }

    /// Creates this thread's reactor and installs it as the thread-local
    /// engine. One reactor per thread.
    pub(crate) fn initialize(cfg: &Config, id: ShardId, smp: Arc<SmpContext>) -> Result<Rc<Reactor>> {
        REACTOR.with(|slot| -> Result<()> {
            if slot.borrow().is_some() {
                anyhow::bail!("a reactor is already active on this thread");
            }
            Ok(())
        })?;

        let backend = EpollBackend::try_new()?;
        let thread_pool = ThreadPool::spawn(backend.wake_fd())?;

        let mut sleep_sigmask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut sleep_sigmask);
            libc::sigaddset(&mut sleep_sigmask, libc::SIGALRM);
        }

        let reactor = Rc::new(Reactor {
            id,
            cfg: cfg.clone(),
            backend,
            aio: AioContext::try_new()?,
            signals: Signals::new(),
            thread_pool,
            chains: RefCell::new(ChainArena::new()),
            pending_tasks: RefCell::new(VecDeque::new()),
            high_priority_tasks: RefCell::new(VecDeque::new()),
            at_destroy_tasks: RefCell::new(Vec::new()),
            exit_funcs: RefCell::new(Vec::new()),
            steady_timers: RefCell::new(TimerService::new()),
            lowres_timers: RefCell::new(TimerService::new()),
            pollers: RefCell::new(Vec::new()),
            smp,
            io_queue: RefCell::new(None),
            stopping: Cell::new(false),
            stopped: Cell::new(false),
            return_code: Cell::new(0),
            tasks_processed: Cell::new(0),
            fsyncs: Cell::new(0),
            strict_dma: Cell::new(cfg.strict_dma),
            quota_timer: RefCell::new(None),
            lowres_update_timer: RefCell::new(None),
            sleep_sigmask,
        });

        REACTOR.with(|slot| *slot.borrow_mut() = Some(Rc::clone(&reactor)));
        reactor.smp.register_shard(id, reactor.backend.wake_fd());

        reactor.register_builtin_pollers();
        if let Err(e) = reactor.arm_task_quota_timer() {
            reactor.smp.unregister_shard(id);
            REACTOR.with(|slot| slot.borrow_mut().take());
            return Err(e);
        }
        reactor.start_lowres_clock();

        if let Some(queue) = reactor.smp.make_io_queue(id) {
            *reactor.io_queue.borrow_mut() = Some(queue);
        }

        Ok(reactor)
    }

    /// Uninstalls and drops this thread's reactor.
    pub(crate) fn deinitialize() {
        let reactor = REACTOR.with(|slot| slot.borrow_mut().take());
        if let Some(reactor) = reactor {
            reactor.run_at_destroy_tasks();
            drop(reactor);
        }
    }

    fn register_builtin_pollers(&self) {
        // Registration order is poll order: cross-shard work first so
        // remote requests land before local I/O flushes.
        self.register_poller(Rc::new(SmpPoller));
        self.register_poller(Rc::new(AioSubmitPoller));
        self.register_poller(Rc::new(AioCompletionPoller));
        self.register_poller(Rc::new(ThreadPoolPoller));
        self.register_poller(Rc::new(SignalPoller));
        self.register_poller(Rc::new(LowresTimerPoller));
        self.register_poller(Rc::new(EpollPoller));
    }

    fn arm_task_quota_timer(&self) -> Result<()> {
        signals::install_task_quota_handler()?;
        let timer = sys::ThreadTimer::new_thread_signal(libc::SIGALRM)?;
        timer.arm_periodic(self.cfg.task_quota)?;
        *self.quota_timer.borrow_mut() = Some(timer);
        Ok(())
    }

    /// Shard 0 drives the coarse clock for everyone.
    fn start_lowres_clock(&self) {
        LowresClock::update();
        if self.id != 0 {
            return;
        }
        let mut timer = Timer::<SteadyClock>::new(LowresClock::update);
        timer.arm_periodic(LOWRES_GRANULARITY);
        *self.lowres_update_timer.borrow_mut() = Some(timer);
    }

    pub fn cpu_id(&self) -> ShardId {
        self.id
    }

    pub(crate) fn smp(&self) -> &Arc<SmpContext> {
        &self.smp
    }

    pub(crate) fn backend(&self) -> &EpollBackend {
        &self.backend
    }

    pub(crate) fn thread_pool(&self) -> &ThreadPool {
        &self.thread_pool
    }

    pub(crate) fn signals(&self) -> &Signals {
        &self.signals
    }

    pub(crate) fn home_io_queue(&self) -> Option<Rc<IoQueue>> {
        self.io_queue.borrow().clone()
    }

    pub(crate) fn steady_timers(&self) -> &RefCell<TimerService<SteadyClock>> {
        &self.steady_timers
    }

    pub(crate) fn lowres_timers(&self) -> &RefCell<TimerService<LowresClock>> {
        &self.lowres_timers
    }

    pub(crate) fn with_chains<R>(&self, f: impl FnOnce(&mut ChainArena) -> R) -> R {
        f(&mut self.chains.borrow_mut())
    }

    /// Sets the "strict DMA" flag: when true, file I/O refuses to fall back
    /// to buffered I/O on filesystems without O_DIRECT support.
    pub fn set_strict_dma(&self, value: bool) {
        self.strict_dma.set(value);
    }

    pub(crate) fn strict_dma(&self) -> bool {
        self.strict_dma.get()
    }

    pub(crate) fn count_fsync(&self) {
        self.fsyncs.set(self.fsyncs.get() + 1);
    }

    // --- task queues ---

    pub(crate) fn add_task(&self, task: Box<dyn Task>) {
        self.pending_tasks.borrow_mut().push_back(task);
    }

    /// Runs ahead of the regular queue between tasks, never mid-task.
    pub(crate) fn add_high_priority_task(&self, task: Box<dyn Task>) {
        self.high_priority_tasks.borrow_mut().push_back(task);
    }

    fn have_tasks(&self) -> bool {
        !self.pending_tasks.borrow().is_empty() || !self.high_priority_tasks.borrow().is_empty()
    }

    fn pop_task(&self) -> Option<Box<dyn Task>> {
        if let Some(task) = self.high_priority_tasks.borrow_mut().pop_front() {
            return Some(task);
        }
        self.pending_tasks.borrow_mut().pop_front()
    }

    /// Drains ready tasks until the quota slice trips. Tasks enqueued while
    /// draining run in the same batch.
    fn run_some_tasks(&self) {
        if !self.have_tasks() {
            return;
        }
        signals::reset_task_quota();
        while let Some(task) = self.pop_task() {
            task.run();
            self.tasks_processed.set(self.tasks_processed.get() + 1);
            if signals::task_quota_finished() {
                break;
            }
        }
    }

    // --- lifecycle hooks ---

    /// Registers a function run during graceful shutdown, before the
    /// reactor terminates.
    pub fn at_exit<F: FnOnce() -> Future<()> + 'static>(&self, func: F) {
        assert!(!self.stopping.get(), "at_exit after stop");
        self.exit_funcs.borrow_mut().push(Box::new(func));
    }

    /// Registers a function run as the reactor is torn down.
    pub fn at_destroy<F: FnOnce() + 'static>(&self, func: F) {
        self.at_destroy_tasks.borrow_mut().push(make_task(func));
    }

    fn run_at_destroy_tasks(&self) {
        for task in self.at_destroy_tasks.borrow_mut().drain(..) {
            task.run();
        }
    }

    /// Begins graceful shutdown: stops accepting new work, runs exit hooks
    /// in registration order, then lets `run` return.
    pub fn stop(&self) {
        if self.stopping.replace(true) {
            return;
        }
        let funcs: VecDeque<_> = self.exit_funcs.borrow_mut().drain(..).collect();
        let funcs = Rc::new(RefCell::new(funcs));
        self.add_task(make_task(move || {
            let funcs_check = funcs.clone();
            let funcs_pop = funcs.clone();
            crate::future::do_until(
                move || funcs_check.borrow().is_empty(),
                move || match funcs_pop.borrow_mut().pop_front() {
                    Some(f) => f(),
                    None => ready(()),
                },
            )
            .then_wrapped(move |f| {
                if let Err(e) = f.into_result() {
                    tracing::warn!("exit hook failed: {:#}", e);
                }
                Reactor::local().stopped.set(true);
                ready(())
            })
            .ignore_ready_future();
        }));
    }

    pub fn exit(&self, ret: i32) {
        self.return_code.set(ret);
        self.stop();
    }

    // --- pollers and the loop ---

    pub fn register_poller(&self, poller: Rc<dyn Poller>) {
        self.pollers.borrow_mut().push(poller);
    }

    fn poller_snapshot(&self) -> SmallVec<[Rc<dyn Poller>; 8]> {
        self.pollers.borrow().iter().cloned().collect()
    }

    /// One non-blocking pass over every poller, in registration order.
    fn poll_once(&self) -> bool {
        let mut work = false;
        for poller in self.poller_snapshot() {
            work |= poller.poll();
        }
        work
    }

    fn complete_timers<C: TimerClock>(&self) -> bool {
        let now = C::now();
        let due = C::service(self).borrow_mut().expire(now);
        let mut fired = false;
        for id in due {
            let callback = C::service(self).borrow_mut().begin_fire(id, now);
            if let Some(mut callback) = callback {
                fired = true;
                callback();
                C::service(self).borrow_mut().finish_fire(id, callback);
            }
        }
        fired
    }

    fn sleep_timeout_ms(&self) -> Option<i32> {
        let mut timeout: Option<u64> = None;
        if let Some(t) = self.steady_timers.borrow().next_timeout() {
            let now = <SteadyClock as Clock>::now();
            // Round up so the wait covers the expiry instead of waking a
            // fraction of a millisecond early to spin.
            let ms = t.saturating_sub(now).div_ceil(1_000_000);
            timeout = Some(ms);
        }
        if let Some(t) = self.lowres_timers.borrow().next_timeout() {
            let now = <LowresClock as Clock>::now();
            let ms = t.saturating_sub(now);
            timeout = Some(timeout.map_or(ms, |cur| cur.min(ms)));
        }
        timeout.map(|ms| ms.min(i32::MAX as u64) as i32)
    }

    /// Enters interrupt mode if every poller permits it, parking in
    /// `epoll_pwait` until a wakeup or the next timer expiry.
    fn try_sleep(&self) {
        let pollers = self.poller_snapshot();
        let mut entered: SmallVec<[&Rc<dyn Poller>; 8]> = SmallVec::new();
        for poller in &pollers {
            if poller.try_enter_interrupt_mode() {
                entered.push(poller);
            } else {
                for p in entered.into_iter().rev() {
                    p.exit_interrupt_mode();
                }
                return;
            }
        }
        self.smp.shard(self.id).set_sleeping(true);
        if !self.have_tasks() {
            let timeout = self.sleep_timeout_ms();
            self.backend
                .wait_and_process(timeout, Some(&self.sleep_sigmask));
        }
        self.smp.shard(self.id).set_sleeping(false);
        for p in entered.into_iter().rev() {
            p.exit_interrupt_mode();
        }
    }

    /// The reactor loop. Returns once `done` reports true with no runnable
    /// tasks left.
    pub(crate) fn main_loop(&self, mut done: impl FnMut() -> bool) {
        loop {
            self.run_some_tasks();
            if done() && !self.have_tasks() {
                return;
            }
            self.complete_timers::<SteadyClock>();
            let work = self.poll_once();
            if work || self.have_tasks() {
                continue;
            }
            if done() {
                return;
            }
            if !self.cfg.poll_mode {
                self.try_sleep();
            }
        }
    }

    /// Runs the loop until the future produced by `make` resolves.
    pub(crate) fn run_until<T: 'static>(
        &self,
        make: impl FnOnce() -> Future<T>,
    ) -> std::result::Result<T, Fault> {
        let result: Rc<RefCell<Option<std::result::Result<T, Fault>>>> =
            Rc::new(RefCell::new(None));
        let result2 = Rc::clone(&result);
        make()
            .then_wrapped(move |f| {
                *result2.borrow_mut() = Some(f.into_result());
                ready(())
            })
            .ignore_ready_future();
        self.main_loop(|| result.borrow().is_some());
        let ret = result.borrow_mut().take().expect("loop exited without result");
        ret
    }

    /// Runs until `exit` / graceful shutdown; returns the exit code.
    pub(crate) fn run(&self) -> i32 {
        self.main_loop(|| self.stopped.get());
        self.return_code.get()
    }

    // --- AIO entry points ---

    /// Queues a raw AIO operation, bounded by the per-shard slot count.
    pub(crate) fn submit_io<F>(&self, prepare: F) -> Future<usize>
    where
        F: FnOnce(&mut Iocb) + 'static,
    {
        self.aio
            .wait_slot()
            .then(move |()| Reactor::local().aio.enqueue(prepare))
    }

    /// Queues a metered read through the fair I/O queue.
    pub(crate) fn submit_io_read<F>(
        &self,
        pc: crate::io_queue::IoPriorityClass,
        len: usize,
        prepare: F,
    ) -> Future<usize>
    where
        F: FnOnce(&mut Iocb) + Send + 'static,
    {
        let c = &self.aio.counters;
        c.reads.set(c.reads.get() + 1);
        c.read_bytes.set(c.read_bytes.get() + len as u64);
        IoQueue::queue_request(pc, len, prepare)
    }

    /// Queues a metered write through the fair I/O queue.
    pub(crate) fn submit_io_write<F>(
        &self,
        pc: crate::io_queue::IoPriorityClass,
        len: usize,
        prepare: F,
    ) -> Future<usize>
    where
        F: FnOnce(&mut Iocb) + Send + 'static,
    {
        let c = &self.aio.counters;
        c.writes.set(c.writes.get() + 1);
        c.write_bytes.set(c.write_bytes.get() + len as u64);
        IoQueue::queue_request(pc, len, prepare)
    }
}

// --- built-in pollers ---
// Zero-sized: each step re-resolves the thread's reactor, so no poller
// keeps the reactor alive through an Rc cycle.

struct SmpPoller;

impl Poller for SmpPoller {
    fn poll(&self) -> bool {
        let reactor = Reactor::local();
        let smp = Arc::clone(reactor.smp());
        smp.poll_queues(reactor.cpu_id())
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        let reactor = Reactor::local();
        let smp = Arc::clone(reactor.smp());
        let id = reactor.cpu_id();
        // Publish sleeping first, then recheck: a sender observes either the
        // flag (and writes the eventfd) or our recheck observes its item.
        smp.shard(id).set_sleeping(true);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        if smp.have_incoming(id) {
            smp.shard(id).set_sleeping(false);
            return false;
        }
        true
    }

    fn exit_interrupt_mode(&self) {
        let reactor = Reactor::local();
        reactor.smp().shard(reactor.cpu_id()).set_sleeping(false);
    }
}

struct AioSubmitPoller;

impl Poller for AioSubmitPoller {
    fn poll(&self) -> bool {
        Reactor::local().aio.flush_pending()
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        !Reactor::local().aio.has_pending()
    }
}

struct AioCompletionPoller;

impl Poller for AioCompletionPoller {
    fn poll(&self) -> bool {
        Reactor::local().aio.process_completions()
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        // Completions are only discovered by polling; a reactor with I/O in
        // flight must keep spinning.
        Reactor::local().aio.in_flight() == 0
    }
}

struct ThreadPoolPoller;

impl Poller for ThreadPoolPoller {
    fn poll(&self) -> bool {
        Reactor::local().thread_pool.complete()
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        // The worker writes the wakeup eventfd on completion.
        true
    }
}

struct SignalPoller;

impl Poller for SignalPoller {
    fn poll(&self) -> bool {
        Reactor::local().signals.poll_signal()
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        !Reactor::local().signals.pure_poll_signal()
    }
}

struct LowresTimerPoller;

impl Poller for LowresTimerPoller {
    fn poll(&self) -> bool {
        Reactor::local().complete_timers::<LowresClock>()
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        // The epoll timeout is bounded by the next lowres expiry.
        true
    }
}

struct EpollPoller;

impl Poller for EpollPoller {
    fn poll(&self) -> bool {
        Reactor::local().backend.wait_and_process(Some(0), None)
    }

    fn try_enter_interrupt_mode(&self) -> bool {
        // epoll is the sleep primitive itself.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;

    #[test]
    fn test_high_priority_tasks_run_first() -> Result<()> {
        let runtime = Builder::new().try_build()?;
        let order = runtime.block_on(|| {
            let reactor = Reactor::local();
            let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
            for name in ["n1", "n2"] {
                let log = Rc::clone(&log);
                reactor.add_task(make_task(move || log.borrow_mut().push(name)));
            }
            for name in ["h1", "h2"] {
                let log = Rc::clone(&log);
                reactor.add_high_priority_task(make_task(move || log.borrow_mut().push(name)));
            }
            let log2 = Rc::clone(&log);
            // This map lands behind everything queued above.
            ready(()).map(move |()| log2.borrow().clone())
        })?;
        // The high-priority side queue pre-empts every normal task queued
        // at or before its enqueue.
        assert_eq!(order, vec!["h1", "h2", "n1", "n2"]);
        Ok(())
    }

    #[test]
    fn test_user_poller_is_polled_each_turn() -> Result<()> {
        struct CountingPoller(Cell<u32>);
        impl Poller for CountingPoller {
            fn poll(&self) -> bool {
                self.0.set(self.0.get() + 1);
                false
            }
            fn try_enter_interrupt_mode(&self) -> bool {
                true
            }
        }

        let runtime = Builder::new().try_build()?;
        let polled = runtime.block_on(|| {
            let poller = Rc::new(CountingPoller(Cell::new(0)));
            Reactor::local().register_poller(Rc::clone(&poller) as Rc<dyn Poller>);
            crate::sleep::sleep(std::time::Duration::from_millis(5))
                .map(move |()| poller.0.get())
        })?;
        assert!(polled > 0, "registered poller never polled");
        Ok(())
    }

    #[test]
    fn test_future_fulfilled_in_task_runs_after_queued_tasks() -> Result<()> {
        let runtime = Builder::new().try_build()?;
        let order = runtime.block_on(|| {
            let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
            let reactor = Reactor::local();
            let mut pr = crate::future::Promise::<()>::new();
            let waiter = {
                let log = Rc::clone(&log);
                pr.get_future().map(move |()| log.borrow_mut().push(3))
            };
            {
                // Task T fulfils the promise; the continuation must run
                // after T and after everything already queued.
                let log = Rc::clone(&log);
                let mut pr = Some(pr);
                reactor.add_task(make_task(move || {
                    log.borrow_mut().push(1);
                    pr.take().expect("fulfil once").set_value(());
                }));
            }
            {
                let log = Rc::clone(&log);
                reactor.add_task(make_task(move || log.borrow_mut().push(2)));
            }
            let log2 = Rc::clone(&log);
            waiter.map(move |()| log2.borrow().clone())
        })?;
        assert_eq!(order, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_tasks_processed_counter_advances() -> Result<()> {
        let runtime = Builder::new().try_build()?;
        let processed = runtime.block_on(|| {
            let before = Reactor::local().tasks_processed.get();
            ready(())
                .map(|()| ())
                .map(move |()| Reactor::local().tasks_processed.get() - before)
        })?;
        assert!(processed >= 1);
        Ok(())
    }
}
