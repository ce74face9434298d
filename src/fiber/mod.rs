//! Stackful fibers: an execution environment where waiting is tolerated.
//!
//! A fiber runs a plain callable on its own 128 KiB stack; calling
//! `Future::get()` on a not-ready future parks the fiber, attaches a
//! continuation that will switch back into it, and returns control to the
//! reactor. Fibers are cooperative, shard-pinned, and may not issue
//! blocking system calls.

use crate::clock::SteadyClock;
use crate::error::Fault;
use crate::future::{ChainHandle, Future, Promise};
use crate::reactor::{signals, Reactor};
use crate::task::make_task;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[cfg(target_arch = "x86_64")]
mod arch;
#[cfg(not(target_arch = "x86_64"))]
compile_error!("stackful fibers are implemented for x86_64 only");

use arch::SavedRegs;

const FIBER_STACK_SIZE: usize = 128 * 1024;

struct FiberContext {
    regs: SavedRegs,
    parent: SavedRegs,
    /// Fiber that was current when this one was switched in; restored on
    /// switch-out, so fibers may nest.
    prev: *mut FiberContext,
    #[allow(dead_code)]
    stack: Box<[u8]>,
    func: Option<Box<dyn FnOnce()>>,
    done: Option<Promise<()>>,
    group: Option<FiberSchedulingGroup>,
    finished: bool,
}

thread_local! {
    static CURRENT: Cell<*mut FiberContext> = const { Cell::new(std::ptr::null_mut()) };
}

extern "C" fn fiber_main(arg: usize) {
    let ctx = arg as *mut FiberContext;
    unsafe {
        let func = (*ctx).func.take().expect("fiber entered twice");
        func();
        (*ctx).finished = true;
        if let Some(mut done) = (*ctx).done.take() {
            done.set_value(());
        }
        switch_out(ctx);
    }
    unreachable!("finished fiber resumed");
}

/// Jumps into the fiber. Returns when the fiber parks or finishes.
///
/// # Safety
///
/// `ctx` must be a live, unfinished fiber not currently running.
unsafe fn switch_in(ctx: *mut FiberContext) {
    if let Some(group) = (*ctx).group.clone() {
        group.account_start();
    }
    (*ctx).prev = CURRENT.replace(ctx);
    arch::switch_context(&mut (*ctx).parent, &(*ctx).regs);
}

/// Called from inside the fiber: saves its state and resumes whoever
/// switched it in.
unsafe fn switch_out(ctx: *mut FiberContext) {
    if let Some(group) = (*ctx).group.clone() {
        group.account_stop();
    }
    CURRENT.set((*ctx).prev);
    arch::switch_context(&mut (*ctx).regs, &(*ctx).parent);
}

/// Resumes a parked fiber, deferring if its scheduling group has used up
/// this period's quota.
unsafe fn resume(ctx: *mut FiberContext) {
    let defer_until = (*ctx)
        .group
        .as_ref()
        .and_then(|group| group.next_scheduling_point());
    match defer_until {
        Some(when) => {
            let delay = when.saturating_duration_since(Instant::now());
            let ctx = ctx as usize;
            crate::timer::arm_oneshot::<SteadyClock, _>(delay, move || unsafe {
                resume(ctx as *mut FiberContext)
            });
        }
        None => switch_in(ctx),
    }
}

/// Parks the current fiber on a not-ready chain slot; resumed by the
/// attached continuation once the outcome is delivered.
pub(crate) fn park_on<T: 'static>(h: ChainHandle) -> Result<T, Fault> {
    let ctx = CURRENT.get();
    assert!(
        !ctx.is_null(),
        "Future::get() on a not-ready future outside a fiber"
    );

    let mut slot: Option<Result<T, Fault>> = None;
    let slot_ptr: *mut Option<Result<T, Fault>> = &mut slot;
    let ctx_addr = ctx as usize;
    let action = Reactor::local().with_chains(|chains| {
        chains.attach(
            h,
            Box::new(move |cv| {
                let outcome = match cv {
                    Ok(boxed) => Ok(crate::future::downcast::<T>(boxed)),
                    Err(e) => Err(e),
                };
                // Safety: the slot lives in the parked fiber's frame, which
                // stays alive until the switch below resumes it.
                unsafe {
                    *slot_ptr = Some(outcome);
                    resume(ctx_addr as *mut FiberContext);
                }
            }),
        )
    });
    crate::future::apply_ready(action);

    unsafe { switch_out(ctx) };
    slot.take().expect("fiber resumed without a value")
}

/// Voluntarily defers the current fiber behind the tasks already queued.
pub fn yield_now() {
    let ctx = CURRENT.get();
    assert!(!ctx.is_null(), "yield_now() outside a fiber");
    let ctx_addr = ctx as usize;
    Reactor::local().add_task(make_task(move || unsafe {
        resume(ctx_addr as *mut FiberContext)
    }));
    unsafe { switch_out(ctx) };
}

/// Whether the current fiber ought to call `yield_now()` soon.
pub fn should_yield() -> bool {
    let ctx = CURRENT.get();
    if ctx.is_null() {
        return false;
    }
    if signals::task_quota_finished() {
        return true;
    }
    unsafe { &*ctx }
        .group
        .as_ref()
        .is_some_and(|group| group.next_scheduling_point().is_some())
}

/// A running or finished fiber. The handle owns the stack; it must be
/// joined (or never started) before being dropped.
pub struct Fiber {
    ctx: *mut FiberContext,
    join_fut: Option<Future<()>>,
}

impl Fiber {
    /// Starts `func` in a new fiber. The callable begins executing
    /// immediately, on the new stack, and runs until it first parks or
    /// completes.
    pub fn spawn<F: FnOnce() + 'static>(func: F) -> Fiber {
        Self::spawn_with(FiberAttributes::default(), func)
    }

    pub fn spawn_with<F: FnOnce() + 'static>(attr: FiberAttributes, func: F) -> Fiber {
        let mut done = Promise::new();
        let join_fut = done.get_future();
        let ctx = Box::into_raw(Box::new(FiberContext {
            regs: SavedRegs::zeroed(),
            parent: SavedRegs::zeroed(),
            prev: std::ptr::null_mut(),
            stack: vec![0u8; FIBER_STACK_SIZE].into_boxed_slice(),
            func: Some(Box::new(func)),
            done: Some(done),
            group: attr.scheduling_group,
            finished: false,
        }));
        unsafe {
            let stack_top = (*ctx).stack.as_mut_ptr().add(FIBER_STACK_SIZE);
            arch::init_context(&mut (*ctx).regs, stack_top, fiber_main, ctx as usize);
            resume(ctx);
        }
        Fiber {
            ctx,
            join_fut: Some(join_fut),
        }
    }

    /// Resolves when the fiber's callable has returned.
    pub fn join(&mut self) -> Future<()> {
        self.join_fut.take().expect("fiber joined twice")
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        unsafe {
            assert!(
                (*self.ctx).finished,
                "fiber dropped while still running"
            );
            drop(Box::from_raw(self.ctx));
        }
    }
}

#[derive(Default)]
pub struct FiberAttributes {
    pub scheduling_group: Option<FiberSchedulingGroup>,
}

/// Runs `func` in a fiber; the returned future completes with `func`'s
/// return value after the fiber joins, and the stack is freed then.
pub fn run_fiber<T, F>(func: F) -> Future<T>
where
    T: 'static,
    F: FnOnce() -> T + 'static,
{
    run_fiber_with(FiberAttributes::default(), func)
}

pub fn run_fiber_with<T, F>(attr: FiberAttributes, func: F) -> Future<T>
where
    T: 'static,
    F: FnOnce() -> T + 'static,
{
    let mut promise = Promise::new();
    let result = promise.get_future();
    let mut fiber = Fiber::spawn_with(attr, move || promise.set_value(func()));
    let joined = fiber.join();
    joined.then(move |()| {
        drop(fiber);
        result
    })
}

struct GroupState {
    period: Duration,
    quota: Duration,
    this_period_ends: Instant,
    this_period_remain: Duration,
    this_run_start: Instant,
}

/// Caps a set of fibers to `usage` of each `period`: a fiber about to
/// resume past its quota is instead re-armed at the period boundary.
#[derive(Clone)]
pub struct FiberSchedulingGroup {
    state: Rc<RefCell<GroupState>>,
}

impl FiberSchedulingGroup {
    pub fn new(period: Duration, usage: f32) -> Self {
        let quota = period.mul_f32(usage.clamp(0.0, 1.0));
        let now = Instant::now();
        Self {
            state: Rc::new(RefCell::new(GroupState {
                period,
                quota,
                this_period_ends: now,
                this_period_remain: Duration::ZERO,
                this_run_start: now,
            })),
        }
    }

    fn account_start(&self) {
        let mut s = self.state.borrow_mut();
        let now = Instant::now();
        if now >= s.this_period_ends {
            s.this_period_ends = now + s.period;
            s.this_period_remain = s.quota;
        }
        s.this_run_start = now;
    }

    fn account_stop(&self) {
        let mut s = self.state.borrow_mut();
        let ran = s.this_run_start.elapsed();
        s.this_period_remain = s.this_period_remain.saturating_sub(ran);
    }

    /// `None` when the group may run now; otherwise the instant the next
    /// accounting window opens.
    fn next_scheduling_point(&self) -> Option<Instant> {
        let s = self.state.borrow();
        let now = Instant::now();
        if now >= s.this_period_ends || !s.this_period_remain.is_zero() {
            None
        } else {
            Some(s.this_period_ends)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::ready;
    use crate::runtime::Builder;
    use crate::sleep::sleep;

    #[test]
    fn test_fiber_runs_immediately_and_joins() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let value = runtime.block_on(|| {
            let ran = Rc::new(Cell::new(false));
            let ran2 = Rc::clone(&ran);
            let fut = run_fiber(move || {
                ran2.set(true);
                7
            });
            // The callable executes during spawn, before any task runs.
            assert!(ran.get());
            fut
        })?;
        assert_eq!(value, 7);
        Ok(())
    }

    #[test]
    fn test_get_parks_and_resumes_with_value() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let value = runtime.block_on(|| {
            run_fiber(|| {
                let v: i32 = ready(20).map(|x| x + 1).get().expect("chain ok");
                v * 2
            })
        })?;
        assert_eq!(value, 42);
        Ok(())
    }

    #[test]
    fn test_get_observes_failure() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let msg = runtime.block_on(|| {
            run_fiber(|| {
                let res: Result<(), Fault> =
                    ready(()).then(|()| crate::future::failed(anyhow::anyhow!("boom"))).get();
                res.unwrap_err().to_string()
            })
        })?;
        assert_eq!(msg, "boom");
        Ok(())
    }

    #[test]
    fn test_fiber_sleep_blocks_only_the_fiber() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let (slept_ms, side_ran) = runtime.block_on(|| {
            let side = Rc::new(Cell::new(false));
            let side2 = Rc::clone(&side);
            let main = run_fiber(|| {
                let start = std::time::Instant::now();
                sleep(Duration::from_millis(20)).get().expect("sleep ok");
                start.elapsed().as_millis() as u64
            });
            // Runs while the fiber is parked.
            let side_fut = sleep(Duration::from_millis(5)).map(move |()| side2.set(true));
            main.then(move |ms| side_fut.map(move |()| (ms, side.get())))
        })?;
        assert!(slept_ms >= 20);
        assert!(side_ran);
        Ok(())
    }

    #[test]
    fn test_nested_fibers() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let value = runtime.block_on(|| {
            run_fiber(|| {
                let inner = run_fiber(|| 21);
                inner.get().expect("inner fiber ok") * 2
            })
        })?;
        assert_eq!(value, 42);
        Ok(())
    }

    #[test]
    fn test_yield_now_defers_behind_queued_tasks() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let order = runtime.block_on(|| {
            let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
            let log2 = Rc::clone(&log);
            let log3 = Rc::clone(&log);
            // Queue a task first; the fiber body still runs before it (the
            // spawn is synchronous), but the yield defers behind it.
            let task = ready(()).map(move |()| log3.borrow_mut().push("task"));
            let fib = run_fiber(move || {
                log2.borrow_mut().push("fiber-before");
                yield_now();
                log2.borrow_mut().push("fiber-after");
            });
            let log4 = Rc::clone(&log);
            fib.then(move |()| task.map(move |()| log4.borrow().clone()))
        })?;
        assert_eq!(order, vec!["fiber-before", "task", "fiber-after"]);
        Ok(())
    }
}
