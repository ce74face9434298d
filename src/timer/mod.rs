//! Deferred callbacks on two clocks.
//!
//! Timers live in a per-shard, per-clock timer set: 65 buckets keyed by the
//! highest bit in which an expiry differs from the set's last processing
//! point. Insertion is O(1), cancellation is O(1) (the bucket entry goes
//! stale and is skipped at expiry), and expiring the nearest buckets is
//! amortized O(1) for monotone insertions.

use crate::clock::{Clock, LowresClock, SteadyClock, Tick};
use crate::reactor::Reactor;
use slab::Slab;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::time::Duration;

const N_BUCKETS: usize = 65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerId {
    index: usize,
    gen: u64,
}

pub(crate) struct TimerSet {
    buckets: Vec<Vec<(TimerId, Tick)>>,
    non_empty: u128,
    last: Tick,
    next: Tick,
}

impl TimerSet {
    pub(crate) fn new() -> Self {
        Self {
            buckets: (0..N_BUCKETS).map(|_| Vec::new()).collect(),
            non_empty: 0,
            last: 0,
            next: Tick::MAX,
        }
    }

    fn index_of(&self, t: Tick) -> usize {
        if t <= self.last {
            N_BUCKETS - 1
        } else {
            (t ^ self.last).leading_zeros() as usize
        }
    }

    pub(crate) fn insert(&mut self, id: TimerId, expiry: Tick) {
        let idx = self.index_of(expiry);
        self.buckets[idx].push((id, expiry));
        self.non_empty |= 1 << idx;
        if expiry < self.next {
            self.next = expiry;
        }
    }

    /// Earliest possibly-pending expiry. May be stale after cancellations,
    /// which only makes the reactor wake early.
    pub(crate) fn next_timeout(&self) -> Option<Tick> {
        if self.non_empty == 0 {
            None
        } else {
            Some(self.next.max(self.last))
        }
    }

    /// Pops every entry with `expiry <= now`. Entries in the bucket `now`
    /// falls into are re-sorted against the advanced `last` point.
    pub(crate) fn expire(&mut self, now: Tick) -> Vec<TimerId> {
        if self.non_empty == 0 {
            self.last = now;
            return Vec::new();
        }
        let idx = self.index_of(now);
        let mut expired = Vec::new();
        for i in (idx + 1)..N_BUCKETS {
            if self.non_empty & (1 << i) != 0 {
                expired.extend(self.buckets[i].drain(..).map(|(id, _)| id));
                self.non_empty &= !(1 << i);
            }
        }
        self.last = now;
        self.next = Tick::MAX;
        let mixed = std::mem::take(&mut self.buckets[idx]);
        self.non_empty &= !(1 << idx);
        for (id, expiry) in mixed {
            if expiry <= now {
                expired.push(id);
            } else {
                self.insert(id, expiry);
            }
        }
        expired
    }
}

struct TimerEntry {
    gen: u64,
    expiry: Tick,
    period: Option<Tick>,
    callback: Option<Box<dyn FnMut()>>,
    armed: bool,
    /// Entry is removed after its one shot instead of waiting for a handle
    /// drop; used by handle-less timers such as `sleep`.
    auto_remove: bool,
}

/// Per-shard timer registrations for one clock. Held by the reactor; user
/// code goes through `Timer`.
#[doc(hidden)]
pub struct TimerService<C: Clock> {
    set: TimerSet,
    entries: Slab<TimerEntry>,
    next_gen: u64,
    _clock: PhantomData<C>,
}

impl<C: Clock> TimerService<C> {
    pub(crate) fn new() -> Self {
        Self {
            set: TimerSet::new(),
            entries: Slab::new(),
            next_gen: 1,
            _clock: PhantomData,
        }
    }

    fn create(&mut self, callback: Box<dyn FnMut()>, auto_remove: bool) -> TimerId {
        let gen = self.next_gen;
        self.next_gen += 1;
        let index = self.entries.insert(TimerEntry {
            gen,
            expiry: 0,
            period: None,
            callback: Some(callback),
            armed: false,
            auto_remove,
        });
        TimerId { index, gen }
    }

    fn entry_mut(&mut self, id: TimerId) -> Option<&mut TimerEntry> {
        self.entries.get_mut(id.index).filter(|e| e.gen == id.gen)
    }

    fn arm(&mut self, id: TimerId, expiry: Tick, period: Option<Tick>) {
        let entry = self.entry_mut(id).expect("arming a dead timer");
        assert!(!entry.armed, "timer already armed");
        entry.armed = true;
        entry.expiry = expiry;
        entry.period = period;
        self.set.insert(id, expiry);
    }

    /// Returns whether the timer was armed. The bucket entry goes stale and
    /// is skipped when its bucket expires.
    fn cancel(&mut self, id: TimerId) -> bool {
        match self.entry_mut(id) {
            Some(entry) if entry.armed => {
                entry.armed = false;
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, id: TimerId) {
        if self.entry_mut(id).is_some() {
            self.entries.remove(id.index);
        }
    }

    pub(crate) fn next_timeout(&self) -> Option<Tick> {
        self.set.next_timeout()
    }

    pub(crate) fn expire(&mut self, now: Tick) -> Vec<TimerId> {
        self.set.expire(now)
    }

    /// Takes the callback of a due timer, or `None` when the bucket entry
    /// was stale (cancelled or re-armed since).
    pub(crate) fn begin_fire(&mut self, id: TimerId, now: Tick) -> Option<Box<dyn FnMut()>> {
        let entry = self.entry_mut(id)?;
        if !entry.armed || entry.expiry > now {
            return None;
        }
        if entry.period.is_none() {
            entry.armed = false;
        }
        entry.callback.take()
    }

    /// Puts the callback back and re-queues periodic timers at
    /// `now + period`, measured after the callback returned, keeping a
    /// cancel issued inside the callback effective.
    pub(crate) fn finish_fire(&mut self, id: TimerId, callback: Box<dyn FnMut()>) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        entry.callback = Some(callback);
        match entry.period {
            Some(period) if entry.armed => {
                let expiry = C::now() + period;
                entry.expiry = expiry;
                self.set.insert(id, expiry);
            }
            _ => {
                if entry.auto_remove {
                    self.entries.remove(id.index);
                }
            }
        }
    }
}

/// Clocks a reactor keeps a timer set for.
pub trait TimerClock: Clock {
    #[doc(hidden)]
    fn service(reactor: &Reactor) -> &RefCell<TimerService<Self>>
    where
        Self: Sized;
}

impl TimerClock for SteadyClock {
    fn service(reactor: &Reactor) -> &RefCell<TimerService<SteadyClock>> {
        reactor.steady_timers()
    }
}

impl TimerClock for LowresClock {
    fn service(reactor: &Reactor) -> &RefCell<TimerService<LowresClock>> {
        reactor.lowres_timers()
    }
}

/// A deferred callback on clock `C`. The handle owns the registration:
/// dropping it cancels and frees the timer.
pub struct Timer<C: TimerClock = SteadyClock> {
    id: TimerId,
    _clock: PhantomData<C>,
}

impl<C: TimerClock> Timer<C> {
    pub fn new<F: FnMut() + 'static>(callback: F) -> Self {
        let reactor = Reactor::local();
        let id = C::service(&reactor)
            .borrow_mut()
            .create(Box::new(callback), false);
        Timer { id, _clock: PhantomData }
    }

    /// Arms for a single firing at `delta` from now. Panics if armed.
    pub fn arm(&mut self, delta: Duration) {
        self.arm_at(C::now() + C::ticks(delta), None);
    }

    /// Arms for periodic firing every `delta`, first firing at `delta` from
    /// now. Each next firing is scheduled after the callback returns.
    pub fn arm_periodic(&mut self, delta: Duration) {
        let ticks = C::ticks(delta);
        self.arm_at(C::now() + ticks, Some(ticks));
    }

    /// Cancels if armed, then arms again.
    pub fn rearm(&mut self, delta: Duration) {
        self.cancel();
        self.arm(delta);
    }

    pub fn cancel(&mut self) -> bool {
        let reactor = Reactor::local();
        let cancelled = C::service(&reactor).borrow_mut().cancel(self.id);
        cancelled
    }

    fn arm_at(&mut self, expiry: Tick, period: Option<Tick>) {
        let reactor = Reactor::local();
        C::service(&reactor).borrow_mut().arm(self.id, expiry, period);
    }
}

impl<C: TimerClock> Drop for Timer<C> {
    fn drop(&mut self) {
        // The service is gone along with the reactor during teardown.
        if let Some(reactor) = Reactor::try_local() {
            let mut service = C::service(&reactor).borrow_mut();
            service.cancel(self.id);
            service.remove(self.id);
        }
    }
}

/// Arms a handle-less one-shot timer; the registration frees itself after
/// firing.
pub(crate) fn arm_oneshot<C: TimerClock, F: FnOnce() + 'static>(delta: Duration, f: F) {
    let reactor = Reactor::local();
    let mut service = C::service(&reactor).borrow_mut();
    let mut f = Some(f);
    let id = service.create(
        Box::new(move || {
            if let Some(f) = f.take() {
                f()
            }
        }),
        true,
    );
    service.arm(id, C::now() + C::ticks(delta), None);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(set: &mut TimerSet, now: Tick) -> Vec<usize> {
        let mut ids: Vec<usize> = set.expire(now).into_iter().map(|id| id.index).collect();
        ids.sort_unstable();
        ids
    }

    fn tid(index: usize) -> TimerId {
        TimerId { index, gen: 1 }
    }

    #[test]
    fn test_set_expires_only_due_entries() {
        let mut set = TimerSet::new();
        set.insert(tid(1), 100);
        set.insert(tid(2), 200);
        set.insert(tid(3), 1_000_000);
        assert_eq!(set.next_timeout(), Some(100));

        assert_eq!(drain(&mut set, 150), vec![1]);
        assert_eq!(drain(&mut set, 250), vec![2]);
        assert_eq!(drain(&mut set, 999_999), Vec::<usize>::new());
        assert_eq!(drain(&mut set, 1_000_000), vec![3]);
        assert_eq!(set.next_timeout(), None);
    }

    #[test]
    fn test_set_handles_equal_and_past_expiries() {
        let mut set = TimerSet::new();
        set.expire(500);
        // Armed in the past relative to `last`: lands in the overflow bucket
        // and fires on the next expiry pass.
        set.insert(tid(1), 10);
        set.insert(tid(2), 500);
        assert_eq!(drain(&mut set, 500), vec![1, 2]);
    }

    #[test]
    fn test_set_monotone_inserts_many() {
        let mut set = TimerSet::new();
        for i in 0..1000u64 {
            set.insert(TimerId { index: i as usize, gen: 1 }, 1000 + i * 7);
        }
        let mut seen = Vec::new();
        let mut now = 0;
        while seen.len() < 1000 {
            now += 333;
            seen.extend(set.expire(now));
            assert!(now < 20_000, "wheel failed to drain");
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_service_cancel_makes_bucket_entry_stale() {
        let mut service: TimerService<SteadyClock> = TimerService::new();
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired2 = std::rc::Rc::clone(&fired);
        let id = service.create(Box::new(move || fired2.set(true)), false);
        service.arm(id, 100, None);
        assert!(service.cancel(id));
        for due in service.expire(200) {
            assert!(service.begin_fire(due, 200).is_none());
        }
        assert!(!fired.get());
    }

    #[test]
    fn test_oneshot_timer_fires_once_at_or_after_expiry() -> anyhow::Result<()> {
        use crate::runtime::Builder;
        use std::cell::Cell;
        use std::time::{Duration, Instant};

        let runtime = Builder::new().try_build()?;
        let (fired, elapsed_ok) = runtime.block_on(|| {
            let fired = std::rc::Rc::new(Cell::new(0u32));
            let fired2 = std::rc::Rc::clone(&fired);
            let armed_at = Instant::now();
            let elapsed_ok = std::rc::Rc::new(Cell::new(false));
            let elapsed_ok2 = std::rc::Rc::clone(&elapsed_ok);
            let mut timer = Timer::<SteadyClock>::new(move || {
                fired2.set(fired2.get() + 1);
                elapsed_ok2.set(armed_at.elapsed() >= Duration::from_millis(10));
            });
            timer.arm(Duration::from_millis(10));
            // Outlive several would-be periods to prove it stays one-shot.
            crate::sleep::sleep(Duration::from_millis(50)).map(move |()| {
                let _ = &timer;
                (fired.get(), elapsed_ok.get())
            })
        })?;
        assert_eq!(fired, 1);
        assert!(elapsed_ok, "timer fired before its expiry");
        Ok(())
    }

    #[test]
    fn test_periodic_timer_firings_spaced_by_period() -> anyhow::Result<()> {
        use crate::runtime::Builder;
        use std::time::{Duration, Instant};

        let runtime = Builder::new().try_build()?;
        let stamps = runtime.block_on(|| {
            let stamps = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
            let stamps2 = std::rc::Rc::clone(&stamps);
            let mut timer = Timer::<SteadyClock>::new(move || {
                stamps2.borrow_mut().push(Instant::now());
            });
            timer.arm_periodic(Duration::from_millis(5));
            crate::sleep::sleep(Duration::from_millis(40)).map(move |()| {
                drop(timer);
                stamps.borrow().clone()
            })
        })?;
        assert!(stamps.len() >= 3, "periodic timer too slow: {}", stamps.len());
        // Re-armed after each callback at now + period: monotonic, spaced
        // by at least the period.
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(5));
        }
        Ok(())
    }

    #[test]
    fn test_cancelled_timer_never_fires() -> anyhow::Result<()> {
        use crate::runtime::Builder;
        use std::cell::Cell;
        use std::time::Duration;

        let runtime = Builder::new().try_build()?;
        let fired = runtime.block_on(|| {
            let fired = std::rc::Rc::new(Cell::new(false));
            let fired2 = std::rc::Rc::clone(&fired);
            let mut timer = Timer::<SteadyClock>::new(move || fired2.set(true));
            timer.arm(Duration::from_millis(5));
            assert!(timer.cancel());
            crate::sleep::sleep(Duration::from_millis(20)).map(move |()| {
                let _ = &timer;
                fired.get()
            })
        })?;
        assert!(!fired);
        Ok(())
    }

    #[test]
    fn test_lowres_timer_fires_via_coarse_clock() -> anyhow::Result<()> {
        use crate::clock::LowresClock;
        use crate::runtime::Builder;
        use std::cell::Cell;
        use std::time::Duration;

        let runtime = Builder::new().try_build()?;
        let fired = runtime.block_on(|| {
            let fired = std::rc::Rc::new(Cell::new(false));
            let fired2 = std::rc::Rc::clone(&fired);
            let mut timer = Timer::<LowresClock>::new(move || fired2.set(true));
            timer.arm(Duration::from_millis(20));
            // The coarse clock advances in 10ms steps driven by shard 0.
            crate::sleep::sleep(Duration::from_millis(80)).map(move |()| {
                let _ = &timer;
                fired.get()
            })
        })?;
        assert!(fired);
        Ok(())
    }

    #[test]
    fn test_service_periodic_rearms_after_fire() {
        let mut service: TimerService<LowresClock> = TimerService::new();
        crate::clock::LowresClock::update();
        let id = service.create(Box::new(|| {}), false);
        let now = <LowresClock as Clock>::now();
        service.arm(id, now + 5, Some(5));

        let due = service.expire(now + 6);
        assert_eq!(due.len(), 1);
        let cb = service.begin_fire(due[0], now + 6).expect("timer due");
        service.finish_fire(due[0], cb);
        // Re-armed: a next timeout exists and lies in the future.
        assert!(service.next_timeout().expect("rearmed") >= now + 5);
    }
}
