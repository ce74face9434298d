//! The runtime's two clocks.
//!
//! The steady clock is a monotonic high-resolution clock. The coarse clock
//! trades resolution for cost: shard 0 publishes the current time every
//! 10 ms through a cache-line-isolated atomic and every other shard reads
//! it with a relaxed load, so a large timer population never pays a clock
//! syscall per lookup.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Timestamps handed to the timer wheel: a monotonically increasing tick
/// count. Steady-clock ticks are nanoseconds, coarse-clock ticks are
/// milliseconds.
pub type Tick = u64;

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Clock sources the timer machinery is generic over.
pub trait Clock: 'static {
    /// Current time in this clock's ticks.
    fn now() -> Tick;

    /// Converts a duration to this clock's ticks, rounding up so a timer
    /// never fires early.
    fn ticks(d: Duration) -> Tick;

    /// Converts ticks back to a duration (for sleep-timeout computation).
    fn duration(ticks: Tick) -> Duration;
}

/// Monotonic high-resolution clock; ticks are nanoseconds since the first
/// use in this process.
pub struct SteadyClock;

impl SteadyClock {
    pub fn now() -> Instant {
        Instant::now()
    }
}

impl Clock for SteadyClock {
    fn now() -> Tick {
        origin().elapsed().as_nanos() as Tick
    }

    fn ticks(d: Duration) -> Tick {
        d.as_nanos() as Tick
    }

    fn duration(ticks: Tick) -> Duration {
        Duration::from_nanos(ticks)
    }
}

/// The coarse clock's resolution is 10 ms, but its tick is 1 ms so that
/// arithmetic with millisecond durations stays exact.
pub struct LowresClock;

pub(crate) const LOWRES_GRANULARITY: Duration = Duration::from_millis(10);

// Written by shard 0, read relaxed by every shard. Padded so the hardware
// prefetcher never drags a neighbouring shard's line along with it.
static LOWRES_NOW_MS: CachePadded<AtomicI64> = CachePadded::new(AtomicI64::new(0));

impl LowresClock {
    /// Publishes the current time. Called from shard 0's update timer and
    /// once at reactor startup so the clock is never observed at zero.
    pub(crate) fn update() {
        let ms = origin().elapsed().as_millis() as i64;
        LOWRES_NOW_MS.store(ms, Ordering::Relaxed);
    }
}

impl Clock for LowresClock {
    fn now() -> Tick {
        LOWRES_NOW_MS.load(Ordering::Relaxed) as Tick
    }

    fn ticks(d: Duration) -> Tick {
        d.as_millis() as Tick + u64::from(d.subsec_nanos() % 1_000_000 != 0)
    }

    fn duration(ticks: Tick) -> Duration {
        Duration::from_millis(ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_clock_monotonic() {
        let a = <SteadyClock as Clock>::now();
        let b = <SteadyClock as Clock>::now();
        assert!(b >= a);
    }

    #[test]
    fn test_lowres_clock_tracks_updates() {
        LowresClock::update();
        let a = <LowresClock as Clock>::now();
        std::thread::sleep(Duration::from_millis(15));
        LowresClock::update();
        let b = <LowresClock as Clock>::now();
        assert!(b >= a + 10, "expected at least 10ms advance, got {} -> {}", a, b);
    }

    #[test]
    fn test_ticks_round_up() {
        assert_eq!(LowresClock::ticks(Duration::from_millis(10)), 10);
        assert_eq!(LowresClock::ticks(Duration::from_micros(10_500)), 11);
        assert_eq!(SteadyClock::ticks(Duration::from_nanos(7)), 7);
    }
}
