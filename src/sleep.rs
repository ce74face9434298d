//! Futures that complete after a delay.

use crate::clock::SteadyClock;
use crate::future::{Future, Promise};
use crate::timer;
use std::time::Duration;

/// Returns a future which becomes ready once at least `dur` has elapsed.
pub fn sleep(dur: Duration) -> Future<()> {
    let mut promise = Promise::new();
    let fut = promise.get_future();
    timer::arm_oneshot::<SteadyClock, _>(dur, move || promise.set_value(()));
    fut
}
