//! Signal handling: a process-wide pending mask written from the signal
//! handler, drained by the signal poller on the shard that registered a
//! handler. The task-quota SIGALRM is special-cased into a thread-local
//! flag checked between tasks.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static PENDING_SIGNALS: AtomicU64 = AtomicU64::new(0);

extern "C" fn note_signal(signo: libc::c_int) {
    PENDING_SIGNALS.fetch_or(1 << signo as u64, Ordering::SeqCst);
}

thread_local! {
    static TASK_QUOTA_FINISHED: AtomicBool = const { AtomicBool::new(false) };
}

extern "C" fn note_task_quota(_signo: libc::c_int) {
    // Const-initialized TLS: no lazy init runs inside the handler.
    TASK_QUOTA_FINISHED.with(|f| f.store(true, Ordering::Relaxed));
}

/// Clears and returns the task-quota flag for this thread.
pub(crate) fn reset_task_quota() -> bool {
    TASK_QUOTA_FINISHED.with(|f| f.swap(false, Ordering::Relaxed))
}

pub(crate) fn task_quota_finished() -> bool {
    TASK_QUOTA_FINISHED.with(|f| f.load(Ordering::Relaxed))
}

/// Installs the per-thread task-quota handler; each shard arms its own
/// SIGALRM interval timer against it.
pub(crate) fn install_task_quota_handler() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(note_task_quota),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGALRM, &action)? };
    Ok(())
}

pub(crate) struct Signals {
    handlers: RefCell<HashMap<i32, Box<dyn FnMut()>>>,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn handle_signal<F: FnMut() + 'static>(
        &self,
        signal: Signal,
        handler: F,
    ) -> anyhow::Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(note_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(signal, &action)? };
        self.handlers
            .borrow_mut()
            .insert(signal as i32, Box::new(handler));
        Ok(())
    }

    /// Runs handlers for every signal noted since the last poll. Returns
    /// whether any fired.
    pub(crate) fn poll_signal(&self) -> bool {
        let pending = PENDING_SIGNALS.swap(0, Ordering::SeqCst);
        if pending == 0 {
            return false;
        }
        let mut fired = false;
        for signo in 0..64 {
            if pending & (1 << signo) != 0 {
                // Run outside the map borrow; a handler may register others.
                let handler = self.handlers.borrow_mut().remove(&signo);
                if let Some(mut handler) = handler {
                    handler();
                    fired = true;
                    self.handlers.borrow_mut().entry(signo).or_insert(handler);
                }
            }
        }
        fired
    }

    pub(crate) fn pure_poll_signal(&self) -> bool {
        PENDING_SIGNALS.load(Ordering::SeqCst) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noted_signal_dispatches_once() {
        let signals = Signals::new();
        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let fired2 = std::rc::Rc::clone(&fired);
        signals
            .handle_signal(Signal::SIGUSR2, move || fired2.set(fired2.get() + 1))
            .unwrap();

        note_signal(libc::SIGUSR2);
        assert!(signals.poll_signal());
        assert!(!signals.poll_signal());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_task_quota_flag_roundtrip() {
        assert!(!task_quota_finished());
        note_task_quota(libc::SIGALRM);
        assert!(task_quota_finished());
        assert!(reset_task_quota());
        assert!(!task_quota_finished());
    }
}
