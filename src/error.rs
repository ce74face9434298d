use std::io;

/// Failure payload carried along a future chain.
///
/// The runtime signals failure as a value rather than by unwinding: a failed
/// future holds one of these, `then` forwards it untouched, `then_wrapped`
/// observes it. Any error type can ride the chain through `anyhow`.
pub type Fault = anyhow::Error;

/// A centralized error type for reactor and I/O plane operations.
#[derive(thiserror::Error, Debug)]
pub enum ReactorError {
    /// Kernel error code from AIO or an epoll-driven syscall, with a short
    /// note about what was being attempted.
    #[error("{ctx}: {source}")]
    Sys {
        ctx: &'static str,
        #[source]
        source: io::Error,
    },

    /// Reading an aligned region that starts at or past end-of-file.
    #[error("end of file reached")]
    Eof,

    /// A cross-shard ring stayed full past the spill-retry budget.
    #[error("cross-shard queue to shard {to} is full")]
    QueueFull { to: u32 },

    /// The paired promise was dropped without ever being fulfilled.
    #[error("broken promise")]
    BrokenPromise,

    /// A semaphore was broken while this waiter was queued.
    #[error("semaphore broken")]
    SemaphoreBroken,

    /// The reactor is shutting down and no longer accepts work.
    #[error("reactor stopped")]
    Stopped,
}

impl ReactorError {
    pub(crate) fn sys(ctx: &'static str, errno: i32) -> Self {
        ReactorError::Sys {
            ctx,
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// Errno of the underlying syscall failure, if this is a syscall failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ReactorError::Sys { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Checks whether a fault is the distinguished EOF marker.
pub fn is_eof(fault: &Fault) -> bool {
    matches!(fault.downcast_ref::<ReactorError>(), Some(ReactorError::Eof))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_sys_error_keeps_errno() {
        let e = ReactorError::sys("io_submit", libc::EAGAIN);
        assert_eq!(e.errno(), Some(libc::EAGAIN));
        assert!(e.to_string().contains("io_submit"));
    }

    #[test]
    fn test_is_eof_only_matches_eof() {
        assert!(is_eof(&Fault::from(ReactorError::Eof)));
        assert!(!is_eof(&anyhow!("boom")));
        assert!(!is_eof(&Fault::from(ReactorError::BrokenPromise)));
    }
}
