//! The Linux AIO submission path for direct-I/O file operations.
//!
//! Callers take a slot on the counting semaphore, fill in a control block
//! and park it on the pending vector; the submit poller batches them into
//! `io_submit` and the completion poller reaps `io_getevents`, fulfilling
//! each request's promise with the transferred byte count or the kernel
//! error. Outstanding requests are bounded at `MAX_AIO` per shard.

use crate::error::ReactorError;
use crate::future::{Future, Promise};
use crate::semaphore::Semaphore;
use crate::sys::{self, AioContextT, Iocb, IoEvent};
use std::cell::{Cell, RefCell};

/// Maximum in-flight kernel AIO requests per shard.
pub(crate) const MAX_AIO: usize = 128;

struct AioRequest {
    iocb: Iocb,
    promise: Promise<usize>,
}

#[derive(Default)]
pub(crate) struct AioCounters {
    pub(crate) reads: Cell<u64>,
    pub(crate) read_bytes: Cell<u64>,
    pub(crate) writes: Cell<u64>,
    pub(crate) write_bytes: Cell<u64>,
}

pub(crate) struct AioContext {
    ctx: AioContextT,
    pending: RefCell<Vec<*mut Iocb>>,
    available: Semaphore,
    pub(crate) counters: AioCounters,
}

impl AioContext {
    pub(crate) fn try_new() -> sys::Result<Self> {
        Ok(Self {
            ctx: sys::io_setup(MAX_AIO as libc::c_long)?,
            pending: RefCell::new(Vec::with_capacity(MAX_AIO)),
            available: Semaphore::new(MAX_AIO),
            counters: AioCounters::default(),
        })
    }

    /// Waits for a free in-flight slot. The slot is released when the
    /// request enqueued after it completes.
    pub(crate) fn wait_slot(&self) -> Future<()> {
        self.available.wait(1)
    }

    /// Enqueues one prepared control block; the caller must already hold a
    /// slot. The returned future resolves with the transferred byte count.
    pub(crate) fn enqueue<F>(&self, prepare: F) -> Future<usize>
    where
        F: FnOnce(&mut Iocb),
    {
        let mut req = Box::new(AioRequest {
            iocb: Iocb::zeroed(),
            promise: Promise::new(),
        });
        prepare(&mut req.iocb);
        let fut = req.promise.get_future();
        // The request box must not move while the kernel holds the iocb
        // pointer; ownership is reclaimed at completion via `aio_data`.
        let raw = Box::into_raw(req);
        unsafe {
            (*raw).iocb.aio_data = raw as u64;
            self.pending.borrow_mut().push(&mut (*raw).iocb as *mut Iocb);
        }
        fut
    }

    /// Batches pending control blocks into `io_submit`. Returns whether any
    /// work was done.
    pub(crate) fn flush_pending(&self) -> bool {
        let mut did_work = false;
        loop {
            let batch: Vec<*mut Iocb> = {
                let pending = self.pending.borrow();
                pending.iter().take(MAX_AIO).copied().collect()
            };
            if batch.is_empty() {
                return did_work;
            }
            match sys::io_submit(self.ctx, &batch) {
                Ok(accepted) => {
                    self.pending.borrow_mut().drain(..accepted);
                    did_work = true;
                    if accepted < batch.len() {
                        return did_work;
                    }
                }
                Err(e) if e.errno() == Some(libc::EAGAIN) => return did_work,
                Err(e) => {
                    // The head request is the one the kernel rejected; fail
                    // it and let the rest retry next pass.
                    let head = self.pending.borrow_mut().remove(0);
                    let mut req = unsafe { Box::from_raw(head as *mut AioRequest) };
                    req.promise.set_exception(e.into());
                    self.available.signal(1);
                    did_work = true;
                }
            }
        }
    }

    /// Reaps completions non-blocking. Returns whether any were processed.
    pub(crate) fn process_completions(&self) -> bool {
        let mut events = [IoEvent::zeroed(); MAX_AIO];
        let n = match sys::io_getevents(self.ctx, &mut events) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("io_getevents failed: {}", e);
                return false;
            }
        };
        for ev in &events[..n] {
            let mut req = unsafe { Box::from_raw(ev.data as *mut AioRequest) };
            if ev.res < 0 {
                req.promise
                    .set_exception(ReactorError::sys("aio", (-ev.res) as i32).into());
            } else {
                req.promise.set_value(ev.res as usize);
            }
            self.available.signal(1);
        }
        n > 0
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    /// Outstanding slots taken (submitted or about to be).
    pub(crate) fn in_flight(&self) -> usize {
        MAX_AIO - self.available.available_units().max(0) as usize
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        sys::io_destroy(self.ctx);
    }
}
