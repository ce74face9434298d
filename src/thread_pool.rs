//! Fallback worker for blocking syscalls (open, fsync, truncate, directory
//! reads). Submissions go through a small mutexed queue, the one lock the
//! runtime allows off the hot path; completions ride an SPSC ring back,
//! with the reactor's wakeup eventfd notifying a sleeping shard.

use crate::error::ReactorError;
use crate::future::{Future, Promise};
use crate::semaphore::Semaphore;
use crate::smp::ring::SpscRing;
use crate::sys;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::Arc;

const QUEUE_LENGTH: usize = 128;

trait PoolItem {
    /// Runs on the worker thread; may block.
    fn process(&mut self);
    /// Runs back on the reactor thread.
    fn complete(&mut self);
}

type ItemPtr = *mut dyn PoolItem;

struct PoolWorkItem<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ReactorError> + Send + 'static,
{
    func: Option<F>,
    result: Option<Result<T, ReactorError>>,
    promise: Option<Promise<T>>,
}

impl<T, F> PoolItem for PoolWorkItem<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ReactorError> + Send + 'static,
{
    fn process(&mut self) {
        let func = self.func.take().expect("pool item processed twice");
        self.result = Some(func());
    }

    fn complete(&mut self) {
        let outcome = self.result.take().expect("pool item completed before processing");
        let mut promise = self.promise.take().expect("pool item completed twice");
        match outcome {
            Ok(v) => promise.set_value(v),
            Err(e) => promise.set_exception(e.into()),
        }
    }
}

struct Shared {
    submitted: Mutex<std::collections::VecDeque<ItemPtr>>,
    cond: Condvar,
    completed: SpscRing<ItemPtr, QUEUE_LENGTH>,
    wake_fd: RawFd,
}

// Safety: item pointers are owned by exactly one side at a time; the mutex
// and the ring order the handoffs.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

pub(crate) struct ThreadPool {
    shared: Arc<Shared>,
    worker: Option<std::thread::JoinHandle<()>>,
    queue_has_room: Semaphore,
    fallbacks: Cell<u64>,
}

impl ThreadPool {
    pub(crate) fn spawn(wake_fd: RawFd) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            submitted: Mutex::new(std::collections::VecDeque::new()),
            cond: Condvar::new(),
            completed: SpscRing::new(),
            wake_fd,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("shoal-syscall".to_string())
            .spawn(move || worker_loop(worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
            queue_has_room: Semaphore::new(QUEUE_LENGTH),
            fallbacks: Cell::new(0),
        })
    }

    /// Runs a blocking operation on the worker; resolves on this shard.
    pub(crate) fn submit<T, F>(&self, func: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ReactorError> + Send + 'static,
    {
        self.fallbacks.set(self.fallbacks.get() + 1);
        let shared = Arc::clone(&self.shared);
        self.queue_has_room.wait(1).then(move |()| {
            let mut item = Box::new(PoolWorkItem {
                func: Some(func),
                result: None,
                promise: Some(Promise::new()),
            });
            let fut = item.promise.as_mut().expect("fresh item").get_future();
            let ptr: ItemPtr = Box::into_raw(item);
            {
                let mut queue = shared.submitted.lock();
                queue.push_back(ptr);
            }
            shared.cond.notify_one();
            fut
        })
    }

    /// Reactor-side poller hook: fulfils promises of finished items.
    pub(crate) fn complete(&self) -> bool {
        let mut did_work = false;
        while let Some(ptr) = self.shared.completed.pop() {
            // Safety: the worker is done with the item; we own it again.
            unsafe {
                (*ptr).complete();
                drop(Box::from_raw(ptr));
            }
            self.queue_has_room.signal(1);
            did_work = true;
        }
        did_work
    }

    /// How many operations ever took the threaded-fallback path.
    pub(crate) fn operation_count(&self) -> u64 {
        self.fallbacks.get()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.submitted.lock();
            queue.push_back(std::ptr::null_mut::<PoolWorkItem<(), fn() -> Result<(), ReactorError>>>() as ItemPtr);
        }
        self.shared.cond.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        // Items still in flight at teardown are dropped unfulfilled; their
        // waiters, if any, already observed reactor shutdown.
        while let Some(ptr) = self.shared.completed.pop() {
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let ptr = {
            let mut queue = shared.submitted.lock();
            loop {
                if let Some(ptr) = queue.pop_front() {
                    break ptr;
                }
                shared.cond.wait(&mut queue);
            }
        };
        if ptr.is_null() {
            return;
        }
        // Safety: the reactor handed the item over and will not touch it
        // until it returns through the completion ring.
        unsafe { (*ptr).process() };
        let mut pending = ptr;
        loop {
            match shared.completed.push(pending) {
                Ok(()) => break,
                // The semaphore bounds submissions to the ring size, so a
                // full ring is transient (reactor mid-drain).
                Err(p) => {
                    pending = p;
                    std::thread::yield_now();
                }
            }
        }
        sys::eventfd_write(shared.wake_fd, 1);
    }
}
