//! The SMP fabric: one SPSC ring per ordered shard pair carrying erased
//! work-item pointers, with a symmetric ring returning completed items.
//! Items are allocated on the sender, executed on the receiver, and freed
//! by the sender once the response comes back; a sleeping receiver is woken
//! through its eventfd only when observed sleeping.

use crate::error::{Fault, ReactorError};
use crate::future::{parallel_for_each, ready, Future, Promise};
use crate::io_queue::IoQueue;
use crate::reactor::{Reactor, ShardId};
use crate::runtime::Config;
use crate::sys;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{fence, AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

pub(crate) mod ring;
use ring::SpscRing;


const QUEUE_LENGTH: usize = 128;
const BATCH_SIZE: usize = 16;
const PREFETCH_CNT: usize = 2;
/// Spilled items tolerated before a submission fails with queue-full.
const SPILL_BUDGET: usize = 4 * QUEUE_LENGTH;

/// Cross-shard work item. `process` runs on the receiving shard and must
/// store its outcome inside the item; `complete` runs back on the sender
/// and moves the outcome into the local promise.
pub(crate) trait SmpItem {
    fn process(&mut self) -> Future<()>;
    fn complete(&mut self);
}

type ItemPtr = *mut dyn SmpItem;

struct AsyncWorkItem<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Future<T> + Send + 'static,
{
    func: Option<F>,
    result: Option<Result<T, Fault>>,
    promise: Option<Promise<T>>,
}

impl<T, F> SmpItem for AsyncWorkItem<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Future<T> + Send + 'static,
{
    fn process(&mut self) -> Future<()> {
        let func = self.func.take().expect("work item processed twice");
        let result: *mut Option<Result<T, Fault>> = &mut self.result;
        // Safety: the item stays alive until the sender frees it, which
        // happens only after this future resolves and the response ring
        // hands the item back.
        func().then_wrapped(move |f| {
            unsafe { *result = Some(f.into_result()) };
            ready(())
        })
    }

    fn complete(&mut self) {
        let outcome = self.result.take().expect("work item completed before processing");
        let mut promise = self.promise.take().expect("work item completed twice");
        match outcome {
            Ok(v) => promise.set_value(v),
            Err(e) => promise.set_exception(e),
        }
    }
}

#[inline]
fn prefetch(p: ItemPtr) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use core::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(p as *const () as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

/// Sender-side scratch state; only the sending shard touches it.
struct TxSide {
    pending_fifo: UnsafeCell<VecDeque<ItemPtr>>,
    sent: Cell<u64>,
    completed: Cell<u64>,
    queue_length: Cell<u64>,
}

/// Receiver-side scratch state; only the receiving shard touches it.
struct RxSide {
    completed_fifo: UnsafeCell<VecDeque<ItemPtr>>,
    received: Cell<u64>,
}

pub(crate) struct SmpQueue {
    from: ShardId,
    to: ShardId,
    pending: SpscRing<ItemPtr, QUEUE_LENGTH>,
    completed: SpscRing<ItemPtr, QUEUE_LENGTH>,
    tx: crossbeam_utils::CachePadded<TxSide>,
    rx: crossbeam_utils::CachePadded<RxSide>,
}

// Safety: each field is touched by exactly one thread (tx by the sender, rx
// by the receiver, rings by their designated ends); the rings provide the
// ordering.
unsafe impl Send for SmpQueue {}
unsafe impl Sync for SmpQueue {}

impl SmpQueue {
    fn new(from: ShardId, to: ShardId) -> Self {
        Self {
            from,
            to,
            pending: SpscRing::new(),
            completed: SpscRing::new(),
            tx: crossbeam_utils::CachePadded::new(TxSide {
                pending_fifo: UnsafeCell::new(VecDeque::new()),
                sent: Cell::new(0),
                completed: Cell::new(0),
                queue_length: Cell::new(0),
            }),
            rx: crossbeam_utils::CachePadded::new(RxSide {
                completed_fifo: UnsafeCell::new(VecDeque::new()),
                received: Cell::new(0),
            }),
        }
    }

    /// Sender side: allocates the work item locally and hands its pointer
    /// to the fabric. Fails fast once the spill deque is past budget.
    fn submit<T, F>(&self, smp: &SmpContext, func: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Future<T> + Send + 'static,
    {
        let fifo = unsafe { &mut *self.tx.pending_fifo.get() };
        if fifo.len() >= SPILL_BUDGET {
            return crate::future::failed(Fault::from(ReactorError::QueueFull { to: self.to }));
        }
        let mut item = Box::new(AsyncWorkItem {
            func: Some(func),
            result: None,
            promise: Some(Promise::new()),
        });
        let fut = item.promise.as_mut().expect("fresh item").get_future();
        let ptr: ItemPtr = Box::into_raw(item);
        fifo.push_back(ptr);
        self.tx.queue_length.set(self.tx.queue_length.get() + 1);
        self.move_pending(smp);
        fut
    }

    /// Sender side: drains the spill deque into the ring, then wakes a
    /// sleeping receiver. Publish first, fence, then check the flag.
    fn move_pending(&self, smp: &SmpContext) -> bool {
        let fifo = unsafe { &mut *self.tx.pending_fifo.get() };
        let mut moved = 0u64;
        while let Some(&ptr) = fifo.front() {
            if self.pending.push(ptr).is_err() {
                break;
            }
            fifo.pop_front();
            moved += 1;
        }
        if moved == 0 {
            return false;
        }
        self.tx.sent.set(self.tx.sent.get() + moved);
        fence(Ordering::SeqCst);
        smp.shard(self.to).maybe_wake();
        true
    }

    /// Receiver side: runs up to a batch of incoming items.
    fn process_incoming(queue: &Arc<SmpQueue>) -> usize {
        let mut batch: SmallVec<[ItemPtr; BATCH_SIZE]> = SmallVec::new();
        while batch.len() < BATCH_SIZE {
            match queue.pending.pop() {
                Some(ptr) => batch.push(ptr),
                None => break,
            }
        }
        for i in 0..batch.len() {
            if i + PREFETCH_CNT < batch.len() {
                prefetch(batch[i + PREFETCH_CNT]);
            }
            let ptr = batch[i];
            // Safety: the sender published this pointer through the ring
            // and will not touch the item until it is handed back.
            let fut = unsafe { (*ptr).process() };
            let queue = Arc::clone(queue);
            let ptr = SendablePtr(ptr);
            fut.then_wrapped(move |f| {
                // `process` never fails; its outcome lives inside the item.
                let _ = f.into_result();
                queue.respond(ptr.0);
                ready(())
            })
            .ignore_ready_future();
        }
        let n = batch.len();
        queue.rx.received.set(queue.rx.received.get() + n as u64);
        n
    }

    /// Receiver side: parks a finished item for the response ring.
    fn respond(&self, ptr: ItemPtr) {
        unsafe { &mut *self.rx.completed_fifo.get() }.push_back(ptr);
    }

    /// Receiver side: flushes finished items back to the sender.
    fn flush_response_batch(&self, smp: &SmpContext) -> bool {
        let fifo = unsafe { &mut *self.rx.completed_fifo.get() };
        let mut moved = false;
        while let Some(&ptr) = fifo.front() {
            if self.completed.push(ptr).is_err() {
                break;
            }
            fifo.pop_front();
            moved = true;
        }
        if moved {
            fence(Ordering::SeqCst);
            smp.shard(self.from).maybe_wake();
        }
        moved
    }

    /// Sender side: fulfils local promises for returned items and frees
    /// them.
    fn process_completions(&self) -> usize {
        let mut n = 0;
        while n < BATCH_SIZE {
            let Some(ptr) = self.completed.pop() else { break };
            // Safety: the receiver is done with the item; we own it again.
            unsafe {
                (*ptr).complete();
                drop(Box::from_raw(ptr));
            }
            n += 1;
        }
        if n > 0 {
            self.tx.completed.set(self.tx.completed.get() + n as u64);
            self.tx.queue_length.set(self.tx.queue_length.get() - n as u64);
        }
        n
    }

    pub(crate) fn sent(&self) -> u64 {
        self.tx.sent.get()
    }

    pub(crate) fn completed(&self) -> u64 {
        self.tx.completed.get()
    }

    pub(crate) fn current_queue_length(&self) -> u64 {
        self.tx.queue_length.get()
    }

    /// Receiver-side count of items taken off the ring.
    pub(crate) fn received(&self) -> u64 {
        self.rx.received.get()
    }
}

struct SendablePtr(ItemPtr);
// Safety: the pointer only moves between the closure that captured it and
// the shard that created it; the fabric's handoff discipline applies.
unsafe impl Send for SendablePtr {}

pub(crate) struct ShardHandle {
    sleeping: AtomicBool,
    wake_fd: AtomicI32,
}

impl ShardHandle {
    fn new() -> Self {
        Self {
            sleeping: AtomicBool::new(false),
            wake_fd: AtomicI32::new(-1),
        }
    }

    pub(crate) fn set_sleeping(&self, value: bool) {
        self.sleeping.store(value, Ordering::SeqCst);
    }

    /// Writes the shard's wakeup eventfd iff it is observed sleeping,
    /// keeping the syscall off the hot path.
    pub(crate) fn maybe_wake(&self) {
        if self.sleeping.load(Ordering::SeqCst) {
            self.wake();
        }
    }

    pub(crate) fn wake(&self) {
        let fd = self.wake_fd.load(Ordering::Acquire);
        if fd >= 0 {
            sys::eventfd_write(fd as RawFd, 1);
        }
    }
}

/// Runtime-instance state shared by all shards: the ring matrix, the shard
/// registry, the priority-class registry and the I/O topology. This is the
/// only cross-thread surface besides the wakeup eventfds.
pub(crate) struct SmpContext {
    count: u32,
    shards: Vec<ShardHandle>,
    /// `qs[to][from]` carries work from shard `from` to shard `to`.
    qs: Vec<Vec<Arc<SmpQueue>>>,
    stopping: AtomicBool,
    /// Name and share weight per registered I/O priority class. Updated
    /// rarely; reads take a snapshot.
    class_registry: Mutex<Vec<(String, u32)>>,
    io_topology: Vec<ShardId>,
    io_capacity: usize,
}

impl SmpContext {
    pub(crate) fn new(cfg: &Config) -> Arc<Self> {
        let count = cfg.shards as u32;
        let num_queues = cfg.num_io_queues.unwrap_or(cfg.shards).clamp(1, cfg.shards);
        let shards_per_queue = cfg.shards.div_ceil(num_queues);
        let io_topology = (0..cfg.shards)
            .map(|s| ((s / shards_per_queue) * shards_per_queue) as ShardId)
            .collect();
        Arc::new(Self {
            count,
            shards: (0..count).map(|_| ShardHandle::new()).collect(),
            qs: (0..count)
                .map(|to| {
                    (0..count)
                        .map(|from| Arc::new(SmpQueue::new(from, to)))
                        .collect()
                })
                .collect(),
            stopping: AtomicBool::new(false),
            class_registry: Mutex::new(vec![("default".to_string(), 1)]),
            io_topology,
            io_capacity: cfg.max_io_requests.unwrap_or(crate::reactor::aio::MAX_AIO),
        })
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn shard(&self, id: ShardId) -> &ShardHandle {
        &self.shards[id as usize]
    }

    pub(crate) fn register_shard(&self, id: ShardId, wake_fd: RawFd) {
        self.shards[id as usize]
            .wake_fd
            .store(wake_fd, Ordering::Release);
    }

    /// Called before a shard's reactor (and its eventfd) is torn down, so
    /// no peer writes a recycled fd.
    pub(crate) fn unregister_shard(&self, id: ShardId) {
        self.shards[id as usize].wake_fd.store(-1, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for shard in &self.shards {
            shard.wake();
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// One tick of the SMP poller for shard `me`: flush and run incoming
    /// work, flush our own sends, and collect returned responses.
    pub(crate) fn poll_queues(&self, me: ShardId) -> bool {
        let mut got = 0;
        for other in 0..self.count {
            if other == me {
                continue;
            }
            let rxq = &self.qs[me as usize][other as usize];
            rxq.flush_response_batch(self);
            got += SmpQueue::process_incoming(rxq);
            let txq = &self.qs[other as usize][me as usize];
            txq.move_pending(self);
            got += txq.process_completions();
        }
        got != 0
    }

    /// Whether anything is waiting for shard `me`; used to recheck after
    /// publishing the sleeping flag.
    pub(crate) fn have_incoming(&self, me: ShardId) -> bool {
        for other in 0..self.count {
            if other == me {
                continue;
            }
            if !self.qs[me as usize][other as usize].pending.is_empty() {
                return true;
            }
            if !self.qs[other as usize][me as usize].completed.is_empty() {
                return true;
            }
        }
        false
    }

    fn queue_to(&self, to: ShardId, from: ShardId) -> &Arc<SmpQueue> {
        &self.qs[to as usize][from as usize]
    }

    pub(crate) fn queue_stats(&self, to: ShardId, from: ShardId) -> (u64, u64, u64) {
        let q = self.queue_to(to, from);
        (q.sent(), q.completed(), q.current_queue_length())
    }

    pub(crate) fn queue_received(&self, to: ShardId, from: ShardId) -> u64 {
        self.queue_to(to, from).received()
    }

    // --- I/O coordination plumbing ---

    pub(crate) fn coordinator_of(&self, shard: ShardId) -> ShardId {
        self.io_topology[shard as usize]
    }

    /// Builds the fair queue for shards that coordinate one.
    pub(crate) fn make_io_queue(&self, id: ShardId) -> Option<Rc<IoQueue>> {
        if self.coordinator_of(id) == id {
            Some(IoQueue::new(id, self.io_capacity))
        } else {
            None
        }
    }

    pub(crate) fn register_priority_class(&self, name: &str, shares: u32) -> u32 {
        let mut registry = self.class_registry.lock();
        registry.push((name.to_string(), shares.max(1)));
        (registry.len() - 1) as u32
    }

    pub(crate) fn class_shares(&self, id: u32) -> u32 {
        self.class_registry
            .lock()
            .get(id as usize)
            .map(|(_, shares)| *shares)
            .unwrap_or(1)
    }
}

/// Runs `func` on the given shard and returns its result as a local
/// future. On the home shard the call runs directly; otherwise the closure
/// travels the fabric and its result rides the response ring back.
pub fn submit_to<T, F>(shard: ShardId, func: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> Future<T> + Send + 'static,
{
    let reactor = Reactor::local();
    let me = reactor.cpu_id();
    if shard == me {
        return func();
    }
    let smp = Arc::clone(reactor.smp());
    assert!(shard < smp.count(), "no such shard: {}", shard);
    smp.queue_to(shard, me).submit(&smp, func)
}

/// Number of shards in the running runtime.
pub fn count() -> u32 {
    Reactor::local().smp().count()
}

/// This shard's id.
pub fn this_shard_id() -> ShardId {
    Reactor::local().cpu_id()
}

pub fn all_cpus() -> std::ops::Range<ShardId> {
    0..count()
}

/// Invokes `func` on every shard; resolves when all invocations finish.
/// Each shard works with its own clone of `func`.
pub fn invoke_on_all<F>(func: F) -> Future<()>
where
    F: FnOnce() -> Future<()> + Clone + Send + 'static,
{
    parallel_for_each(all_cpus(), move |id| submit_to(id, func.clone()))
}
