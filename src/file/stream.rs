//! Buffered streams over direct-I/O files: read-ahead on input,
//! semaphore-limited write-behind on output, with the unaligned final
//! write resolved by a truncate to the true length at flush time.

use super::{align_down, align_up, AlignedBuf, File};
use crate::error::Fault;
use crate::future::{ready, when_all, Future, Promise};
use crate::io_queue::{default_priority_class, IoPriorityClass};
use crate::semaphore::Semaphore;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Clone)]
pub struct FileInputStreamOptions {
    pub buffer_size: usize,
    /// Reads kept in flight ahead of the consumer.
    pub read_ahead: u32,
    pub io_priority_class: IoPriorityClass,
}

impl Default for FileInputStreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            read_ahead: 1,
            io_priority_class: default_priority_class(),
        }
    }
}

struct SourceInner {
    file: File,
    options: FileInputStreamOptions,
    pos: u64,
    remain: u64,
    read_buffers: VecDeque<Future<AlignedBuf>>,
    reads_in_progress: u32,
    done: Option<Promise<()>>,
    closing: bool,
}

/// Sequential reader with read-ahead. `get` yields successive chunks; an
/// empty buffer signals end of stream.
pub struct FileInputStream {
    inner: Rc<RefCell<SourceInner>>,
}

pub fn make_file_input_stream(file: File, offset: u64, len: u64, options: FileInputStreamOptions) -> FileInputStream {
    let remain = len.min(u64::MAX - offset);
    FileInputStream {
        inner: Rc::new(RefCell::new(SourceInner {
            file,
            options,
            pos: offset,
            remain,
            read_buffers: VecDeque::new(),
            reads_in_progress: 0,
            done: None,
            closing: false,
        })),
    }
}

impl FileInputStream {
    /// The next chunk, in file order. Chunks at the stream edges are
    /// trimmed to the requested range.
    pub fn get(&self) -> Future<AlignedBuf> {
        if self.inner.borrow().read_buffers.is_empty() {
            issue_read_aheads(&self.inner, 1);
        }
        self.inner
            .borrow_mut()
            .read_buffers
            .pop_front()
            .expect("read-ahead issued nothing")
    }

    /// Stops issuing read-aheads and waits for in-flight ones to land.
    pub fn close(&self) -> Future<()> {
        let fut = {
            let mut inner = self.inner.borrow_mut();
            inner.closing = true;
            let mut done = Promise::new();
            let fut = done.get_future();
            if inner.reads_in_progress == 0 {
                done.set_value(());
            } else {
                inner.done = Some(done);
            }
            fut
        };
        let inner = Rc::clone(&self.inner);
        fut.map(move |()| {
            for fut in inner.borrow_mut().read_buffers.drain(..) {
                if fut.available() {
                    fut.ignore_ready_future();
                }
            }
        })
    }
}

fn issue_read_aheads(inner_rc: &Rc<RefCell<SourceInner>>, min_ra: u32) {
    let mut inner = inner_rc.borrow_mut();
    if inner.closing {
        return;
    }
    let ra = min_ra.max(inner.options.read_ahead) as usize;
    while inner.read_buffers.len() < ra {
        if inner.remain == 0 {
            if inner.read_buffers.len() >= min_ra as usize {
                return;
            }
            inner.read_buffers.push_back(ready(AlignedBuf::empty()));
            continue;
        }
        inner.reads_in_progress += 1;
        // An unaligned position gives a short first chunk; trim the head
        // and never read past the requested range.
        let align = inner.file.disk_read_dma_alignment();
        let pos = inner.pos;
        let remain = inner.remain;
        let start = align_down(pos, align);
        let end = align_up(
            (start + inner.options.buffer_size as u64).min(pos + remain),
            align,
        );
        let len = (end - start) as usize;

        let inner2 = Rc::clone(inner_rc);
        let fut = inner
            .file
            .dma_read_bulk_prio(start, len, inner.options.io_priority_class)
            .then_wrapped(move |result| {
                issue_read_aheads(&inner2, 0);
                let mut i = inner2.borrow_mut();
                i.reads_in_progress -= 1;
                if i.reads_in_progress == 0 {
                    if let Some(mut done) = i.done.take() {
                        done.set_value(());
                    }
                }
                drop(i);
                match result.into_result() {
                    Err(e) => crate::future::failed::<AlignedBuf>(e),
                    Ok(mut buf) => {
                        // First or last buffer may need trimming.
                        let real_end = start + buf.len() as u64;
                        if real_end <= pos {
                            return ready(AlignedBuf::empty());
                        }
                        if real_end > pos + remain {
                            buf.trim((pos + remain - start) as usize);
                        }
                        if start < pos {
                            buf.trim_front((pos - start) as usize);
                        }
                        ready(buf)
                    }
                }
            });
        inner.read_buffers.push_back(fut);
        let old_pos = inner.pos;
        inner.pos = end;
        inner.remain = (old_pos + remain).max(end) - end;
    }
}

#[derive(Clone)]
pub struct FileOutputStreamOptions {
    pub buffer_size: usize,
    /// Writes allowed in flight behind the caller.
    pub write_behind: u32,
    pub io_priority_class: IoPriorityClass,
}

impl Default for FileOutputStreamOptions {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            write_behind: 1,
            io_priority_class: default_priority_class(),
        }
    }
}

struct SinkInner {
    file: File,
    options: FileOutputStreamOptions,
    /// Next logical write offset; also the true length for the tail
    /// truncate.
    pos: u64,
    staged: Vec<u8>,
    write_behind_sem: Semaphore,
    background_writes_done: Option<Future<()>>,
    failed: bool,
}

/// Sequential writer with write-behind. Only sequential writes are merged;
/// an unaligned tail write is padded and followed by a truncate to the
/// true length at flush.
pub struct FileOutputStream {
    inner: Rc<RefCell<SinkInner>>,
}

pub fn make_file_output_stream(file: File, options: FileOutputStreamOptions) -> FileOutputStream {
    let write_behind = options.write_behind.max(1) as usize;
    FileOutputStream {
        inner: Rc::new(RefCell::new(SinkInner {
            file,
            options,
            pos: 0,
            staged: Vec::new(),
            write_behind_sem: Semaphore::new(write_behind),
            background_writes_done: None,
            failed: false,
        })),
    }
}

impl FileOutputStream {
    /// Appends `data`, issuing full buffers in the background.
    pub fn write(&self, data: &[u8]) -> Future<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.staged.extend_from_slice(data);
        }
        self.flush_full_chunks()
    }

    fn flush_full_chunks(&self) -> Future<()> {
        let chunk = {
            let mut inner = self.inner.borrow_mut();
            let buffer_size = inner.options.buffer_size;
            if inner.staged.len() < buffer_size {
                return ready(());
            }
            let rest = inner.staged.split_off(buffer_size);
            std::mem::replace(&mut inner.staged, rest)
        };
        let this = FileOutputStream { inner: Rc::clone(&self.inner) };
        self.put(chunk).then(move |()| this.flush_full_chunks())
    }

    /// Queues one chunk under the write-behind window.
    fn put(&self, data: Vec<u8>) -> Future<()> {
        let inner_rc = Rc::clone(&self.inner);
        let (sem, pos) = {
            let mut inner = self.inner.borrow_mut();
            let pos = inner.pos;
            inner.pos += data.len() as u64;
            (inner.write_behind_sem.clone(), pos)
        };
        sem.wait(1).then(move |()| {
            let mut inner = inner_rc.borrow_mut();
            if inner.failed {
                inner.write_behind_sem.signal(1);
                // Surface the stored failure to this writer.
                return inner
                    .background_writes_done
                    .take()
                    .unwrap_or_else(|| ready(()));
            }
            let sem = inner.write_behind_sem.clone();
            let this_write = do_put(&inner.file, pos, data, &inner.options).finally(move || {
                sem.signal(1);
                ready(())
            });
            let prev = inner.background_writes_done.take().unwrap_or_else(|| ready(()));
            let inner2 = Rc::clone(&inner_rc);
            inner.background_writes_done = Some(
                when_all(vec![prev, this_write]).then(move |mut outcomes| {
                    let second = outcomes.pop().expect("two outcomes");
                    let first = outcomes.pop().expect("two outcomes");
                    // Merge, preferring the earlier failure.
                    if first.failed() {
                        second.ignore_ready_future();
                        first
                    } else {
                        first.ignore_ready_future();
                        if second.failed() {
                            inner2.borrow_mut().failed = true;
                        }
                        second
                    }
                }),
            );
            ready(())
        })
    }

    /// Drains the write-behind window, writes the unaligned tail (padded,
    /// then truncated to the true length) and makes data durable.
    pub fn flush(&self) -> Future<()> {
        let tail = {
            let mut inner = self.inner.borrow_mut();
            std::mem::take(&mut inner.staged)
        };
        let tail_write = if tail.is_empty() { ready(()) } else { self.put(tail) };

        let inner_rc = Rc::clone(&self.inner);
        tail_write.then(move |()| {
            let (sem, n) = {
                let inner = inner_rc.borrow();
                (
                    inner.write_behind_sem.clone(),
                    inner.options.write_behind.max(1) as usize,
                )
            };
            sem.wait(n).then(move |()| {
                let background = inner_rc
                    .borrow_mut()
                    .background_writes_done
                    .take()
                    .unwrap_or_else(|| ready(()));
                let inner2 = Rc::clone(&inner_rc);
                background.then_wrapped(move |f| {
                    // Restore the pristine window for flush+close sequences.
                    let file = {
                        let inner = inner2.borrow();
                        inner.write_behind_sem.signal(n);
                        inner.file.clone()
                    };
                    match f.into_result() {
                        Err(e) => crate::future::failed::<()>(e),
                        Ok(()) => file.flush(),
                    }
                })
            })
        })
    }

    pub fn close(&self) -> Future<()> {
        let file = self.inner.borrow().file.clone();
        self.flush().then(move |()| file.close())
    }
}

fn do_put(file: &File, pos: u64, data: Vec<u8>, options: &FileOutputStreamOptions) -> Future<()> {
    let align = file.disk_write_dma_alignment();
    assert!(
        pos % align == 0,
        "non-sequential or unaligned stream write at {}",
        pos
    );
    let true_len = pos + data.len() as u64;
    let padded = align_up(data.len() as u64, align) as usize;
    let needs_truncate = padded != data.len();

    let mut buf = AlignedBuf::aligned(file.memory_dma_alignment(), padded);
    buf[..data.len()].copy_from_slice(&data);

    let file2 = file.clone();
    file.write_dma_prio(pos, buf, options.io_priority_class)
        .then(move |(written, _buf)| {
            let fault = |msg: String| crate::future::failed::<()>(Fault::msg(msg));
            if written != padded {
                return fault(format!("short stream write: {} of {}", written, padded));
            }
            if needs_truncate {
                file2.truncate(true_len)
            } else {
                ready(())
            }
        })
}
