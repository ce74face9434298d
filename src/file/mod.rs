//! Direct-I/O files.
//!
//! Files are uncached and unbuffered: transfers go through the AIO path
//! with offsets and lengths aligned to the device alignment and buffers
//! aligned to the memory DMA alignment. The bulk-read convenience hides
//! the alignment contract by widening, iterating across short reads and
//! trimming. Metadata operations (open, stat, truncate, allocate, discard,
//! directory reads) run on the blocking-syscall thread pool.

use crate::error::{Fault, ReactorError};
use crate::future::{do_until, ready, Future};
use crate::io_queue::{default_priority_class, IoPriorityClass};
use crate::reactor::Reactor;
use crate::sys::{self, Iocb};
use bitflags::bitflags;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::Rc;

mod buffer;
pub use buffer::AlignedBuf;

pub mod stream;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RO = 0;
        const WO = 1;
        const RW = 2;
        const CREATE = 4;
        const TRUNCATE = 8;
        const EXCLUSIVE = 16;
    }
}

impl OpenFlags {
    fn to_libc(self) -> libc::c_int {
        let mut flags = if self.contains(OpenFlags::RW) {
            libc::O_RDWR
        } else if self.contains(OpenFlags::WO) {
            libc::O_WRONLY
        } else {
            libc::O_RDONLY
        };
        if self.contains(OpenFlags::CREATE) {
            flags |= libc::O_CREAT;
        }
        if self.contains(OpenFlags::TRUNCATE) {
            flags |= libc::O_TRUNC;
        }
        if self.contains(OpenFlags::EXCLUSIVE) {
            flags |= libc::O_EXCL;
        }
        flags
    }
}

#[derive(Debug, Clone)]
pub struct FileOpenOptions {
    /// Disk space allocated ahead when extending the file, to curb
    /// fragmentation.
    pub extent_allocation_size_hint: u64,
}

impl Default for FileOpenOptions {
    fn default() -> Self {
        Self {
            extent_allocation_size_hint: 1 << 20,
        }
    }
}

/// Type of a listed directory entry, when the filesystem reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEntryType {
    BlockDevice,
    CharDevice,
    Directory,
    Fifo,
    Link,
    Regular,
    Socket,
}

/// A directory entry. Never "." or ".."; only the last path component.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub name: String,
    pub entry_type: Option<DirectoryEntryType>,
}

/// The closed set of file implementations behind a `File`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Posix,
    Blockdev,
}

#[derive(Debug)]
struct FileInner {
    fd: RawFd,
    kind: FileKind,
    memory_dma_alignment: u64,
    disk_read_dma_alignment: u64,
    disk_write_dma_alignment: u64,
    options: FileOpenOptions,
    closed: Cell<bool>,
}

impl Drop for FileInner {
    fn drop(&mut self) {
        if !self.closed.get() {
            sys::close(self.fd);
        }
    }
}

/// A data file on persistent storage. Cheap to clone; all clones refer to
/// the same open file.
#[derive(Debug, Clone)]
pub struct File {
    inner: Rc<FileInner>,
}

pub(crate) fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

pub(crate) fn align_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

/// Opens a file for direct I/O. On filesystems that reject O_DIRECT the
/// call fails under strict DMA, or falls back to buffered I/O with a
/// logged performance warning otherwise.
pub fn open_file_dma(path: &str, flags: OpenFlags) -> Future<File> {
    open_file_dma_with(path, flags, FileOpenOptions::default())
}

pub fn open_file_dma_with(path: &str, flags: OpenFlags, options: FileOpenOptions) -> Future<File> {
    let reactor = Reactor::local();
    let strict = reactor.strict_dma();
    let c_path = match CString::new(path) {
        Ok(p) => p,
        Err(_) => return crate::future::failed(anyhow::anyhow!("path contains NUL: {:?}", path)),
    };
    reactor
        .thread_pool()
        .submit(move || {
            let base = flags.to_libc() | libc::O_CLOEXEC;
            let (fd, direct) = match sys::open(&c_path, base | libc::O_DIRECT, 0o644) {
                Ok(fd) => (fd, true),
                Err(e) if e.errno() == Some(libc::EINVAL) && !strict => {
                    (sys::open(&c_path, base, 0o644)?, false)
                }
                Err(e) => return Err(e),
            };
            let st = sys::fstat(fd)?;
            let is_blockdev = st.st_mode & libc::S_IFMT == libc::S_IFBLK;
            let alignment = if is_blockdev { sys::blk_ssz_get(fd)? } else { 4096 };
            Ok((fd, direct, is_blockdev, alignment))
        })
        .map(move |(fd, direct, is_blockdev, alignment)| {
            if !direct {
                tracing::warn!(
                    "open_file_dma: filesystem rejects O_DIRECT, falling back to \
                     buffered I/O (performance will suffer)"
                );
            }
            File {
                inner: Rc::new(FileInner {
                    fd,
                    kind: if is_blockdev { FileKind::Blockdev } else { FileKind::Posix },
                    memory_dma_alignment: 4096,
                    disk_read_dma_alignment: alignment.max(512).min(4096),
                    disk_write_dma_alignment: alignment.max(512).min(4096),
                    options,
                    closed: Cell::new(false),
                }),
            }
        })
}

/// Opens a directory for listing.
pub fn open_directory(path: &str) -> Future<File> {
    let reactor = Reactor::local();
    let c_path = match CString::new(path) {
        Ok(p) => p,
        Err(_) => return crate::future::failed(anyhow::anyhow!("path contains NUL: {:?}", path)),
    };
    reactor
        .thread_pool()
        .submit(move || {
            sys::open(
                &c_path,
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
                0,
            )
        })
        .map(|fd| File {
            inner: Rc::new(FileInner {
                fd,
                kind: FileKind::Posix,
                memory_dma_alignment: 4096,
                disk_read_dma_alignment: 4096,
                disk_write_dma_alignment: 4096,
                options: FileOpenOptions::default(),
                closed: Cell::new(false),
            }),
        })
}

impl File {
    /// Alignment requirement for read offsets and lengths.
    pub fn disk_read_dma_alignment(&self) -> u64 {
        self.inner.disk_read_dma_alignment
    }

    /// Alignment requirement for write offsets and lengths.
    pub fn disk_write_dma_alignment(&self) -> u64 {
        self.inner.disk_write_dma_alignment
    }

    /// Alignment requirement for data buffers.
    pub fn memory_dma_alignment(&self) -> u64 {
        self.inner.memory_dma_alignment
    }

    fn assert_rw_alignment(&self, pos: u64, buf: &AlignedBuf, disk_align: u64) {
        // An unaligned direct-I/O request is a caller bug.
        assert!(
            pos % disk_align == 0
                && buf.len() as u64 % disk_align == 0
                && buf.as_ptr() as u64 % self.inner.memory_dma_alignment == 0,
            "unaligned DMA request: pos={} len={} buf={:p} (alignment {})",
            pos,
            buf.len(),
            buf.as_ptr(),
            disk_align,
        );
    }

    /// One DMA read into `buf`. `pos` and the buffer length must be
    /// aligned. Resolves with the byte count and the buffer; fewer bytes
    /// than asked means end-of-file at `pos + returned`.
    pub fn read_dma(&self, pos: u64, buf: AlignedBuf) -> Future<(usize, AlignedBuf)> {
        self.read_dma_prio(pos, buf, default_priority_class())
    }

    pub fn read_dma_prio(
        &self,
        pos: u64,
        buf: AlignedBuf,
        pc: IoPriorityClass,
    ) -> Future<(usize, AlignedBuf)> {
        self.assert_rw_alignment(pos, &buf, self.inner.disk_read_dma_alignment);
        self.read_dma_unchecked(pos, buf, pc)
    }

    /// The bulk-read probe issues reads past EOF at unaligned positions on
    /// purpose, relying on the kernel's EINVAL; no alignment assertions.
    fn read_dma_unchecked(
        &self,
        pos: u64,
        mut buf: AlignedBuf,
        pc: IoPriorityClass,
    ) -> Future<(usize, AlignedBuf)> {
        let fd = self.inner.fd;
        let ptr = buf.as_mut_ptr() as u64;
        let len = buf.len() as u64;
        Reactor::local()
            .submit_io_read(pc, len as usize, move |iocb| {
                *iocb = Iocb::prepare(sys::IOCB_CMD_PREAD, fd, ptr, len, pos as i64);
            })
            .map(move |n| (n, buf))
    }

    /// One DMA write from `buf`. `pos` and the buffer length must be
    /// aligned; the buffer travels with the future and stays alive until
    /// completion.
    pub fn write_dma(&self, pos: u64, buf: AlignedBuf) -> Future<(usize, AlignedBuf)> {
        self.write_dma_prio(pos, buf, default_priority_class())
    }

    pub fn write_dma_prio(
        &self,
        pos: u64,
        buf: AlignedBuf,
        pc: IoPriorityClass,
    ) -> Future<(usize, AlignedBuf)> {
        self.assert_rw_alignment(pos, &buf, self.inner.disk_write_dma_alignment);
        let fd = self.inner.fd;
        let ptr = buf.as_ptr() as u64;
        let len = buf.len() as u64;
        Reactor::local()
            .submit_io_write(pc, len as usize, move |iocb| {
                *iocb = Iocb::prepare(sys::IOCB_CMD_PWRITE, fd, ptr, len, pos as i64);
            })
            .map(move |n| (n, buf))
    }

    /// Scatter read into a set of aligned buffers.
    pub fn read_dma_iov(&self, pos: u64, bufs: Vec<AlignedBuf>) -> Future<(usize, Vec<AlignedBuf>)> {
        self.vectored(pos, bufs, sys::IOCB_CMD_PREADV)
    }

    /// Gather write from a set of aligned buffers.
    pub fn write_dma_iov(&self, pos: u64, bufs: Vec<AlignedBuf>) -> Future<(usize, Vec<AlignedBuf>)> {
        self.vectored(pos, bufs, sys::IOCB_CMD_PWRITEV)
    }

    fn vectored(&self, pos: u64, mut bufs: Vec<AlignedBuf>, opcode: u16) -> Future<(usize, Vec<AlignedBuf>)> {
        let disk_align = if opcode == sys::IOCB_CMD_PREADV {
            self.inner.disk_read_dma_alignment
        } else {
            self.inner.disk_write_dma_alignment
        };
        let mut total = 0usize;
        let iov: Box<[libc::iovec]> = bufs
            .iter_mut()
            .map(|b| {
                self.assert_rw_alignment(pos, b, disk_align);
                total += b.len();
                libc::iovec {
                    iov_base: b.as_mut_ptr() as *mut libc::c_void,
                    iov_len: b.len(),
                }
            })
            .collect();
        let fd = self.inner.fd;
        let iov_ptr = iov.as_ptr() as u64;
        let iov_len = iov.len() as u64;
        let submit = if opcode == sys::IOCB_CMD_PREADV {
            Reactor::local().submit_io_read(default_priority_class(), total, move |iocb| {
                *iocb = Iocb::prepare(opcode, fd, iov_ptr, iov_len, pos as i64);
            })
        } else {
            Reactor::local().submit_io_write(default_priority_class(), total, move |iocb| {
                *iocb = Iocb::prepare(opcode, fd, iov_ptr, iov_len, pos as i64);
            })
        };
        // The iovec array and the buffers ride the continuation so the
        // kernel's pointers stay valid until completion.
        submit.map(move |n| {
            drop(iov);
            (n, bufs)
        })
    }

    /// Makes previously written data durable.
    pub fn flush(&self) -> Future<()> {
        let reactor = Reactor::local();
        reactor.count_fsync();
        let fd = self.inner.fd;
        reactor.thread_pool().submit(move || sys::fsync(fd))
    }

    pub fn stat(&self) -> Future<libc::stat> {
        let fd = self.inner.fd;
        Reactor::local().thread_pool().submit(move || sys::fstat(fd))
    }

    pub fn truncate(&self, length: u64) -> Future<()> {
        let fd = self.inner.fd;
        Reactor::local()
            .thread_pool()
            .submit(move || sys::ftruncate(fd, length))
    }

    /// Preallocates disk blocks for `[position, position + length)`,
    /// rounded up to the extent allocation hint.
    pub fn allocate(&self, position: u64, length: u64) -> Future<()> {
        if length == 0 {
            return ready(());
        }
        let fd = self.inner.fd;
        let hint = self.inner.options.extent_allocation_size_hint.max(1);
        let len = align_up(length, hint);
        Reactor::local().thread_pool().submit(move || {
            sys::fallocate(fd, libc::FALLOC_FL_KEEP_SIZE, position, len)
        })
    }

    /// Tells the filesystem a range is no longer needed.
    pub fn discard(&self, offset: u64, length: u64) -> Future<()> {
        let fd = self.inner.fd;
        Reactor::local().thread_pool().submit(move || {
            sys::fallocate(
                fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset,
                length,
            )
        })
    }

    pub fn size(&self) -> Future<u64> {
        match self.inner.kind {
            FileKind::Posix => self.stat().map(|st| st.st_size as u64),
            FileKind::Blockdev => {
                let fd = self.inner.fd;
                Reactor::local().thread_pool().submit(move || {
                    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
                    let mut size: u64 = 0;
                    let r = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };
                    if r < 0 {
                        Err(ReactorError::Sys {
                            ctx: "ioctl(BLKGETSIZE64)",
                            source: std::io::Error::last_os_error(),
                        })
                    } else {
                        Ok(size)
                    }
                })
            }
        }
    }

    /// Closes the file. Pending data must be `flush`ed first for
    /// durability.
    pub fn close(&self) -> Future<()> {
        if self.inner.closed.replace(true) {
            return ready(());
        }
        let fd = self.inner.fd;
        Reactor::local().thread_pool().submit(move || {
            sys::close(fd);
            Ok(())
        })
    }

    /// Streams this directory's entries. Only `{name, optional type}` is
    /// reported; "." and ".." are skipped.
    pub fn list_directory(&self) -> DirectoryLister {
        DirectoryLister {
            file: self.clone(),
            buffered: Rc::new(RefCell::new(VecDeque::new())),
            eof: Rc::new(Cell::new(false)),
        }
    }

    // --- bulk read ---

    /// Reads the given byte range regardless of alignment: the offset is
    /// aligned down and the range widened, one aligned read is issued, and
    /// short reads short of EOF are patched by further aligned probes. The
    /// result is trimmed to exactly the requested range (shorter at EOF).
    pub fn dma_read_bulk(&self, offset: u64, range_size: usize) -> Future<AlignedBuf> {
        self.dma_read_bulk_prio(offset, range_size, default_priority_class())
    }

    pub fn dma_read_bulk_prio(
        &self,
        offset: u64,
        range_size: usize,
        pc: IoPriorityClass,
    ) -> Future<AlignedBuf> {
        let align = self.disk_read_dma_alignment();
        let front = offset & (align - 1);
        let offset = offset - front;
        let to_read = range_size + front as usize;

        let state = Rc::new(RefCell::new(ReadState {
            buf: AlignedBuf::aligned(
                self.memory_dma_alignment(),
                align_up(to_read as u64, align) as usize,
            ),
            offset,
            to_read,
            front: front as usize,
            pos: 0,
            eof: false,
        }));

        let file = self.clone();
        let first = {
            let mut s = state.borrow_mut();
            let probe = std::mem::replace(&mut s.buf, AlignedBuf::empty());
            file.read_dma_unchecked(offset, probe, pc)
        };
        let state2 = Rc::clone(&state);
        let file2 = self.clone();
        first.then(move |(n, buf)| {
            {
                let mut s = state2.borrow_mut();
                s.buf = buf;
                s.pos = n;
            }
            let state3 = Rc::clone(&state2);
            let state4 = Rc::clone(&state2);
            do_until(
                move || state3.borrow().done(),
                move || {
                    let state5 = Rc::clone(&state4);
                    let (cur, left) = {
                        let s = state4.borrow();
                        (s.cur_offset(), s.left_to_read())
                    };
                    file2.read_maybe_eof(cur, left, pc).map(move |chunk| {
                        let mut s = state5.borrow_mut();
                        if chunk.is_empty() {
                            s.eof = true;
                        } else {
                            s.append_new_data(&chunk);
                        }
                    })
                },
            )
            .map(move |()| {
                let mut s = state2.borrow_mut();
                s.trim_buf_before_ret();
                std::mem::replace(&mut s.buf, AlignedBuf::empty())
            })
        })
    }

    /// Reads up to `len` bytes from `pos`, shorter only at EOF; no
    /// alignment requirements.
    pub fn dma_read(&self, pos: u64, len: usize) -> Future<AlignedBuf> {
        self.dma_read_bulk(pos, len).map(move |mut buf| {
            if buf.len() > len {
                buf.trim(len);
            }
            buf
        })
    }

    /// Reads exactly `len` bytes; fails with the EOF error on a short
    /// result.
    pub fn dma_read_exactly(&self, pos: u64, len: usize) -> Future<AlignedBuf> {
        self.dma_read(pos, len).then(move |buf| {
            if buf.len() < len {
                crate::future::failed(Fault::from(ReactorError::Eof))
            } else {
                ready(buf)
            }
        })
    }

    /// Probes from where a short read stopped. A zero-length success or an
    /// EINVAL from reading past EOF both mean end-of-file; anything else
    /// is a real error.
    fn read_maybe_eof(&self, pos: u64, len: usize, pc: IoPriorityClass) -> Future<AlignedBuf> {
        let align = self.disk_read_dma_alignment();
        let buf = AlignedBuf::aligned(
            self.memory_dma_alignment(),
            align_up(len as u64, align) as usize,
        );
        self.read_dma_unchecked(pos, buf, pc).then_wrapped(|f| match f.into_result() {
            Ok((n, mut buf)) => {
                buf.trim(n);
                ready(buf)
            }
            Err(e) => {
                let einval = e
                    .downcast_ref::<ReactorError>()
                    .and_then(|re| re.errno())
                    == Some(libc::EINVAL);
                if einval {
                    ready(AlignedBuf::empty())
                } else {
                    crate::future::failed(e)
                }
            }
        })
    }
}

struct ReadState {
    buf: AlignedBuf,
    offset: u64,
    to_read: usize,
    front: usize,
    pos: usize,
    eof: bool,
}

impl ReadState {
    fn done(&self) -> bool {
        self.eof || self.pos >= self.to_read
    }

    fn cur_offset(&self) -> u64 {
        self.offset + self.pos as u64
    }

    fn left_space(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn left_to_read(&self) -> usize {
        self.to_read - self.pos
    }

    fn append_new_data(&mut self, new_data: &AlignedBuf) {
        let to_copy = self.left_space().min(new_data.len());
        self.buf[self.pos..self.pos + to_copy].copy_from_slice(&new_data[..to_copy]);
        self.pos += to_copy;
    }

    fn have_good_bytes(&self) -> bool {
        self.pos > self.front
    }

    fn trim_buf_before_ret(&mut self) {
        if self.have_good_bytes() {
            let pos = self.pos;
            let front = self.front;
            self.buf.trim(pos);
            self.buf.trim_front(front);
        } else {
            self.buf.trim(0);
        }
    }
}

/// Pull-style directory listing over `getdents64` chunks fetched on the
/// thread pool.
pub struct DirectoryLister {
    file: File,
    buffered: Rc<RefCell<VecDeque<DirectoryEntry>>>,
    eof: Rc<Cell<bool>>,
}

impl DirectoryLister {
    /// Next entry, or `None` once the directory is exhausted.
    pub fn next(&self) -> Future<Option<DirectoryEntry>> {
        if let Some(entry) = self.buffered.borrow_mut().pop_front() {
            return ready(Some(entry));
        }
        if self.eof.get() {
            return ready(None);
        }
        let fd = self.file.inner.fd;
        let buffered = Rc::clone(&self.buffered);
        let eof = Rc::clone(&self.eof);
        let again = self.clone_shallow();
        Reactor::local()
            .thread_pool()
            .submit(move || {
                let mut chunk = vec![0u8; 16 * 1024];
                let n = sys::getdents64(fd, &mut chunk)?;
                chunk.truncate(n);
                Ok((n, parse_dirents(&chunk)))
            })
            .then(move |(raw, entries)| {
                // A chunk of nothing but "." and ".." is not the end.
                if raw == 0 {
                    eof.set(true);
                } else {
                    buffered.borrow_mut().extend(entries);
                }
                again.next()
            })
    }

    fn clone_shallow(&self) -> DirectoryLister {
        DirectoryLister {
            file: self.file.clone(),
            buffered: Rc::clone(&self.buffered),
            eof: Rc::clone(&self.eof),
        }
    }
}

fn parse_dirents(chunk: &[u8]) -> Vec<DirectoryEntry> {
    // struct linux_dirent64: u64 ino, i64 off, u16 reclen, u8 type,
    // then the NUL-terminated name.
    const HEADER: usize = 8 + 8 + 2 + 1;
    let mut entries = Vec::new();
    let mut at = 0;
    while at + HEADER <= chunk.len() {
        let reclen = u16::from_ne_bytes([chunk[at + 16], chunk[at + 17]]) as usize;
        if reclen == 0 || at + reclen > chunk.len() {
            break;
        }
        let d_type = chunk[at + 18];
        let name_bytes = &chunk[at + HEADER..at + reclen];
        let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();
        at += reclen;
        if name == "." || name == ".." {
            continue;
        }
        let entry_type = match d_type {
            libc::DT_BLK => Some(DirectoryEntryType::BlockDevice),
            libc::DT_CHR => Some(DirectoryEntryType::CharDevice),
            libc::DT_DIR => Some(DirectoryEntryType::Directory),
            libc::DT_FIFO => Some(DirectoryEntryType::Fifo),
            libc::DT_LNK => Some(DirectoryEntryType::Link),
            libc::DT_REG => Some(DirectoryEntryType::Regular),
            libc::DT_SOCK => Some(DirectoryEntryType::Socket),
            _ => None,
        };
        entries.push(DirectoryEntry { name, entry_type });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::semaphore::Semaphore;

    fn test_runtime() -> crate::runtime::Runtime {
        // Not every CI filesystem takes O_DIRECT; the alignment contract is
        // exercised all the same.
        Builder::new().strict_dma(false).try_build().unwrap()
    }

    fn tmp_path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn test_write_then_read_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runtime = test_runtime();
        let path = tmp_path(&dir, "t.tmp");
        let path2 = path.clone();

        runtime.block_on(move || {
            open_file_dma(&path, OpenFlags::RW | OpenFlags::CREATE).then(|file| {
                let mut buf = AlignedBuf::aligned(4096, 4096);
                buf.fill(0xA5);
                let file2 = file.clone();
                file.write_dma(0, buf)
                    .map(|(n, _buf)| assert_eq!(n, 4096))
                    .then(move |()| file2.flush())
                    .then(move |()| file.close())
            })
        })?;

        let matched = runtime.block_on(move || {
            open_file_dma(&path2, OpenFlags::RO).then(|file| {
                let buf = AlignedBuf::aligned(4096, 4096);
                file.read_dma(0, buf).then(move |(n, buf)| {
                    assert_eq!(n, 4096);
                    let ok = buf.iter().all(|&b| b == 0xA5);
                    file.close().map(move |()| ok)
                })
            })
        })?;
        assert!(matched);
        Ok(())
    }

    #[test]
    fn test_bulk_read_hides_alignment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runtime = test_runtime();
        let path = tmp_path(&dir, "bulk.tmp");

        let got = runtime.block_on(move || {
            open_file_dma(&path, OpenFlags::RW | OpenFlags::CREATE).then(|file| {
                let mut buf = AlignedBuf::aligned(4096, 8192);
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = (i % 251) as u8;
                }
                let file2 = file.clone();
                let file3 = file.clone();
                file.write_dma(0, buf)
                    // Unaligned offset and length, crossing a block edge.
                    .then(move |(_, _)| file2.dma_read(1000, 5000))
                    .then(move |exact| {
                        // The raw bulk read keeps the widened aligned tail.
                        file3.dma_read_bulk(1000, 5000).map(move |bulk| {
                            bulk.len() >= 5000
                                && exact.len() == 5000
                                && (0..5000).all(|i| exact[i] == ((i + 1000) % 251) as u8)
                        })
                    })
            })
        })?;
        assert!(got);
        Ok(())
    }

    #[test]
    fn test_bulk_read_trims_at_eof() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runtime = test_runtime();
        let path = tmp_path(&dir, "eof.tmp");

        let (len, exact_fails) = runtime.block_on(move || {
            open_file_dma(&path, OpenFlags::RW | OpenFlags::CREATE).then(|file| {
                let mut buf = AlignedBuf::aligned(4096, 4096);
                buf.fill(0x5A);
                let file2 = file.clone();
                let file3 = file.clone();
                file.write_dma(0, buf)
                    .then(move |_| file2.dma_read(0, 100_000))
                    .then(move |buf| {
                        file3
                            .dma_read_exactly(0, 100_000)
                            .then_wrapped(move |f| ready((buf.len(), f.failed())))
                    })
            })
        })?;
        assert_eq!(len, 4096);
        assert!(exact_fails);
        Ok(())
    }

    #[test]
    fn test_read_at_eof_returns_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runtime = test_runtime();
        let path = tmp_path(&dir, "empty.tmp");

        let len = runtime.block_on(move || {
            open_file_dma(&path, OpenFlags::RW | OpenFlags::CREATE)
                .then(|file| file.dma_read(0, 4096))
                .map(|buf| buf.len())
        })?;
        assert_eq!(len, 0);
        Ok(())
    }

    #[test]
    fn test_parallel_block_writes_and_reads() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runtime = test_runtime();
        let path = tmp_path(&dir, "par.tmp");
        const BLOCKS: usize = 64;

        runtime.block_on(move || {
            open_file_dma(&path, OpenFlags::RW | OpenFlags::CREATE).then(|file| {
                let par = Semaphore::new(16);
                let file2 = file.clone();
                crate::future::parallel_for_each(0..BLOCKS, move |i| {
                    let file = file.clone();
                    let par = par.clone();
                    par.wait(1).then(move |()| {
                        let mut wbuf = AlignedBuf::aligned(4096, 4096);
                        wbuf.fill(i as u8);
                        let file_r = file.clone();
                        file.write_dma(i as u64 * 4096, wbuf)
                            .then(move |(n, _)| {
                                assert_eq!(n, 4096);
                                file_r.read_dma(
                                    i as u64 * 4096,
                                    AlignedBuf::aligned(4096, 4096),
                                )
                            })
                            .map(move |(n, rbuf)| {
                                assert_eq!(n, 4096);
                                assert!(rbuf.iter().all(|&b| b == i as u8));
                            })
                            .finally(move || {
                                par.signal(1);
                                ready(())
                            })
                    })
                })
                .then(move |()| file2.flush())
            })
        })?;
        Ok(())
    }

    #[test]
    fn test_allocate_discard_truncate_size() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runtime = test_runtime();
        let path = tmp_path(&dir, "meta.tmp");

        let size = runtime.block_on(move || {
            open_file_dma(&path, OpenFlags::RW | OpenFlags::CREATE).then(|file| {
                let f2 = file.clone();
                let f3 = file.clone();
                let f4 = file.clone();
                file.allocate(0, 64 * 1024)
                    .then(move |()| f2.truncate(12 * 1024))
                    .then(move |()| f3.discard(4096, 4096))
                    .then(move |()| f4.size())
            })
        })?;
        assert_eq!(size, 12 * 1024);
        Ok(())
    }

    #[test]
    fn test_read_routed_through_remote_coordinator() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        // Two shards, one I/O queue: shard 1's requests travel the fabric
        // to coordinator shard 0 and the completions travel back.
        let runtime = Builder::new()
            .shards(2)
            .num_io_queues(1)
            .strict_dma(false)
            .try_build()?;
        let path = tmp_path(&dir, "routed.tmp");
        let path2 = path.clone();

        runtime.block_on(move || {
            open_file_dma(&path, OpenFlags::RW | OpenFlags::CREATE).then(|file| {
                let mut buf = AlignedBuf::aligned(4096, 4096);
                buf.fill(0xC3);
                let f2 = file.clone();
                file.write_dma(0, buf)
                    .then(move |_| f2.flush())
            })
        })?;

        let ok = runtime.block_on(move || {
            crate::smp::submit_to(1, move || {
                open_file_dma(&path2, OpenFlags::RO).then(|file| {
                    assert_eq!(crate::smp::this_shard_id(), 1);
                    file.read_dma(0, AlignedBuf::aligned(4096, 4096))
                        .map(|(n, buf)| n == 4096 && buf.iter().all(|&b| b == 0xC3))
                })
            })
        })?;
        assert!(ok);
        Ok(())
    }

    #[test]
    fn test_list_directory_skips_dot_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.txt"), b"x")?;
        std::fs::write(dir.path().join("b.txt"), b"y")?;
        std::fs::create_dir(dir.path().join("sub"))?;

        let runtime = test_runtime();
        let dir_path = dir.path().to_str().unwrap().to_string();
        let mut names = runtime.block_on(move || {
            open_directory(&dir_path).then(|dir| {
                let lister = Rc::new(dir.list_directory());
                let seen: Rc<RefCell<Vec<DirectoryEntry>>> = Rc::new(RefCell::new(Vec::new()));
                let lister2 = Rc::clone(&lister);
                let seen2 = Rc::clone(&seen);
                let stop = Rc::new(Cell::new(false));
                let stop2 = Rc::clone(&stop);
                do_until(
                    move || stop.get(),
                    move || {
                        let seen = Rc::clone(&seen2);
                        let stop = Rc::clone(&stop2);
                        lister2.next().map(move |entry| match entry {
                            Some(e) => seen.borrow_mut().push(e),
                            None => stop.set(true),
                        })
                    },
                )
                .map(move |()| seen.borrow().clone())
            })
        })?;
        names.sort_by(|a, b| a.name.cmp(&b.name));
        let plain: Vec<(String, Option<DirectoryEntryType>)> =
            names.into_iter().map(|e| (e.name, e.entry_type)).collect();
        assert_eq!(
            plain,
            vec![
                ("a.txt".to_string(), Some(DirectoryEntryType::Regular)),
                ("b.txt".to_string(), Some(DirectoryEntryType::Regular)),
                ("sub".to_string(), Some(DirectoryEntryType::Directory)),
            ]
        );
        Ok(())
    }
}
