//! Thin checked wrappers over the raw syscall surface the reactor drives:
//! epoll, eventfd, Linux native AIO, POSIX per-thread timers and the
//! blocking file-metadata calls that run on the fallback thread pool.

use crate::error::ReactorError;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

pub(crate) type Result<T> = std::result::Result<T, ReactorError>;

fn check(ctx: &'static str, ret: libc::c_long) -> Result<libc::c_long> {
    if ret < 0 {
        Err(ReactorError::Sys {
            ctx,
            source: io::Error::last_os_error(),
        })
    } else {
        Ok(ret)
    }
}

fn check_i32(ctx: &'static str, ret: libc::c_int) -> Result<libc::c_int> {
    check(ctx, ret as libc::c_long).map(|r| r as libc::c_int)
}

// ---------------------------------------------------------------------------
// epoll

pub(crate) fn epoll_create() -> Result<RawFd> {
    check_i32("epoll_create1", unsafe {
        libc::epoll_create1(libc::EPOLL_CLOEXEC)
    })
}

pub(crate) fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, key: u64) -> Result<()> {
    let mut ev = libc::epoll_event { events, u64: key };
    check_i32("epoll_ctl", unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) })?;
    Ok(())
}

pub(crate) fn epoll_del(epfd: RawFd, fd: RawFd) -> Result<()> {
    // The event argument is ignored for EPOLL_CTL_DEL on modern kernels but
    // must still be non-null on pre-2.6.9 ABIs.
    let mut ev = libc::epoll_event { events: 0, u64: 0 };
    check_i32("epoll_ctl", unsafe {
        libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, &mut ev)
    })?;
    Ok(())
}

/// `epoll_pwait` with the given signal mask active while blocked. A timeout
/// of `None` blocks indefinitely; `Some(0)` polls.
pub(crate) fn epoll_pwait(
    epfd: RawFd,
    events: &mut [libc::epoll_event],
    timeout_ms: Option<i32>,
    sigmask: Option<&libc::sigset_t>,
) -> Result<usize> {
    let timeout = timeout_ms.unwrap_or(-1);
    let mask = sigmask.map_or(std::ptr::null(), |m| m as *const _);
    let r = unsafe {
        libc::epoll_pwait(epfd, events.as_mut_ptr(), events.len() as libc::c_int, timeout, mask)
    };
    if r < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            // A signal woke us; the caller rechecks its state either way.
            return Ok(0);
        }
        return Err(ReactorError::Sys { ctx: "epoll_pwait", source: err });
    }
    Ok(r as usize)
}

// ---------------------------------------------------------------------------
// eventfd

pub(crate) fn eventfd() -> Result<RawFd> {
    check_i32("eventfd", unsafe {
        libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
    })
}

/// Adds `count` to an eventfd. Used for cross-thread reactor wakeup, so it
/// must stay signal- and thread-safe: a plain write on a raw fd.
pub(crate) fn eventfd_write(fd: RawFd, count: u64) {
    let buf = count.to_ne_bytes();
    // An EAGAIN here means the counter is saturated, which still leaves the
    // fd readable; the wakeup has been delivered either way.
    unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
}

pub(crate) fn eventfd_drain(fd: RawFd) -> u64 {
    let mut buf = [0u8; 8];
    let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if r == 8 { u64::from_ne_bytes(buf) } else { 0 }
}

pub(crate) fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

// ---------------------------------------------------------------------------
// Linux native AIO. The libc crate exposes the syscall numbers but not the
// control-block layout, so the ABI structs live here.

pub(crate) type AioContextT = libc::c_ulong;

pub(crate) const IOCB_CMD_PREAD: u16 = 0;
pub(crate) const IOCB_CMD_PWRITE: u16 = 1;
pub(crate) const IOCB_CMD_PREADV: u16 = 7;
pub(crate) const IOCB_CMD_PWRITEV: u16 = 8;

/// `struct iocb` from `<linux/aio_abi.h>`, little-endian field order.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    pub(crate) fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }

    pub(crate) fn prepare(opcode: u16, fd: RawFd, buf: u64, nbytes: u64, offset: i64) -> Self {
        let mut iocb = Self::zeroed();
        iocb.aio_lio_opcode = opcode;
        iocb.aio_fildes = fd as u32;
        iocb.aio_buf = buf;
        iocb.aio_nbytes = nbytes;
        iocb.aio_offset = offset;
        iocb
    }
}

/// `struct io_event` from `<linux/aio_abi.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl IoEvent {
    pub(crate) fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

pub(crate) fn io_setup(nr_events: libc::c_long) -> Result<AioContextT> {
    let mut ctx: AioContextT = 0;
    check("io_setup", unsafe {
        libc::syscall(libc::SYS_io_setup, nr_events, &mut ctx)
    })?;
    Ok(ctx)
}

pub(crate) fn io_destroy(ctx: AioContextT) {
    unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
}

/// Submits a batch of control blocks; returns how many were accepted.
pub(crate) fn io_submit(ctx: AioContextT, iocbs: &[*mut Iocb]) -> Result<usize> {
    let r = check("io_submit", unsafe {
        libc::syscall(libc::SYS_io_submit, ctx, iocbs.len() as libc::c_long, iocbs.as_ptr())
    })?;
    Ok(r as usize)
}

/// Non-blocking completion reap (zero timeout).
pub(crate) fn io_getevents(ctx: AioContextT, events: &mut [IoEvent]) -> Result<usize> {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let r = check("io_getevents", unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            0 as libc::c_long,
            events.len() as libc::c_long,
            events.as_mut_ptr(),
            &mut ts,
        )
    })?;
    Ok(r as usize)
}

// ---------------------------------------------------------------------------
// POSIX per-thread interval timer, used for the task-quota signal.

pub(crate) struct ThreadTimer {
    timer: libc::timer_t,
}

impl ThreadTimer {
    /// Creates a CLOCK_MONOTONIC timer delivering `signo` to the calling
    /// thread specifically (SIGEV_THREAD_ID).
    pub(crate) fn new_thread_signal(signo: libc::c_int) -> Result<Self> {
        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = signo;
        sev.sigev_notify_thread_id = unsafe { libc::syscall(libc::SYS_gettid) } as i32;

        let mut timer: libc::timer_t = std::ptr::null_mut();
        check_i32("timer_create", unsafe {
            libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer)
        })?;
        Ok(Self { timer })
    }

    pub(crate) fn arm_periodic(&self, period: std::time::Duration) -> Result<()> {
        let interval = libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: period.subsec_nanos() as libc::c_long,
        };
        let spec = libc::itimerspec { it_interval: interval, it_value: interval };
        check_i32("timer_settime", unsafe {
            libc::timer_settime(self.timer, 0, &spec, std::ptr::null_mut())
        })?;
        Ok(())
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        unsafe { libc::timer_delete(self.timer) };
    }
}

// ---------------------------------------------------------------------------
// Blocking file-plane calls. These only run on the thread-pool worker.

pub(crate) fn open(path: &std::ffi::CStr, flags: libc::c_int, mode: libc::mode_t) -> Result<RawFd> {
    check_i32("open", unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) })
}

pub(crate) fn fstat(fd: RawFd) -> Result<libc::stat> {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    check_i32("fstat", unsafe { libc::fstat(fd, &mut st) })?;
    Ok(st)
}

pub(crate) fn fsync(fd: RawFd) -> Result<()> {
    check_i32("fsync", unsafe { libc::fsync(fd) }).map(|_| ())
}

pub(crate) fn ftruncate(fd: RawFd, len: u64) -> Result<()> {
    check_i32("ftruncate", unsafe { libc::ftruncate(fd, len as libc::off_t) }).map(|_| ())
}

pub(crate) fn fallocate(fd: RawFd, mode: libc::c_int, offset: u64, len: u64) -> Result<()> {
    check_i32("fallocate", unsafe {
        libc::fallocate(fd, mode, offset as libc::off_t, len as libc::off_t)
    })
    .map(|_| ())
}

/// Device logical block size, for block-device alignment queries.
pub(crate) fn blk_ssz_get(fd: RawFd) -> Result<u64> {
    const BLKSSZGET: libc::c_ulong = 0x1268;
    let mut size: libc::c_int = 0;
    check_i32("ioctl(BLKSSZGET)", unsafe { libc::ioctl(fd, BLKSSZGET, &mut size) })?;
    Ok(size as u64)
}

/// One `getdents64` chunk; returns raw bytes to be parsed by the caller.
pub(crate) fn getdents64(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let r = check("getdents64", unsafe {
        libc::syscall(libc::SYS_getdents64, fd, buf.as_mut_ptr(), buf.len())
    })?;
    Ok(r as usize)
}
