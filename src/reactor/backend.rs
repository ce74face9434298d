//! The epoll reactor backend: one wait primitive per shard, readiness
//! dispatch into pollable-fd promises, and the wakeup eventfd that lets any
//! thread interrupt a sleeping reactor.

use crate::error::{Fault, ReactorError};
use crate::future::{ready, Future, Promise};
use crate::reactor::Reactor;
use crate::sys;
use bitflags::bitflags;
use slab::Slab;
use std::cell::RefCell;
use std::os::unix::io::RawFd;

bitflags! {
    /// Readiness interest/speculation bits of a pollable fd.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        const IN = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
    }
}

/// Epoll key reserved for the wakeup eventfd.
const WAKE_KEY: u64 = u64::MAX;

pub(crate) struct PollableFdState {
    fd: RawFd,
    /// Wanted by pending pollin/pollout promises.
    events_requested: PollFlags,
    /// Currently installed in the epoll set.
    events_epoll: PollFlags,
    /// Known ready from a previous wait or speculation; lets the next
    /// operation skip epoll entirely.
    events_known: PollFlags,
    pollin: Option<Promise<()>>,
    pollout: Option<Promise<()>>,
}

impl PollableFdState {
    fn promise_for(&mut self, event: PollFlags) -> &mut Option<Promise<()>> {
        if event == PollFlags::IN {
            &mut self.pollin
        } else {
            &mut self.pollout
        }
    }
}

pub(crate) struct EpollBackend {
    epfd: RawFd,
    wake_fd: RawFd,
    fds: RefCell<Slab<PollableFdState>>,
}

impl EpollBackend {
    pub(crate) fn try_new() -> sys::Result<Self> {
        let epfd = sys::epoll_create()?;
        let wake_fd = sys::eventfd()?;
        sys::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, libc::EPOLLIN as u32, WAKE_KEY)?;
        Ok(Self {
            epfd,
            wake_fd,
            fds: RefCell::new(Slab::new()),
        })
    }

    /// The fd another thread writes to interrupt this reactor's sleep.
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.wake_fd
    }

    /// Takes ownership of `fd` (closed on forget) and starts tracking it.
    pub(crate) fn attach(&self, fd: RawFd, speculate: PollFlags) -> usize {
        self.fds.borrow_mut().insert(PollableFdState {
            fd,
            events_requested: PollFlags::empty(),
            events_epoll: PollFlags::empty(),
            events_known: speculate,
            pollin: None,
            pollout: None,
        })
    }

    pub(crate) fn raw_fd(&self, key: usize) -> RawFd {
        self.fds.borrow()[key].fd
    }

    pub(crate) fn speculate(&self, key: usize, events: PollFlags) {
        self.fds.borrow_mut()[key].events_known.insert(events);
    }

    fn update_registration(&self, key: usize, state: &mut PollableFdState) {
        let desired = state.events_requested;
        if desired == state.events_epoll {
            return;
        }
        let res = if desired.is_empty() {
            sys::epoll_del(self.epfd, state.fd)
        } else {
            let op = if state.events_epoll.is_empty() {
                libc::EPOLL_CTL_ADD
            } else {
                libc::EPOLL_CTL_MOD
            };
            sys::epoll_ctl(self.epfd, op, state.fd, desired.bits(), key as u64)
        };
        if let Err(e) = res {
            // A registration failure means the fd is gone or invalid; the
            // promises will surface the error on the next wait.
            tracing::warn!("epoll registration failed for fd {}: {}", state.fd, e);
            return;
        }
        state.events_epoll = desired;
    }

    /// Future resolving when `event` readiness is next known for `key`.
    pub(crate) fn poll_event(&self, key: usize, event: PollFlags) -> Future<()> {
        let mut fds = self.fds.borrow_mut();
        let state = &mut fds[key];
        if state.events_known.contains(event) {
            state.events_known.remove(event);
            return ready(());
        }
        assert!(
            !state.events_requested.contains(event),
            "FATAL: overlapping {:?} waiters on one fd",
            event
        );
        state.events_requested.insert(event);
        let mut promise = Promise::new();
        let fut = promise.get_future();
        *state.promise_for(event) = Some(promise);
        self.update_registration(key, state);
        fut
    }

    /// Fails the pending waiter for `event`, if any.
    pub(crate) fn abort(&self, key: usize, event: PollFlags, fault: Fault) {
        let mut promise = {
            let mut fds = self.fds.borrow_mut();
            let state = &mut fds[key];
            let taken = state.promise_for(event).take();
            if taken.is_some() {
                state.events_requested.remove(event);
                self.update_registration(key, state);
            }
            taken
        };
        if let Some(promise) = promise.as_mut() {
            promise.set_exception(fault);
        }
    }

    /// Deregisters and closes the fd; any still-armed promise is dropped,
    /// surfacing a broken-promise failure to its waiter.
    pub(crate) fn forget(&self, key: usize) {
        let state = self.fds.borrow_mut().remove(key);
        if !state.events_epoll.is_empty() {
            let _ = sys::epoll_del(self.epfd, state.fd);
        }
        sys::close(state.fd);
        // Dropping `state` drops the promises here, outside the slab borrow.
    }

    fn complete_event(&self, key: usize, fired: PollFlags) {
        let mut to_fire = [None::<Promise<()>>, None];
        {
            let mut fds = self.fds.borrow_mut();
            let Some(state) = fds.get_mut(key) else {
                return;
            };
            state.events_known.insert(fired);
            for (slot, event) in to_fire.iter_mut().zip([PollFlags::IN, PollFlags::OUT]) {
                if fired.contains(event) && state.events_requested.contains(event) {
                    state.events_requested.remove(event);
                    state.events_known.remove(event);
                    *slot = state.promise_for(event).take();
                }
            }
            self.update_registration(key, state);
        }
        for promise in to_fire.iter_mut() {
            if let Some(promise) = promise {
                promise.set_value(());
            }
        }
    }

    /// Waits for events (or polls, with a zero timeout) and dispatches
    /// readiness. Returns whether anything was processed.
    pub(crate) fn wait_and_process(
        &self,
        timeout_ms: Option<i32>,
        sigmask: Option<&libc::sigset_t>,
    ) -> bool {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 128];
        let n = match sys::epoll_pwait(self.epfd, &mut events, timeout_ms, sigmask) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("epoll_pwait failed: {}", e);
                return false;
            }
        };
        for ev in &events[..n] {
            if ev.u64 == WAKE_KEY {
                sys::eventfd_drain(self.wake_fd);
                continue;
            }
            let mut fired = PollFlags::from_bits_truncate(ev.events);
            // Errors and hangups wake both directions so waiters observe the
            // failure from the subsequent syscall.
            if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                fired |= PollFlags::IN | PollFlags::OUT;
            }
            self.complete_event(ev.u64 as usize, fired);
        }
        n > 0
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        for (_, state) in self.fds.borrow_mut().iter() {
            sys::close(state.fd);
        }
        sys::close(self.wake_fd);
        sys::close(self.epfd);
    }
}

/// A non-blocking fd driven by the reactor's epoll backend. The handle owns
/// the fd; dropping it deregisters and closes.
pub struct PollableFd {
    key: usize,
}

impl PollableFd {
    /// Takes ownership of a non-blocking fd. `speculate` seeds the known
    /// readiness, for fds created in a known-ready state (e.g. a freshly
    /// accepted socket is writable).
    pub fn new(fd: RawFd, speculate: PollFlags) -> Self {
        let key = Reactor::local().backend().attach(fd, speculate);
        PollableFd { key }
    }

    pub fn readable(&self) -> Future<()> {
        Reactor::local().backend().poll_event(self.key, PollFlags::IN)
    }

    pub fn writeable(&self) -> Future<()> {
        Reactor::local().backend().poll_event(self.key, PollFlags::OUT)
    }

    pub fn abort_reader(&self, fault: Fault) {
        Reactor::local().backend().abort(self.key, PollFlags::IN, fault);
    }

    pub fn abort_writer(&self, fault: Fault) {
        Reactor::local().backend().abort(self.key, PollFlags::OUT, fault);
    }

    pub fn shutdown_input(&self) {
        unsafe { libc::shutdown(self.raw_fd(), libc::SHUT_RD) };
        self.abort_reader(Fault::from(ReactorError::Stopped));
    }

    pub fn shutdown_output(&self) {
        unsafe { libc::shutdown(self.raw_fd(), libc::SHUT_WR) };
        self.abort_writer(Fault::from(ReactorError::Stopped));
    }

    pub fn raw_fd(&self) -> RawFd {
        Reactor::local().backend().raw_fd(self.key)
    }

    /// Reads once the fd is readable; retries on a spurious wakeup. A read
    /// that fills the whole buffer speculates continued readability. The fd
    /// must stay open until the future resolves.
    pub fn read_some(&self, buf: Vec<u8>) -> Future<(usize, Vec<u8>)> {
        Self::read_some_inner(self.key, buf)
    }

    fn read_some_inner(key: usize, buf: Vec<u8>) -> Future<(usize, Vec<u8>)> {
        let wait = Reactor::local().backend().poll_event(key, PollFlags::IN);
        wait.then(move |()| {
            let mut buf = buf;
            let fd = Reactor::local().backend().raw_fd(key);
            let r = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    return Self::read_some_inner(key, buf);
                }
                return crate::future::failed(Fault::from(ReactorError::Sys {
                    ctx: "read",
                    source: err,
                }));
            }
            let n = r as usize;
            if n == buf.len() {
                Reactor::local().backend().speculate(key, PollFlags::IN);
            }
            ready((n, buf))
        })
    }

    /// Writes once the fd is writable; a full write speculates continued
    /// writability.
    pub fn write_some(&self, buf: Vec<u8>, from: usize) -> Future<(usize, Vec<u8>)> {
        Self::write_some_inner(self.key, buf, from)
    }

    fn write_some_inner(key: usize, buf: Vec<u8>, from: usize) -> Future<(usize, Vec<u8>)> {
        let wait = Reactor::local().backend().poll_event(key, PollFlags::OUT);
        wait.then(move |()| {
            let fd = Reactor::local().backend().raw_fd(key);
            let r = unsafe {
                libc::send(
                    fd,
                    buf[from..].as_ptr() as *const libc::c_void,
                    buf.len() - from,
                    libc::MSG_NOSIGNAL,
                )
            };
            if r < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    return Self::write_some_inner(key, buf, from);
                }
                return crate::future::failed(Fault::from(ReactorError::Sys {
                    ctx: "send",
                    source: err,
                }));
            }
            let n = r as usize;
            if from + n == buf.len() {
                Reactor::local().backend().speculate(key, PollFlags::OUT);
            }
            ready((n, buf))
        })
    }

    /// Writes the whole buffer, continuing across short writes.
    pub fn write_all(&self, buf: Vec<u8>) -> Future<()> {
        Self::write_all_part(self.key, buf, 0)
    }

    fn write_all_part(key: usize, buf: Vec<u8>, completed: usize) -> Future<()> {
        if completed == buf.len() {
            return ready(());
        }
        Self::write_some_inner(key, buf, completed)
            .then(move |(n, buf)| Self::write_all_part(key, buf, completed + n))
    }
}

impl Drop for PollableFd {
    fn drop(&mut self) {
        if let Some(reactor) = Reactor::try_local() {
            reactor.backend().forget(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let r = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(r, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_readable_fires_on_data() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let got = runtime.block_on(|| {
            let (a, b) = socketpair();
            let reader = PollableFd::new(a, PollFlags::empty());
            let writer = PollableFd::new(b, PollFlags::OUT);
            let read = reader
                .read_some(vec![0u8; 16])
                .map(move |(n, buf)| {
                    drop(reader);
                    buf[..n].to_vec()
                });
            writer
                .write_all(b"ping".to_vec())
                .then(move |()| {
                    drop(writer);
                    read
                })
        })?;
        assert_eq!(got, b"ping".to_vec());
        Ok(())
    }

    #[test]
    fn test_abort_reader_fails_pending_read() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let failed_read = runtime.block_on(|| {
            let (a, _b) = socketpair();
            let reader = std::rc::Rc::new(PollableFd::new(a, PollFlags::empty()));
            let reader2 = std::rc::Rc::clone(&reader);
            let read = reader.readable().then_wrapped(move |f| {
                drop(reader2);
                ready(f.failed())
            });
            reader.abort_reader(anyhow::anyhow!("cancelled"));
            drop(reader);
            read
        })?;
        assert!(failed_read);
        Ok(())
    }

    #[test]
    fn test_speculation_skips_epoll() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        runtime.block_on(|| {
            let (a, b) = socketpair();
            let writer = PollableFd::new(b, PollFlags::OUT);
            // Seeded speculation: the first writeable() must already be ready.
            let fut = writer.writeable();
            assert!(fut.available());
            sys::close(a);
            fut.map(move |()| drop(writer))
        })?;
        Ok(())
    }
}
