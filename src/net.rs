//! The network-stack boundary. The stacks themselves (native TCP/IP, DPDK
//! glue, TLS) are external collaborators; the core only defines the
//! interface they plug into and wires up the default posix stack over
//! pollable fds.

use crate::error::ReactorError;
use crate::future::{ready, Future};
use crate::reactor::{PollFlags, PollableFd};
use anyhow::Result;
use std::net::SocketAddr;

/// The closed surface a network stack provides to the core.
pub trait NetworkStack {
    fn name(&self) -> &'static str;

    /// Binds a listening socket; accepting rides the pollable fd's
    /// readable future.
    fn listen(&self, addr: SocketAddr) -> Result<PollableFd>;

    /// Initiates a non-blocking connect; the future resolves when the
    /// socket is writable (connected).
    fn connect(&self, addr: SocketAddr) -> Future<PollableFd>;

    /// Binds an unconnected datagram socket.
    fn udp_channel(&self, addr: SocketAddr) -> Result<PollableFd>;
}

/// Returns the stack registered under `name`. The core only knows the
/// posix stack; alternative stacks are matched by the host application
/// before falling back here.
pub fn make_network_stack(name: &str) -> Result<Box<dyn NetworkStack>> {
    match name {
        "posix" => Ok(Box::new(PosixStack)),
        other => anyhow::bail!("unknown network stack '{}'", other),
    }
}

struct PosixStack;

fn sockaddr_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn make_socket(addr: &SocketAddr, typ: libc::c_int) -> Result<libc::c_int> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(family, typ | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0)
    };
    if fd < 0 {
        return Err(ReactorError::Sys {
            ctx: "socket",
            source: std::io::Error::last_os_error(),
        }
        .into());
    }
    Ok(fd)
}

impl NetworkStack for PosixStack {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn listen(&self, addr: SocketAddr) -> Result<PollableFd> {
        let fd = make_socket(&addr, libc::SOCK_STREAM)?;
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let (storage, len) = sockaddr_storage(&addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc == 0 {
            let rc = unsafe { libc::listen(fd, 128) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(ReactorError::Sys { ctx: "listen", source: err }.into());
            }
        } else {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ReactorError::Sys { ctx: "bind", source: err }.into());
        }
        Ok(PollableFd::new(fd, PollFlags::empty()))
    }

    fn connect(&self, addr: SocketAddr) -> Future<PollableFd> {
        let fd = match make_socket(&addr, libc::SOCK_STREAM) {
            Ok(fd) => fd,
            Err(e) => return crate::future::failed(e),
        };
        let (storage, len) = sockaddr_storage(&addr);
        let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe { libc::close(fd) };
                return crate::future::failed(
                    ReactorError::Sys { ctx: "connect", source: err }.into(),
                );
            }
        }
        let pfd = PollableFd::new(fd, PollFlags::empty());
        pfd.writeable().then(move |()| {
            // Writability after EINPROGRESS means the handshake settled;
            // SO_ERROR tells how.
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    pfd.raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut _ as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc != 0 || err != 0 {
                let errno = if rc != 0 {
                    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
                } else {
                    err
                };
                return crate::future::failed(ReactorError::sys("connect", errno).into());
            }
            ready(pfd)
        })
    }

    fn udp_channel(&self, addr: SocketAddr) -> Result<PollableFd> {
        let fd = make_socket(&addr, libc::SOCK_DGRAM)?;
        let (storage, len) = sockaddr_storage(&addr);
        let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ReactorError::Sys { ctx: "bind", source: err }.into());
        }
        Ok(PollableFd::new(fd, PollFlags::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;

    #[test]
    fn test_posix_stack_tcp_echo_once() -> anyhow::Result<()> {
        let runtime = Builder::new().try_build()?;
        let echoed = runtime.block_on(|| {
            let stack = make_network_stack("posix").expect("posix stack");
            let listener = stack
                .listen("127.0.0.1:0".parse().unwrap())
                .expect("listen");
            // Discover the kernel-assigned port.
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockname(
                    listener.raw_fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            assert_eq!(rc, 0);
            let sin = unsafe { *(&storage as *const _ as *const libc::sockaddr_in) };
            let port = u16::from_be(sin.sin_port);
            let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

            let accepted = listener.readable().map(move |()| {
                let fd = unsafe {
                    libc::accept4(
                        listener.raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    )
                };
                assert!(fd >= 0);
                (listener, PollableFd::new(fd, PollFlags::OUT))
            });

            let client = stack.connect(addr);
            client.then(move |client| {
                client
                    .write_all(b"hello".to_vec())
                    .then(move |()| accepted)
                    .then(move |(listener, server)| {
                        drop(client);
                        server.read_some(vec![0u8; 16]).map(move |(n, buf)| {
                            drop(server);
                            drop(listener);
                            buf[..n].to_vec()
                        })
                    })
            })
        })?;
        assert_eq!(echoed, b"hello".to_vec());
        Ok(())
    }

    #[test]
    fn test_unknown_stack_is_rejected() {
        let runtime = Builder::new().try_build().unwrap();
        runtime
            .block_on(|| {
                assert!(make_network_stack("exotic").is_err());
                ready(())
            })
            .unwrap();
    }
}
