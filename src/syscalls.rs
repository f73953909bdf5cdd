// src/syscalls.rs
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{MinuetError, MinuetResult};

/// Last errno as a raw integer, for the `!errno` signed-length encoding
/// used on the socket hot paths.
pub fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Create the listening TCP socket: SO_LINGER per config, SO_REUSEADDR,
/// bind 0.0.0.0:port, listen with backlog 8. The fd is returned blocking;
/// the caller flips it non-blocking after epoll registration.
pub fn create_listen_socket(port: u16, opt_linger: bool) -> MinuetResult<c_int> {
    if port < 1024 {
        return Err(MinuetError::InvalidPort(port));
    }

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // Lingering close: discard the send queue after one second when
        // enabled, plain close otherwise.
        let lg = libc::linger {
            l_onoff: opt_linger as c_int,
            l_linger: opt_linger as c_int,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &lg as *const _ as *const c_void,
            mem::size_of_val(&lg) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, 8) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Accept one pending connection. `None` means the backlog is drained
/// (EAGAIN) or the accept failed transiently; the caller stops its loop.
pub fn accept_connection(listen_fd: c_int) -> Option<(c_int, SocketAddrV4)> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            return None;
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Some((fd, SocketAddrV4::new(ip, port)))
    }
}

pub fn set_nonblocking(fd: c_int) -> bool {
    debug_assert!(fd >= 0);
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        flags >= 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0
    }
}

/// Fire-and-forget reply on a socket that is about to be closed
/// ("Server Busy!" rejections).
pub fn send_bytes(fd: c_int, bytes: &[u8]) -> bool {
    unsafe { libc::send(fd, bytes.as_ptr() as *const c_void, bytes.len(), 0) >= 0 }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll ----

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Thin handle over an epoll instance. `epoll_ctl` is thread-safe, so the
/// handle is shared across the reactor and the workers behind an `Arc`;
/// re-arming a ONESHOT fd from a worker goes straight through `change`.
pub struct Epoll {
    fd: c_int,
}

impl Epoll {
    pub fn new() -> MinuetResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    pub fn add(&self, fd: c_int, events: u32) -> bool {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn change(&self, fd: c_int, events: u32) -> bool {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn remove(&self, fd: c_int) -> bool {
        if fd < 0 {
            return false;
        }
        unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) == 0 }
    }

    /// Wait for readiness. EINTR reports zero events so the reactor loop
    /// re-checks its shutdown flag instead of dying on a signal.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let n = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(n as usize)
        }
    }

    fn ctl(&self, op: c_int, fd: c_int, events: u32) -> bool {
        if fd < 0 {
            return false;
        }
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) == 0 }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
