// src/conn.rs
use std::mem;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use libc::{c_int, c_void};
use tracing::debug;

use crate::buffer::Buffer;
use crate::request::Request;
use crate::response::{HttpCode, Response};
use crate::syscalls;

/// Level-triggered send window: a write turn keeps draining while more
/// than this many bytes remain.
const SWND_SIZE: usize = 10240;

/// Connection-wide values shared by every client of one server: the
/// document root, the connection trigger mode, and the live client count
/// used for admission control.
pub struct ServerCtx {
    pub base: PathBuf,
    pub et: bool,
    pub user_count: AtomicI32,
}

impl ServerCtx {
    pub fn new(base: PathBuf, et: bool) -> Self {
        Self { base, et, user_count: AtomicI32::new(0) }
    }
}

struct ConnInner {
    buf: Buffer,
    req: Request,
    res: Response,
    // Fronts of the two outbound segments, advanced as bytes leave.
    res_off: usize,
    file_off: usize,
}

/// One client connection: an exclusively owned socket fd, the inbound
/// buffer, and the request/response pair in flight.
///
/// EPOLLONESHOT guarantees a single worker touches a connection at a time;
/// the inner mutex makes that guarantee visible to the compiler and is
/// uncontended by construction.
pub struct Conn {
    fd: c_int,
    addr: SocketAddrV4,
    ctx: Arc<ServerCtx>,
    closed: AtomicBool,
    inner: Mutex<ConnInner>,
}

impl Conn {
    pub fn new(fd: c_int, addr: SocketAddrV4, ctx: Arc<ServerCtx>) -> Self {
        ctx.user_count.fetch_add(1, Ordering::AcqRel);
        debug!("create connection {fd} from {addr}");
        Self {
            fd,
            addr,
            ctx,
            closed: AtomicBool::new(false),
            inner: Mutex::new(ConnInner {
                buf: Buffer::new(),
                req: Request::new(),
                res: Response::new(),
                res_off: 0,
                file_off: 0,
            }),
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the socket and release the user-count slot. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            syscalls::close_fd(self.fd);
            self.ctx.user_count.fetch_sub(1, Ordering::AcqRel);
            debug!("close connection {}", self.fd);
        }
    }

    /// Pull inbound bytes into the buffer: once when level-triggered,
    /// drained to exhaustion when edge-triggered. Returns the byte count
    /// or `!errno` (EAGAIN marks the end of an edge-triggered drain).
    pub fn read(&self) -> isize {
        let mut inner = self.lock();
        let mut total = 0isize;
        loop {
            let n = inner.buf.read_fd(self.fd);
            if n < 0 {
                return n;
            }
            total += n;
            if n == 0 || !self.ctx.et {
                break;
            }
        }
        total
    }

    /// Flush the response with `writev` over the header block and the file
    /// body, advancing both fronts in order. Keeps looping while bytes
    /// remain and (edge-triggered or more than a send window is pending).
    /// Returns the byte count or `!errno`.
    pub fn write(&self) -> isize {
        let mut inner = self.lock();
        let mut total = 0isize;
        loop {
            let (head_ptr, head_len) = {
                let head = inner.res.head();
                (head.as_ptr(), head.len())
            };
            let (file_ptr, file_len) = {
                let file = inner.res.file_view();
                (file.as_ptr(), file.len())
            };
            let head_left = head_len - inner.res_off;
            let file_left = file_len - inner.file_off;

            let iov = [
                libc::iovec {
                    iov_base: unsafe { head_ptr.add(inner.res_off) } as *mut c_void,
                    iov_len: head_left,
                },
                libc::iovec {
                    iov_base: unsafe { file_ptr.add(inner.file_off) } as *mut c_void,
                    iov_len: file_left,
                },
            ];
            let n = unsafe { libc::writev(self.fd, iov.as_ptr(), iov.len() as c_int) };
            if n < 0 {
                return !(syscalls::errno() as isize);
            }
            let n = n as usize;
            if n > head_left {
                inner.file_off += n - head_left;
                inner.res_off = head_len;
            } else {
                inner.res_off += n;
            }
            total += n as isize;

            let left = (head_len - inner.res_off) + (file_len - inner.file_off);
            if left == 0 || !(self.ctx.et || left > SWND_SIZE) {
                break;
            }
        }
        total
    }

    /// Parse whatever the buffer holds and compose the matching response.
    /// Returns false when there is nothing to process (stay reading); a
    /// parse failure still returns true, with a 400 composed.
    pub fn process(&self) -> bool {
        let mut inner = self.lock();
        inner.req.clear();
        if inner.buf.is_empty() && !inner.req.has_pending() {
            return false;
        }

        let data = mem::take(&mut inner.buf);
        let parsed = inner.req.parse(data);

        let ConnInner { req, res, .. } = &mut *inner;
        if parsed {
            res.init(&self.ctx.base, req.path(), HttpCode::Unknown, req.is_keep_alive());
        } else {
            res.init(&self.ctx.base, req.path(), HttpCode::BadRequest, false);
        }
        res.compose();

        inner.res_off = 0;
        inner.file_off = 0;
        debug!(
            "composed response for {}: head {} bytes, file {} bytes",
            self.fd,
            inner.res.head().len(),
            inner.res.file_view().len()
        );
        true
    }

    pub fn to_write_bytes(&self) -> usize {
        let inner = self.lock();
        (inner.res.head().len() - inner.res_off) + (inner.res.file_view().len() - inner.file_off)
    }

    pub fn is_keep_alive(&self) -> bool {
        self.lock().req.is_keep_alive()
    }

    fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock().expect("connection state poisoned")
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::Ipv4Addr;

    fn socketpair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        unsafe {
            assert_eq!(
                libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()),
                0
            );
        }
        (fds[0], fds[1])
    }

    fn peer_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000)
    }

    fn test_ctx() -> (tempfile::TempDir, Arc<ServerCtx>) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), b"HELLO").unwrap();
        let ctx = Arc::new(ServerCtx::new(dir.path().to_path_buf(), false));
        (dir, ctx)
    }

    #[test]
    fn user_count_balances_across_lifecycles() {
        let (_dir, ctx) = test_ctx();
        assert_eq!(ctx.user_count.load(Ordering::Acquire), 0);
        for _ in 0..3 {
            let (a, b) = socketpair();
            {
                let conn = Conn::new(a, peer_addr(), Arc::clone(&ctx));
                assert_eq!(ctx.user_count.load(Ordering::Acquire), 1);
                // Idempotent: a second close must not double-decrement.
                conn.close();
                conn.close();
                assert_eq!(ctx.user_count.load(Ordering::Acquire), 0);
            }
            assert_eq!(ctx.user_count.load(Ordering::Acquire), 0);
            syscalls::close_fd(b);
        }
    }

    #[test]
    fn process_without_input_reports_idle() {
        let (_dir, ctx) = test_ctx();
        let (a, b) = socketpair();
        let conn = Conn::new(a, peer_addr(), ctx);
        assert!(!conn.process());
        syscalls::close_fd(b);
    }

    #[test]
    fn read_process_write_roundtrip() {
        let (_dir, ctx) = test_ctx();
        let (a, b) = socketpair();
        let conn = Conn::new(a, peer_addr(), ctx);

        let request = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";
        unsafe {
            assert_eq!(
                libc::write(b, request.as_ptr() as *const c_void, request.len()),
                request.len() as isize
            );
        }

        let n = conn.read();
        assert_eq!(n, request.len() as isize);
        assert!(conn.process());
        assert!(conn.is_keep_alive());
        assert!(conn.to_write_bytes() > 0);

        let written = conn.write();
        assert!(written > 0);
        assert_eq!(conn.to_write_bytes(), 0);

        let mut out = vec![0u8; 4096];
        let got = unsafe { libc::read(b, out.as_mut_ptr() as *mut c_void, out.len()) };
        let text = String::from_utf8_lossy(&out[..got as usize]).into_owned();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("HELLO"));

        syscalls::close_fd(b);
    }

    #[test]
    fn malformed_request_composes_400() {
        let (_dir, ctx) = test_ctx();
        let (a, b) = socketpair();
        let conn = Conn::new(a, peer_addr(), ctx);

        unsafe {
            libc::write(b, b"GARBAGE\r\n".as_ptr() as *const c_void, 9);
        }
        assert!(conn.read() > 0);
        assert!(conn.process());
        assert!(!conn.is_keep_alive());

        conn.write();
        let mut out = vec![0u8; 4096];
        let got = unsafe { libc::read(b, out.as_mut_ptr() as *mut c_void, out.len()) };
        let text = String::from_utf8_lossy(&out[..got as usize]).into_owned();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
        assert!(text.contains("Connection: close\r\n"));

        syscalls::close_fd(b);
    }
}
