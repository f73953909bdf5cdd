// src/server.rs
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libc::c_int;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::conn::{Conn, ServerCtx};
use crate::error::{MinuetError, MinuetResult};
use crate::pool::ThreadPool;
use crate::syscalls::{
    self, Epoll, EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP,
};
use crate::timer::Timer;

/// Admission ceiling on simultaneous clients.
pub const MAX_FD: i32 = 65536;

const MAX_EVENTS: usize = 1024;

/// Upper bound on one poll wait, so the shutdown flag is observed promptly
/// even with no timers armed. Never extends past the earliest deadline.
const MAX_WAIT_MS: i64 = 1000;

/// State the worker handlers need besides the connection itself. The epoll
/// handle is shared because `epoll_ctl` is thread-safe and every ONESHOT
/// completion must re-arm its fd before the handler returns.
pub struct IoShared {
    epoll: Epoll,
    connect_event: u32,
}

/// The reactor: accepts clients, waits for readiness, hands read/write
/// turns to the worker pool, and evicts idle connections on timer expiry.
pub struct WebServer {
    timeout_ms: u64,
    listen_fd: c_int,
    listen_event: u32,
    connect_event: u32,
    io: Arc<IoShared>,
    timer: Arc<Mutex<Timer>>,
    pool: ThreadPool,
    ctx: Arc<ServerCtx>,
    connections: HashMap<i32, Arc<Conn>>,
    closed: Arc<AtomicBool>,
}

impl WebServer {
    pub fn new(cfg: &ServerConfig, timer: Timer, pool: ThreadPool) -> MinuetResult<Self> {
        let (listen_event, connect_event) = event_mode(cfg.trigger_mode);
        let ctx = Arc::new(ServerCtx::new(
            cfg.src_dir.clone(),
            connect_event & EPOLLET != 0,
        ));
        if !cfg.src_dir.is_dir() {
            warn!("document root {} is not a directory", cfg.src_dir.display());
        }

        let epoll = Epoll::new()?;
        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.opt_linger)?;
        if !epoll.add(listen_fd, listen_event | EPOLLIN) {
            syscalls::close_fd(listen_fd);
            return Err(MinuetError::Init("failed to register listener".to_string()));
        }
        syscalls::set_nonblocking(listen_fd);
        info!("listen socket {listen_fd} on port {}", cfg.port);

        Ok(Self {
            timeout_ms: cfg.timeout,
            listen_fd,
            listen_event,
            connect_event,
            io: Arc::new(IoShared { epoll, connect_event }),
            timer: Arc::new(Mutex::new(timer)),
            pool,
            ctx,
            connections: HashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag observed once per loop turn; setting it ends [`start`](Self::start).
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    pub fn ctx(&self) -> &Arc<ServerCtx> {
        &self.ctx
    }

    /// Run the reactor until the shutdown flag is set.
    pub fn start(&mut self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        info!("server started, {} workers", self.pool.count());

        while !self.closed.load(Ordering::Acquire) {
            let mut wait_ms = MAX_WAIT_MS;
            if self.timeout_ms > 0 {
                let (expired, next) = self.timer.lock().unwrap().next_tick();
                for fd in expired {
                    self.evict(fd);
                }
                if next >= 0 {
                    wait_ms = wait_ms.min(next);
                }
            }

            let count = match self.io.epoll.wait(&mut events, wait_ms as i32) {
                Ok(count) => count,
                Err(err) => {
                    error!("epoll wait failed: {err}");
                    continue;
                }
            };

            for event in &events[..count] {
                let fd = event.u64 as i32;
                if fd == self.listen_fd {
                    self.deal_listen();
                } else {
                    self.dispatch(fd, event.events);
                }
            }
        }

        info!("server stopped");
    }

    fn deal_listen(&mut self) {
        loop {
            let Some((fd, addr)) = syscalls::accept_connection(self.listen_fd) else {
                return;
            };
            if self.ctx.user_count.load(Ordering::Acquire) >= MAX_FD {
                syscalls::send_bytes(fd, b"Server Busy!");
                syscalls::close_fd(fd);
                warn!("server busy, rejected {addr}");
                return;
            }
            self.add_client(fd, addr);
            if self.listen_event & EPOLLET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: c_int, addr: std::net::SocketAddrV4) {
        let conn = Arc::new(Conn::new(fd, addr, Arc::clone(&self.ctx)));
        // An fd number reused by the kernel replaces its stale table entry.
        self.connections.insert(fd, conn);
        if self.timeout_ms > 0 {
            self.timer
                .lock()
                .unwrap()
                .add_event(fd, Duration::from_millis(self.timeout_ms));
        }
        self.io.epoll.add(fd, self.connect_event | EPOLLIN);
        syscalls::set_nonblocking(fd);
        info!("add client {fd} from {addr}");
    }

    fn dispatch(&mut self, fd: i32, revents: u32) {
        let conn = self
            .connections
            .get(&fd)
            .map(Arc::clone)
            .unwrap_or_else(|| unreachable!("readiness event for unknown fd {fd}"));

        if conn.is_closed() {
            // A worker already tore this one down; prune, never re-dispatch.
            self.connections.remove(&fd);
            return;
        }

        if revents & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0 {
            self.connections.remove(&fd);
            close_conn(&self.io, &conn);
        } else if revents & EPOLLIN != 0 {
            self.extend_time(fd);
            let io = Arc::clone(&self.io);
            self.pool.add_task(move || on_read(&io, &conn));
        } else if revents & EPOLLOUT != 0 {
            self.extend_time(fd);
            let io = Arc::clone(&self.io);
            self.pool.add_task(move || on_write(&io, &conn));
        } else {
            warn!("unknown event mask {revents:#x} for fd {fd}");
        }
    }

    fn extend_time(&self, fd: i32) {
        if self.timeout_ms > 0 {
            self.timer
                .lock()
                .unwrap()
                .adjust_event(fd, Duration::from_millis(self.timeout_ms));
        }
    }

    fn evict(&mut self, fd: i32) {
        if let Some(conn) = self.connections.remove(&fd) {
            info!("idle timeout, closing client {fd}");
            close_conn(&self.io, &conn);
        }
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        syscalls::close_fd(self.listen_fd);
    }
}

/// `(listen_event, connect_event)` for a trigger mode: bit 1 selects
/// edge-triggering for the listener, bit 0 for connections. Connections
/// always carry ONESHOT, so every handler completion re-arms explicitly.
fn event_mode(trigger_mode: u8) -> (u32, u32) {
    let mode = trigger_mode.min(3);
    let listen_event = EPOLLRDHUP | if mode & 0b10 != 0 { EPOLLET } else { 0 };
    let connect_event = EPOLLONESHOT | EPOLLRDHUP | if mode & 0b01 != 0 { EPOLLET } else { 0 };
    (listen_event, connect_event)
}

fn close_conn(io: &IoShared, conn: &Conn) {
    io.epoll.remove(conn.fd());
    conn.close();
}

fn on_read(io: &IoShared, conn: &Conn) {
    if conn.is_closed() {
        return;
    }
    let r = conn.read();
    if r < 0 && !r != libc::EAGAIN as isize {
        debug!("read failed on {}: errno {}", conn.fd(), !r);
        close_conn(io, conn);
        return;
    }
    on_process(io, conn);
}

fn on_write(io: &IoShared, conn: &Conn) {
    if conn.is_closed() {
        return;
    }
    let r = conn.write();
    if conn.to_write_bytes() == 0 {
        if conn.is_keep_alive() {
            on_process(io, conn);
            return;
        }
    } else if r < 0 {
        if !r == libc::EAGAIN as isize {
            // Socket buffer full; ONESHOT disarmed us, so re-arm for the
            // next writable edge.
            io.epoll.change(conn.fd(), io.connect_event | EPOLLOUT);
            return;
        }
        debug!("write failed on {}: errno {}", conn.fd(), !r);
    } else {
        // Partial drain without an error: keep the writable interest.
        io.epoll.change(conn.fd(), io.connect_event | EPOLLOUT);
        return;
    }
    close_conn(io, conn);
}

fn on_process(io: &IoShared, conn: &Conn) {
    if conn.process() {
        io.epoll.change(conn.fd(), io.connect_event | EPOLLOUT);
    } else {
        io.epoll.change(conn.fd(), io.connect_event | EPOLLIN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_mode_selects_event_masks() {
        let (listen, connect) = event_mode(0);
        assert_eq!(listen, EPOLLRDHUP);
        assert_eq!(connect, EPOLLONESHOT | EPOLLRDHUP);

        let (listen, connect) = event_mode(1);
        assert_eq!(listen & EPOLLET, 0);
        assert_ne!(connect & EPOLLET, 0);

        let (listen, connect) = event_mode(2);
        assert_ne!(listen & EPOLLET, 0);
        assert_eq!(connect & EPOLLET, 0);

        let (listen, connect) = event_mode(3);
        assert_ne!(listen & EPOLLET, 0);
        assert_ne!(connect & EPOLLET, 0);

        // Out-of-range modes clamp to 3.
        assert_eq!(event_mode(7), event_mode(3));
    }

    #[test]
    fn low_port_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            src_dir: dir.path().to_path_buf(),
            port: 80,
            ..ServerConfig::default()
        };
        let result = WebServer::new(&cfg, Timer::new(), ThreadPool::new(1));
        assert!(matches!(result, Err(MinuetError::InvalidPort(80))));
    }

    #[test]
    fn server_binds_and_drops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig {
            src_dir: dir.path().to_path_buf(),
            port: 19471,
            ..ServerConfig::default()
        };
        let server = WebServer::new(&cfg, Timer::new(), ThreadPool::new(1)).unwrap();
        assert_eq!(server.ctx().user_count.load(Ordering::Acquire), 0);
        drop(server);
    }
}
