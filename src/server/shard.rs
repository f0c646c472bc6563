//! Acceptor shards.
//!
//! Each shard owns one listening socket bound with address/port reuse so
//! the kernel load-balances incoming SYNs across shards, plus (in reactor
//! dispatch) its own reactor. The listener's descriptor is watched by the
//! same epoll set as the shard's connections, so accepting and dispatching
//! run inline in a single thread per shard; shards share no mutable state
//! with each other.

use crate::error::FrameError;
use crate::server::handler::serve_ready;
use crate::server::handshake::{HandshakeContext, HandshakeSender};
use crate::server::{Admit, Connection, Reactor};
use crate::stats::Stats;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Create a listener for one shard.
///
/// `SO_REUSEPORT` (when sharded) lets every shard bind the same address;
/// the kernel then spreads incoming connections across the listeners,
/// avoiding a single-threaded accept bottleneck.
pub(crate) fn bind_listener(
    addr: SocketAddr,
    reuse_port: bool,
    nonblocking: bool,
) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// How accepted connections are admitted.
pub(crate) enum Admission {
    /// Plaintext: straight to the dispatch target.
    Direct,
    /// TLS: through the shared handshake offload queue.
    Offload {
        queue: HandshakeSender,
        tls: Arc<rustls::ServerConfig>,
    },
}

/// Remote control for one shard's listener, usable while the shard thread
/// runs. Closing stops acceptance without disturbing connections that are
/// already registered.
#[derive(Clone)]
pub struct ShardHandle {
    listener: Arc<TcpListener>,
    closed: Arc<AtomicBool>,
}

impl ShardHandle {
    /// Deliberately stop this shard's listener. Blocked or polled accepts
    /// wake with an error the accept loop recognizes as a clean shutdown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = socket2::SockRef::from(&*self.listener).shutdown(std::net::Shutdown::Read);
    }
}

/// One listener + (optionally) one reactor.
pub(crate) struct Shard {
    id: usize,
    listener: Arc<TcpListener>,
    closed: Arc<AtomicBool>,
    reactor: Option<Arc<Reactor>>,
    target: Arc<dyn Admit>,
    admission: Admission,
    stats: Stats,
    max_frame_len: usize,
}

impl Shard {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        listener: Arc<TcpListener>,
        closed: Arc<AtomicBool>,
        reactor: Option<Arc<Reactor>>,
        target: Arc<dyn Admit>,
        admission: Admission,
        stats: Stats,
        max_frame_len: usize,
    ) -> Self {
        Self {
            id,
            listener,
            closed,
            reactor,
            target,
            admission,
            stats,
            max_frame_len,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn handle(&self) -> ShardHandle {
        ShardHandle {
            listener: self.listener.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Run the shard until its listener closes and (in reactor dispatch)
    /// its last connection goes away.
    pub(crate) fn run(self) {
        match self.reactor.clone() {
            Some(reactor) => self.run_reactor(reactor),
            None => self.run_blocking(),
        }
    }

    /// Merged accept + readiness-dispatch loop over this shard's epoll set.
    fn run_reactor(self, reactor: Arc<Reactor>) {
        let listener_fd = self.listener.as_raw_fd();
        if let Err(e) = reactor.register_listener(listener_fd) {
            error!(shard = self.id, error = %e, "failed to watch listener");
            return;
        }
        info!(shard = self.id, "shard started");

        let mut accepting = true;
        loop {
            if !accepting && reactor.is_empty() {
                break;
            }

            let batch = match reactor.wait() {
                Ok(batch) => batch,
                Err(e) => {
                    error!(shard = self.id, error = %e, "poll wait failed");
                    continue;
                }
            };

            for ready in batch {
                if ready.fd == listener_fd {
                    if accepting && !self.accept_ready() {
                        accepting = false;
                        let _ = reactor.deregister_listener(listener_fd);
                        info!(
                            shard = self.id,
                            "listener closed, serving remaining connections"
                        );
                    }
                } else if let Some(conn) = ready.conn {
                    // A registry miss (conn == None) means the connection
                    // was removed concurrently; skip it.
                    if let Err(e) = serve_ready(&conn, &self.stats, self.max_frame_len) {
                        self.log_connection_error(&conn, &e);
                        self.stats.connections.decrement(1.0);
                        if let Err(e) = reactor.deregister(&conn) {
                            warn!(shard = self.id, error = %e, "deregister failed");
                        }
                        // Last handle drops here, closing the socket.
                    }
                }
            }
        }
        debug!(shard = self.id, "shard finished");
    }

    /// Drain the listener. Returns false once the listener has been
    /// deliberately closed.
    fn accept_ready(&self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    // Connection I/O is blocking; only the listener polls.
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(shard = self.id, peer = %peer, error = %e, "accept setup failed");
                        continue;
                    }
                    self.admit_accepted(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return false;
                    }
                    // A single bad accept must not take down the shard; the
                    // readiness loop brings us back here.
                    error!(shard = self.id, error = %e, "accept failed");
                    return true;
                }
            }
        }
    }

    /// Classic blocking accept loop (thread-per-connection dispatch).
    fn run_blocking(self) {
        info!(shard = self.id, "shard started");
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit_accepted(stream, peer),
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        info!(shard = self.id, "listener closed");
                        return;
                    }
                    error!(shard = self.id, error = %e, "accept failed");
                }
            }
        }
    }

    fn admit_accepted(&self, stream: TcpStream, peer: SocketAddr) {
        match &self.admission {
            Admission::Direct => {
                let conn = Arc::new(Connection::plain(stream, peer));
                match self.target.admit(conn) {
                    Ok(()) => {
                        self.stats.connections.increment(1.0);
                        debug!(shard = self.id, peer = %peer, "accepted connection");
                    }
                    Err(e) => {
                        // Dropping the handle closes the socket.
                        error!(shard = self.id, peer = %peer, error = %e, "failed to admit connection");
                    }
                }
            }
            Admission::Offload { queue, tls } => {
                let ctx = HandshakeContext {
                    stream,
                    peer,
                    tls: tls.clone(),
                    target: self.target.clone(),
                };
                // Blocks while the queue is full: backpressure on accept.
                if let Err(e) = queue.enqueue(ctx) {
                    warn!(shard = self.id, peer = %peer, error = %e, "dropping connection");
                }
            }
        }
    }

    fn log_connection_error(&self, conn: &Connection, err: &FrameError) {
        if err.is_disconnect() {
            debug!(shard = self.id, peer = %conn.peer(), "peer disconnected");
        } else {
            info!(shard = self.id, peer = %conn.peer(), error = %err, "connection error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_reuse_port() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), true, true).unwrap();
        let addr = first.local_addr().unwrap();
        // A second listener on the same address must succeed with reuse.
        let second = bind_listener(addr, true, true).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_bind_listener_conflict_without_reuse_port() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), false, false).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(bind_listener(addr, false, false).is_err());
    }

    #[test]
    fn test_shard_handle_close_unblocks_accept() {
        let listener =
            Arc::new(bind_listener("127.0.0.1:0".parse().unwrap(), false, false).unwrap());
        let handle = ShardHandle {
            listener: listener.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        };

        let accept_thread = std::thread::spawn(move || listener.accept().is_err());
        std::thread::sleep(std::time::Duration::from_millis(100));
        handle.close();
        assert!(accept_thread.join().unwrap());
        assert!(handle.closed.load(Ordering::SeqCst));
    }
}
