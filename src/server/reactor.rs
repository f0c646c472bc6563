//! Readiness-polling reactor.
//!
//! One reactor owns one epoll descriptor and one connection registry; a
//! shard runs its reactor's wait/dispatch loop inline while other threads
//! (the handshake offload workers) register connections concurrently.
//!
//! Interest is level-triggered `EPOLLIN | EPOLLHUP`: a connection with
//! buffered input keeps reporting ready until the handler drains a frame,
//! so nothing is lost if a dispatch round handles only one frame.
//!
//! Per-descriptor lifecycle is strictly `register -> (ready events) ->
//! deregister`; there are no intermediate states. Shards own disjoint
//! connection sets, so a descriptor lives in at most one registry.

use crate::error::ServerError;
use crate::server::{Admit, Connection};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// One entry of a readiness batch. `conn` is `None` when the descriptor is
/// not in the registry: either it is a raw-watched fd (the shard's
/// listener) or the connection was removed concurrently. Callers skip
/// entries they cannot resolve.
pub struct Ready {
    pub fd: RawFd,
    pub conn: Option<Arc<Connection>>,
}

/// Epoll-backed readiness multiplexer plus its connection registry.
pub struct Reactor {
    epfd: OwnedFd,
    batch_size: usize,
    conns: RwLock<HashMap<RawFd, Arc<Connection>>>,
}

impl Reactor {
    /// Allocate the polling descriptor.
    pub fn new(batch_size: usize) -> Result<Self, ServerError> {
        // SAFETY: plain syscall; the fd is checked before being owned.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(ServerError::ResourceExhausted(io::Error::last_os_error()));
        }
        // SAFETY: fd is a freshly created epoll descriptor we own.
        let epfd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            epfd,
            batch_size: batch_size.max(1),
            conns: RwLock::new(HashMap::new()),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, event: Option<&mut libc::epoll_event>) -> io::Result<()> {
        let ev_ptr = event.map_or(std::ptr::null_mut(), |e| e as *mut _);
        // SAFETY: epfd and fd are valid descriptors; ev_ptr is either null
        // (only for EPOLL_CTL_DEL) or points to a live epoll_event.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ev_ptr) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Add a connection to the polling set and the registry.
    ///
    /// On failure the connection never enters the registry; the caller
    /// drops it, which closes the socket.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), ServerError> {
        let fd = conn.fd();
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLHUP) as u32,
            u64: fd as u64,
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(&mut ev))
            .map_err(ServerError::Registration)?;

        let mut conns = self.conns.write().unwrap();
        conns.insert(fd, conn);
        if conns.len() % 100 == 0 {
            debug!(connections = conns.len(), "registry size");
        }
        Ok(())
    }

    /// Remove a connection from the polling set and the registry.
    ///
    /// The registry entry is dropped even when the epoll removal fails: a
    /// caller asking for removal intends to discard the connection
    /// regardless. The OS-level failure is still reported.
    pub fn deregister(&self, conn: &Connection) -> io::Result<()> {
        let fd = conn.fd();
        let result = self.ctl(libc::EPOLL_CTL_DEL, fd, None);

        let mut conns = self.conns.write().unwrap();
        conns.remove(&fd);
        if conns.len() % 100 == 0 {
            debug!(connections = conns.len(), "registry size");
        }
        result
    }

    /// Watch a raw descriptor (the shard's listener) without entering it in
    /// the registry. It surfaces in batches with `conn: None`.
    pub fn register_listener(&self, fd: RawFd) -> Result<(), ServerError> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(&mut ev))
            .map_err(ServerError::Registration)
    }

    /// Stop watching a raw descriptor.
    pub fn deregister_listener(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    /// Block until at least one descriptor is ready.
    ///
    /// An interrupting signal (`EINTR`) yields an empty batch, not an
    /// error, so callers retry without treating it as fatal. Ready
    /// descriptors are resolved against the registry under the read lock.
    pub fn wait(&self) -> io::Result<Vec<Ready>> {
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(self.batch_size);
        // SAFETY: the spare capacity is writable for batch_size entries;
        // the kernel fills `n` of them and we only expose those.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                self.batch_size as libc::c_int,
                -1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        // SAFETY: the kernel initialized the first n entries.
        unsafe { events.set_len(n as usize) };

        let conns = self.conns.read().unwrap();
        Ok(events
            .iter()
            .map(|ev| {
                let fd = ev.u64 as RawFd;
                Ready {
                    fd,
                    conn: conns.get(&fd).cloned(),
                }
            })
            .collect())
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.conns.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().unwrap().is_empty()
    }
}

impl Admit for Reactor {
    fn admit(&self, conn: Arc<Connection>) -> Result<(), ServerError> {
        self.register(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    fn pair(listener: &TcpListener) -> (TcpStream, Arc<Connection>) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        (client, Arc::new(Connection::plain(stream, peer)))
    }

    #[test]
    fn test_registry_uniqueness() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let reactor = Reactor::new(16).unwrap();

        let pairs: Vec<_> = (0..5).map(|_| pair(&listener)).collect();
        for (_, conn) in &pairs {
            reactor.register(conn.clone()).unwrap();
        }
        // Each descriptor appears exactly once.
        assert_eq!(reactor.len(), 5);

        for (_, conn) in &pairs {
            reactor.deregister(conn).unwrap();
        }
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_deregister_is_idempotent_in_registry() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let reactor = Reactor::new(16).unwrap();
        let (_client, conn) = pair(&listener);

        reactor.register(conn.clone()).unwrap();
        reactor.deregister(&conn).unwrap();
        assert_eq!(reactor.len(), 0);

        // Second removal fails at the OS level (ENOENT) but stays harmless.
        assert!(reactor.deregister(&conn).is_err());
        assert_eq!(reactor.len(), 0);
    }

    #[test]
    fn test_registry_dropped_even_when_os_removal_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let reactor = Reactor::new(16).unwrap();
        let (_client, conn) = pair(&listener);

        reactor.register(conn.clone()).unwrap();

        // Force the upcoming EPOLL_CTL_DEL to fail by removing the fd from
        // the polling set behind the reactor's back.
        let rc = unsafe {
            libc::epoll_ctl(
                reactor.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                conn.fd(),
                std::ptr::null_mut(),
            )
        };
        assert_eq!(rc, 0);

        let result = reactor.deregister(&conn);
        assert!(result.is_err());
        // The registry entry is gone regardless, so wait() can never
        // resolve this connection again.
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_wait_skips_deregistered_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let reactor = Reactor::new(16).unwrap();

        let (mut client1, conn1) = pair(&listener);
        let (mut client2, conn2) = pair(&listener);
        reactor.register(conn1.clone()).unwrap();
        reactor.register(conn2.clone()).unwrap();

        // Pending data on conn1, then drop it from the reactor.
        client1.write_all(b"stale").unwrap();
        reactor.deregister(&conn1).unwrap();

        client2.write_all(b"live").unwrap();
        let batch = reactor.wait().unwrap();
        assert!(!batch.is_empty());
        for ready in &batch {
            assert_ne!(ready.fd, conn1.fd());
            if let Some(conn) = &ready.conn {
                assert_eq!(conn.fd(), conn2.fd());
            }
        }
    }

    #[test]
    fn test_wait_resolves_ready_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let reactor = Reactor::new(16).unwrap();
        let (mut client, conn) = pair(&listener);
        reactor.register(conn.clone()).unwrap();

        client.write_all(b"x").unwrap();
        let batch = reactor.wait().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fd, conn.fd());
        assert!(batch[0].conn.is_some());
    }
}
