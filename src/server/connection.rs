//! Connection handles.
//!
//! A [`Connection`] is an opaque bidirectional byte stream plus the OS
//! descriptor it polls on, optionally wrapped in a TLS session. The
//! descriptor is captured once at construction via `AsRawFd`; it stays
//! valid for the connection's lifetime because the handle owns the socket
//! and the fd closes when the last `Arc<Connection>` drops.

use rustls::{ServerConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;

/// The byte stream under a connection: plaintext, or a server-side TLS
/// session produced by the handshake offload pool.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// One accepted client connection.
pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    transport: Mutex<Transport>,
}

impl Connection {
    /// Wrap a plaintext stream.
    pub fn plain(stream: TcpStream, peer: SocketAddr) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            fd,
            peer,
            transport: Mutex::new(Transport::Plain(stream)),
        }
    }

    /// Wrap a completed TLS session. The raw stream is consumed by the
    /// session wrapper, so only the secure handle can ever be registered.
    pub fn secure(stream: StreamOwned<ServerConnection, TcpStream>, peer: SocketAddr) -> Self {
        let fd = stream.sock.as_raw_fd();
        Self {
            fd,
            peer,
            transport: Mutex::new(Transport::Tls(Box::new(stream))),
        }
    }

    /// Pollable descriptor for this connection.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The underlying stream. Only one task performs I/O on a connection at
    /// a time (its reactor loop, or its dedicated blocking thread), so this
    /// lock is uncontended in practice.
    pub fn transport(&self) -> &Mutex<Transport> {
        &self.transport
    }
}
