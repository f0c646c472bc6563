//! Error types for the server core.
//!
//! Two layers, matching how failures propagate:
//! - [`FrameError`]: fatal for one connection, never for the shard.
//! - [`ServerError`]: topology-level failures; bind and reactor-construction
//!   errors abort startup, everything else is isolated to the connection or
//!   handshake that caused it.
//!
//! There is no retry anywhere: every failure either drops the affected
//! connection or halts the whole server.

use std::io;
use thiserror::Error;

/// Errors raised while reading or serving a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream closed before a full header or body arrived.
    #[error("short read while decoding frame")]
    ShortRead,

    /// The first four bytes were not the protocol magic. The framing
    /// boundary is lost and the connection is unrecoverable.
    #[error("bad magic number {found:#010x}")]
    BadMagic { found: u32 },

    /// The peer declared a body larger than the configured limit.
    #[error("frame body of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    /// Any other transport-level read/write failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer simply went away (clean EOF or reset), which is
    /// logged quieter than a protocol violation.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::ShortRead => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Errors raised while building or running the server topology.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A listener could not be bound. Fatal: a shard that cannot listen
    /// indicates a configuration problem affecting all shards equally.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The OS refused to allocate an epoll descriptor.
    #[error("failed to create epoll instance: {0}")]
    ResourceExhausted(#[source] io::Error),

    /// A connection could not be added to a reactor's polling set.
    /// The connection is dropped; the shard continues.
    #[error("failed to register connection: {0}")]
    Registration(#[source] io::Error),

    /// TLS credentials could not be loaded or were rejected.
    #[error("failed to load tls credentials: {0}")]
    TlsSetup(String),

    /// A worker or shard thread could not be spawned.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The offload queue is gone because shutdown was triggered.
    #[error("server is shutting down")]
    Shutdown,
}
