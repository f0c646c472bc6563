//! floodgate: a TCP edge server for very large connection counts.
//!
//! The core is a sharded readiness-polling design:
//! - one acceptor shard per core, each with its own `SO_REUSEPORT` listener
//!   and epoll-backed reactor, sharing no mutable state across shards
//! - a bounded handshake offload pool that keeps TLS handshakes off the
//!   accept and dispatch paths
//! - a length-prefixed frame protocol (magic + big-endian length + body)
//!   echoed back per request
//!
//! A thread-per-connection blocking dispatch mode is kept as a
//! protocol-compatible comparison baseline.

pub mod config;
pub mod error;
pub mod limits;
pub mod protocol;
pub mod server;
pub mod stats;
pub mod tls;
