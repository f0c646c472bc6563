//! Server topology assembly.
//!
//! One [`Server`] collapses the historical zoo of near-duplicate server
//! variants into a single core parameterized by listener topology
//! (single vs. sharded), transport wrapping (plaintext vs. TLS with a
//! handshake offload pool) and dispatch strategy (polling reactor vs. one
//! blocking thread per connection). All combinations speak the same frame
//! protocol.
//!
//! Concurrency layout: one thread per acceptor shard (its reactor's
//! wait/dispatch loop runs inline), plus a fixed pool of handshake workers
//! in TLS mode. Shards share nothing mutable with each other; the bounded
//! handshake queue is the only cross-thread resource.

mod connection;
mod handler;
mod handshake;
mod reactor;
mod shard;
mod shutdown;

pub use connection::{Connection, Transport};
pub use handler::serve_ready;
pub use handshake::{HandshakeContext, HandshakePool, HandshakeSender};
pub use reactor::{Reactor, Ready};
pub use shard::ShardHandle;
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};

use crate::config::{Config, Dispatch, Topology};
use crate::error::ServerError;
use crate::stats::Stats;
use crate::tls;
use shard::{bind_listener, Admission, Shard};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

/// Sink for ready-to-serve connections: a reactor's registry, or the
/// blocking-dispatch spawner. On error the caller drops the connection,
/// which closes the socket.
pub trait Admit: Send + Sync {
    fn admit(&self, conn: Arc<Connection>) -> Result<(), ServerError>;
}

/// Thread-per-connection dispatch target.
struct BlockingSpawner {
    stats: Stats,
    max_frame_len: usize,
}

impl Admit for BlockingSpawner {
    fn admit(&self, conn: Arc<Connection>) -> Result<(), ServerError> {
        let stats = self.stats.clone();
        let max_frame_len = self.max_frame_len;
        thread::Builder::new()
            .name(format!("conn-{}", conn.fd()))
            .spawn(move || {
                loop {
                    if let Err(e) = serve_ready(&conn, &stats, max_frame_len) {
                        if e.is_disconnect() {
                            debug!(peer = %conn.peer(), "peer disconnected");
                        } else {
                            info!(peer = %conn.peer(), error = %e, "connection error");
                        }
                        break;
                    }
                }
                stats.connections.decrement(1.0);
            })
            .map_err(|e| ServerError::Spawn {
                name: "conn".to_string(),
                source: e,
            })?;
        Ok(())
    }
}

/// A fully bound server, ready to run.
pub struct Server {
    shards: Vec<Shard>,
    shard_handles: Vec<ShardHandle>,
    local_addr: SocketAddr,
    pool: Option<HandshakePool>,
    trigger: ShutdownTrigger,
}

/// Remote control over a running server: resolved address, listener close
/// and the process-wide shutdown trigger.
#[derive(Clone)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shards: Vec<ShardHandle>,
    trigger: ShutdownTrigger,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop all listeners. Registered connections keep being served until
    /// they hit their own fatal condition.
    pub fn close_listeners(&self) {
        for shard in &self.shards {
            shard.close();
        }
    }

    /// Fire the process-wide cancellation signal.
    pub fn shutdown(&self) {
        self.trigger.trigger();
    }
}

impl Server {
    /// Bind all listeners and construct reactors and the handshake pool.
    ///
    /// The first fatal bind/setup failure cancels the whole topology: a
    /// shard that cannot listen indicates a configuration problem that
    /// affects every shard equally.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let (trigger, shutdown) = shutdown_channel();
        match Self::build(config, trigger.clone(), shutdown) {
            Ok(server) => Ok(server),
            Err(e) => {
                error!(error = %e, "server startup failed");
                trigger.trigger();
                Err(e)
            }
        }
    }

    fn build(
        config: &Config,
        trigger: ShutdownTrigger,
        shutdown: Shutdown,
    ) -> Result<Self, ServerError> {
        let stats = Stats::new();

        let shard_count = match config.topology {
            Topology::Single => 1,
            Topology::Sharded => {
                if config.shards == 0 {
                    num_cpus()
                } else {
                    config.shards
                }
            }
        };
        let reuse_port = shard_count > 1;
        let nonblocking = matches!(config.dispatch, Dispatch::Reactor);

        let addr: SocketAddr = config.listen.parse().map_err(|e| ServerError::Bind {
            addr: config.listen.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;

        let tls_config = match config.tls.as_ref() {
            Some(tc) => Some((tls::load_server_config(tc)?, tc.handshake_workers)),
            None => None,
        };
        let pool = match &tls_config {
            Some((_, workers)) => Some(HandshakePool::start(
                *workers,
                shutdown.clone(),
                stats.clone(),
            )?),
            None => None,
        };

        let spawner = Arc::new(BlockingSpawner {
            stats: stats.clone(),
            max_frame_len: config.max_frame_len,
        });

        let mut shards = Vec::with_capacity(shard_count);
        let mut shard_handles = Vec::with_capacity(shard_count);
        let mut resolved: Option<SocketAddr> = None;

        for id in 0..shard_count {
            // Bind the first shard to the configured address and the rest
            // to the resolved one, so an ephemeral port (":0") lands every
            // shard on the same port.
            let bind_addr = resolved.unwrap_or(addr);
            let listener =
                bind_listener(bind_addr, reuse_port, nonblocking).map_err(|e| ServerError::Bind {
                    addr: bind_addr.to_string(),
                    source: e,
                })?;
            let local = listener.local_addr().map_err(|e| ServerError::Bind {
                addr: bind_addr.to_string(),
                source: e,
            })?;
            resolved.get_or_insert(local);
            let listener = Arc::new(listener);

            let (target, reactor): (Arc<dyn Admit>, Option<Arc<Reactor>>) = match config.dispatch {
                Dispatch::Reactor => {
                    let reactor = Arc::new(Reactor::new(config.batch_size)?);
                    (reactor.clone(), Some(reactor))
                }
                Dispatch::Blocking => (spawner.clone(), None),
            };

            let admission = match (&tls_config, &pool) {
                (Some((tls, _)), Some(pool)) => Admission::Offload {
                    queue: pool.sender(),
                    tls: tls.clone(),
                },
                _ => Admission::Direct,
            };

            let shard = Shard::new(
                id,
                listener,
                Arc::new(AtomicBool::new(false)),
                reactor,
                target,
                admission,
                stats.clone(),
                config.max_frame_len,
            );
            shard_handles.push(shard.handle());
            shards.push(shard);
        }

        let local_addr = resolved.unwrap_or(addr);
        info!(
            addr = %local_addr,
            shards = shard_count,
            dispatch = ?config.dispatch,
            tls = tls_config.is_some(),
            "server bound"
        );

        Ok(Self {
            shards,
            shard_handles,
            local_addr,
            pool,
            trigger,
        })
    }

    /// Resolved listen address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            local_addr: self.local_addr,
            shards: self.shard_handles.clone(),
            trigger: self.trigger.clone(),
        }
    }

    /// Run all shards to completion, then stop the handshake workers.
    ///
    /// Returns after every listener has been closed and (in reactor
    /// dispatch) every registered connection is gone.
    pub fn run(self) -> Result<(), ServerError> {
        let Server {
            shards,
            pool,
            trigger,
            ..
        } = self;

        let mut joins = Vec::with_capacity(shards.len());
        for shard in shards {
            let name = format!("shard-{}", shard.id());
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || shard.run())
                .map_err(|e| ServerError::Spawn { name, source: e })?;
            joins.push(handle);
        }

        for handle in joins {
            let _ = handle.join();
        }

        // All shards are done; no new handshakes can arrive.
        trigger.trigger();
        if let Some(pool) = pool {
            pool.join();
        }
        Ok(())
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
