//! TLS handshake offload pool.
//!
//! Handshakes are cryptographically expensive and must not stall the accept
//! path or a reactor's readiness loop, so accepted TLS connections are
//! queued for a fixed pool of worker threads. The queue is bounded at twice
//! the worker count: when workers fall behind, the blocking enqueue stalls
//! the accept loop instead of buffering without limit — an admission-control
//! valve, not an error.
//!
//! A failed handshake drops the raw connection without retry; it indicates a
//! protocol or credential mismatch that a retry cannot fix.

use crate::error::ServerError;
use crate::server::{Admit, Connection, Shutdown};
use crate::stats::Stats;
use crossbeam_channel::{bounded, Receiver, Sender};
use rustls::{ServerConnection, StreamOwned};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Everything a worker needs to turn a raw connection into a registered
/// secure one. Consumed exactly once.
pub struct HandshakeContext {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub tls: Arc<rustls::ServerConfig>,
    /// Where the secure connection goes after the handshake: the accepting
    /// shard's reactor, or the blocking-dispatch spawner.
    pub target: Arc<dyn Admit>,
}

/// Producer handle for acceptor shards. Enqueueing blocks while the queue
/// is full (backpressure on the accept path).
#[derive(Clone)]
pub struct HandshakeSender {
    tx: Sender<HandshakeContext>,
}

impl HandshakeSender {
    pub fn enqueue(&self, ctx: HandshakeContext) -> Result<(), ServerError> {
        self.tx.send(ctx).map_err(|_| ServerError::Shutdown)
    }
}

/// Fixed-size pool of handshake workers draining the bounded queue.
pub struct HandshakePool {
    tx: Sender<HandshakeContext>,
    workers: Vec<JoinHandle<()>>,
}

impl HandshakePool {
    /// Spawn `workers` threads over a queue of capacity `workers * 2`.
    pub fn start(workers: usize, shutdown: Shutdown, stats: Stats) -> Result<Self, ServerError> {
        let workers = workers.max(1);
        let (tx, rx) = bounded(workers * 2);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let handle = thread::Builder::new()
                .name(format!("handshake-{id}"))
                .spawn(move || worker_loop(id, rx, shutdown, stats))
                .map_err(|e| ServerError::Spawn {
                    name: format!("handshake-{id}"),
                    source: e,
                })?;
            handles.push(handle);
        }

        Ok(Self {
            tx,
            workers: handles,
        })
    }

    pub fn sender(&self) -> HandshakeSender {
        HandshakeSender {
            tx: self.tx.clone(),
        }
    }

    /// Wait for all workers to exit. Only returns promptly after the
    /// shutdown signal has fired.
    pub fn join(self) {
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, rx: Receiver<HandshakeContext>, shutdown: Shutdown, stats: Stats) {
    loop {
        crossbeam_channel::select! {
            recv(shutdown.receiver()) -> _ => {
                // Cancellation observed: queued contexts are not drained.
                debug!(worker = id, "handshake worker stopping");
                return;
            }
            recv(rx) -> msg => match msg {
                Ok(ctx) => perform_handshake(ctx, &stats),
                Err(_) => return,
            },
        }
    }
}

/// Run one handshake synchronously on the raw connection.
///
/// Uses rustls's documented completion primitives (`is_handshaking` /
/// `complete_io`) rather than poking at session internals. On failure the
/// raw connection is dropped, which closes it; on success the secure
/// connection replaces the raw one everywhere downstream.
fn perform_handshake(ctx: HandshakeContext, stats: &Stats) {
    let peer = ctx.peer;

    let session = match ServerConnection::new(ctx.tls) {
        Ok(session) => session,
        Err(e) => {
            error!(peer = %peer, error = %e, "tls session setup failed");
            return;
        }
    };

    let mut stream = StreamOwned::new(session, ctx.stream);
    while stream.conn.is_handshaking() {
        if let Err(e) = stream.conn.complete_io(&mut stream.sock) {
            error!(peer = %peer, error = %e, "tls handshake failed");
            return;
        }
    }

    let conn = Arc::new(Connection::secure(stream, peer));
    match ctx.target.admit(conn) {
        Ok(()) => stats.connections.increment(1.0),
        Err(e) => {
            // Dropping the handle closes the socket; the worker continues.
            error!(peer = %peer, error = %e, "failed to admit tls connection");
        }
    }
}
