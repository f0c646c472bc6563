//! Per-readiness connection handling: one frame in, the same body echoed
//! back out.
//!
//! The handler is stateless. Every error it returns is fatal for the
//! connection; the caller deregisters, decrements the connection gauge and
//! drops the handle.

use crate::error::FrameError;
use crate::protocol::{self, Message};
use crate::server::Connection;
use crate::stats::Stats;
use chrono::Utc;
use std::io::Write;
use tracing::trace;

/// Serve one request frame on a readable connection.
///
/// Reads and decodes a frame, records a latency sample from the payload
/// envelope when one is present (observability only; a non-envelope body is
/// still echoed), then writes the body back in a fresh frame.
pub fn serve_ready(conn: &Connection, stats: &Stats, max_frame_len: usize) -> Result<(), FrameError> {
    let mut transport = conn.transport().lock().unwrap();

    let (_, body) = protocol::read_frame(&mut *transport, max_frame_len)?;
    trace!(peer = %conn.peer(), len = body.len(), "read frame");

    if let Ok(msg) = serde_json::from_slice::<Message>(&body) {
        stats
            .latency
            .record((Utc::now().timestamp_millis() - msg.ts) as f64);
    }

    let reply = protocol::pack(&body);
    transport.write_all(&reply)?;

    stats.requests.increment(1);
    Ok(())
}
