//! Metrics handles for the server core.
//!
//! One `Stats` value is constructed at startup and cloned into every
//! component that reports; nothing reads ambient global state. Recording is
//! fire-and-forget through the `metrics` facade: with no recorder installed
//! every call is a no-op, and an exporter is the hosting process's concern.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

/// Instrument names match the original deployment dashboards.
const CONNECTIONS: &str = "connections";
const OPS: &str = "ops";
const LATENCY_MS: &str = "latency_ms";

/// Handles for the three core instruments.
#[derive(Clone)]
pub struct Stats {
    /// Currently registered connections across all shards.
    pub connections: Gauge,
    /// Total processed request frames.
    pub requests: Counter,
    /// Client-to-server latency samples in milliseconds, taken from the
    /// payload envelope's timestamp when one is present.
    pub latency: Histogram,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            connections: gauge!(CONNECTIONS),
            requests: counter!(OPS),
            latency: histogram!(LATENCY_MS),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
