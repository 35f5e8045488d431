//! Observability and Metrics
//!
//! Per-engine counters for connections, traffic and failure paths.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Counters owned by one engine
#[derive(Debug)]
pub struct Metrics {
    /// Total connections attached
    pub connections_total: AtomicU64,
    /// Currently attached connections
    pub connections_active: AtomicU64,
    /// Connections dropped by load shedding
    pub connections_shed: AtomicU64,
    /// Successful reconnects
    pub reconnects: AtomicU64,
    /// Total frames written
    pub frames_sent: AtomicU64,
    /// Total frames read
    pub frames_received: AtomicU64,
    /// Total bytes written, headers included
    pub bytes_sent: AtomicU64,
    /// Total bytes read, headers included
    pub bytes_received: AtomicU64,
    /// Sends rejected by a full queue
    pub backpressure_rejections: AtomicU64,
    /// RPC calls that hit their deadline
    pub rpc_timeouts: AtomicU64,
    /// Malformed or oversized frames
    pub protocol_errors: AtomicU64,
    /// Socket failures that stopped a connection
    pub connection_errors: AtomicU64,
    /// Handler invocations that panicked
    pub handler_panics: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_shed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            backpressure_rejections: AtomicU64::new(0),
            rpc_timeouts: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_shed(&self) {
        self.connections_shed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame read
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn backpressure(&self) {
        self.backpressure_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_timeout(&self) {
        self.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_shed: self.connections_shed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            backpressure_rejections: self.backpressure_rejections.load(Ordering::Relaxed),
            rpc_timeouts: self.rpc_timeouts.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self, tag: &str) {
        let snapshot = self.snapshot();
        info!(
            tag,
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            connections_shed = snapshot.connections_shed,
            reconnects = snapshot.reconnects,
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            backpressure_rejections = snapshot.backpressure_rejections,
            rpc_timeouts = snapshot.rpc_timeouts,
            protocol_errors = snapshot.protocol_errors,
            connection_errors = snapshot.connection_errors,
            handler_panics = snapshot.handler_panics,
            uptime_seconds = snapshot.uptime_seconds,
            "engine metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_shed: u64,
    pub reconnects: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub backpressure_rejections: u64,
    pub rpc_timeouts: u64,
    pub protocol_errors: u64,
    pub connection_errors: u64,
    pub handler_panics: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.connection_established();
        m.connection_established();
        m.connection_closed();
        m.frame_sent(20);
        m.frame_sent(36);
        m.frame_received(16);
        m.backpressure();

        let snap = m.snapshot();
        assert_eq!(snap.connections_total, 2);
        assert_eq!(snap.connections_active, 1);
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 56);
        assert_eq!(snap.bytes_received, 16);
        assert_eq!(snap.backpressure_rejections, 1);
        assert_eq!(snap.handler_panics, 0);
    }
}
