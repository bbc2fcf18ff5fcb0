//! Observability and Metrics
//!
//! This module provides counters for monitoring link health: sessions, resumptions,
//! message traffic, request outcomes and routing decisions.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Global metrics collector for link operations
#[derive(Debug)]
pub struct Metrics {
    /// Total sessions established
    pub connections_total: AtomicU64,
    /// Currently open sessions (connected or resuming)
    pub connections_active: AtomicU64,
    /// Total handshake attempts seen by acceptors
    pub handshakes_total: AtomicU64,
    /// Handshakes that produced a new or resumed session
    pub handshakes_success: AtomicU64,
    /// Handshakes that were rejected
    pub handshakes_failed: AtomicU64,
    /// Sessions resumed after a socket drop
    pub sessions_resumed: AtomicU64,
    /// Sessions discarded through `invalidate`
    pub sessions_invalidated: AtomicU64,
    /// Sessions closed because the resume timeout elapsed
    pub sessions_expired: AtomicU64,
    /// Session traffic written (including replays)
    pub messages_sent: AtomicU64,
    /// Session traffic accepted in sequence
    pub messages_received: AtomicU64,
    /// Messages re-sent during resumption
    pub messages_replayed: AtomicU64,
    /// Requests issued by local links
    pub requests_total: AtomicU64,
    /// Requests that ended in an error, rejection or timeout
    pub requests_failed: AtomicU64,
    /// Messages relayed by a router
    pub messages_forwarded: AtomicU64,
    /// Messages a router could not deliver
    pub messages_unroutable: AtomicU64,
    /// Connection-fatal protocol violations
    pub protocol_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            sessions_resumed: AtomicU64::new(0),
            sessions_invalidated: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_replayed: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            messages_forwarded: AtomicU64::new(0),
            messages_unroutable: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
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

    pub fn handshake_attempt(&self) {
        self.handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_success(&self) {
        self.handshakes_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_failed(&self) {
        self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_resumed(&self, replayed: u64) {
        self.sessions_resumed.fetch_add(1, Ordering::Relaxed);
        self.messages_replayed.fetch_add(replayed, Ordering::Relaxed);
    }

    pub fn session_invalidated(&self) {
        self.sessions_invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_expired(&self) {
        self.sessions_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_started(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_forwarded(&self, copies: u64) {
        self.messages_forwarded.fetch_add(copies, Ordering::Relaxed);
    }

    pub fn message_unroutable(&self) {
        self.messages_unroutable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            sessions_resumed: self.sessions_resumed.load(Ordering::Relaxed),
            sessions_invalidated: self.sessions_invalidated.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_replayed: self.messages_replayed.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
            messages_unroutable: self.messages_unroutable.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            sessions_resumed = snapshot.sessions_resumed,
            sessions_invalidated = snapshot.sessions_invalidated,
            sessions_expired = snapshot.sessions_expired,
            messages_sent = snapshot.messages_sent,
            messages_received = snapshot.messages_received,
            messages_replayed = snapshot.messages_replayed,
            requests_total = snapshot.requests_total,
            requests_failed = snapshot.requests_failed,
            messages_forwarded = snapshot.messages_forwarded,
            messages_unroutable = snapshot.messages_unroutable,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Link metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub sessions_resumed: u64,
    pub sessions_invalidated: u64,
    pub sessions_expired: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_replayed: u64,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub messages_forwarded: u64,
    pub messages_unroutable: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

/// Global metrics instance (lazy static for simplicity)
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_ms = self.start.elapsed().as_millis(),
            "Operation completed"
        );
    }
}
