//! Observability and Metrics
//!
//! Link-level counters for monitoring framing, session health, transfers and
//! requests.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for link operations
#[derive(Debug)]
pub struct Metrics {
    /// Frames written to the transport
    pub frames_sent: AtomicU64,
    /// Frames decoded from the transport
    pub frames_received: AtomicU64,
    /// Bytes written to the transport
    pub bytes_sent: AtomicU64,
    /// Bytes read from the transport
    pub bytes_received: AtomicU64,
    /// Stream resynchronizations performed by the decoder
    pub resyncs: AtomicU64,
    /// Total handshake attempts
    pub handshakes_total: AtomicU64,
    /// Successful handshakes
    pub handshakes_success: AtomicU64,
    /// Failed handshakes
    pub handshakes_failed: AtomicU64,
    /// Messages sealed
    pub encryptions: AtomicU64,
    /// Messages that failed to open
    pub integrity_failures: AtomicU64,
    /// Chunked transfers started (either direction)
    pub transfers_started: AtomicU64,
    /// Chunked transfers completed
    pub transfers_completed: AtomicU64,
    /// Chunked transfers abandoned
    pub transfers_abandoned: AtomicU64,
    /// Missing-chunk requests sent
    pub missing_requests: AtomicU64,
    /// Requests matched with a response
    pub requests_completed: AtomicU64,
    /// Requests that timed out
    pub requests_timed_out: AtomicU64,
    /// Requests failed by send errors or teardown
    pub requests_failed: AtomicU64,
    /// Transport write failures
    pub send_failures: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            handshakes_total: AtomicU64::new(0),
            handshakes_success: AtomicU64::new(0),
            handshakes_failed: AtomicU64::new(0),
            encryptions: AtomicU64::new(0),
            integrity_failures: AtomicU64::new(0),
            transfers_started: AtomicU64::new(0),
            transfers_completed: AtomicU64::new(0),
            transfers_abandoned: AtomicU64::new(0),
            missing_requests: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_timed_out: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, byte_count: u64) {
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn resync(&self, count: u64) {
        self.resyncs.fetch_add(count, Ordering::Relaxed);
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

    pub fn encryption(&self) {
        self.encryptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_started(&self) {
        self.transfers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_abandoned(&self) {
        self.transfers_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn missing_request(&self) {
        self.missing_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            handshakes_total: self.handshakes_total.load(Ordering::Relaxed),
            handshakes_success: self.handshakes_success.load(Ordering::Relaxed),
            handshakes_failed: self.handshakes_failed.load(Ordering::Relaxed),
            encryptions: self.encryptions.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            transfers_started: self.transfers_started.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_abandoned: self.transfers_abandoned.load(Ordering::Relaxed),
            missing_requests: self.missing_requests.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            frames_sent = snapshot.frames_sent,
            frames_received = snapshot.frames_received,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            resyncs = snapshot.resyncs,
            handshakes_total = snapshot.handshakes_total,
            handshakes_success = snapshot.handshakes_success,
            handshakes_failed = snapshot.handshakes_failed,
            encryptions = snapshot.encryptions,
            integrity_failures = snapshot.integrity_failures,
            transfers_started = snapshot.transfers_started,
            transfers_completed = snapshot.transfers_completed,
            transfers_abandoned = snapshot.transfers_abandoned,
            missing_requests = snapshot.missing_requests,
            requests_completed = snapshot.requests_completed,
            requests_timed_out = snapshot.requests_timed_out,
            requests_failed = snapshot.requests_failed,
            send_failures = snapshot.send_failures,
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
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub resyncs: u64,
    pub handshakes_total: u64,
    pub handshakes_success: u64,
    pub handshakes_failed: u64,
    pub encryptions: u64,
    pub integrity_failures: u64,
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_abandoned: u64,
    pub missing_requests: u64,
    pub requests_completed: u64,
    pub requests_timed_out: u64,
    pub requests_failed: u64,
    pub send_failures: u64,
    pub uptime_seconds: u64,
}

/// Process-wide metrics shared by every link
static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
