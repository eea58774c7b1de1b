//! Mux traffic metrics.
//!
//! Aggregate counters only; nothing here identifies a destination or a peer.
//! One instance is shared by every worker of a pool, or owned by a single
//! server worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Mux metrics collector.
pub struct MuxMetrics {
    /// Collector start time
    start_time: Instant,
    /// Sessions registered
    sessions_opened: AtomicU64,
    /// Sessions torn down
    sessions_closed: AtomicU64,
    /// Frames written to transports
    frames_sent: AtomicU64,
    /// Frames read from transports
    frames_received: AtomicU64,
    /// Payload bytes written to transports
    bytes_sent: AtomicU64,
    /// Payload bytes read from transports
    bytes_received: AtomicU64,
    /// Transports dropped because of a framing error
    decode_errors: AtomicU64,
    /// Upstream connections that could not be opened
    dispatch_failures: AtomicU64,
    /// Client workers created
    workers_created: AtomicU64,
}

impl MuxMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            workers_created: AtomicU64::new(0),
        }
    }

    /// Count a registered session.
    pub fn increment_sessions_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a closed session.
    pub fn increment_sessions_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a frame written with `payload` bytes attached.
    pub fn record_frame_sent(&self, payload: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload as u64, Ordering::Relaxed);
    }

    /// Count a frame read with `payload` bytes attached.
    pub fn record_frame_received(&self, payload: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(payload as u64, Ordering::Relaxed);
    }

    /// Count a framing error.
    pub fn increment_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed upstream dispatch.
    pub fn increment_dispatch_failures(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a created client worker.
    pub fn increment_workers_created(&self) {
        self.workers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get sessions currently open across all workers.
    pub fn active_sessions(&self) -> u64 {
        let opened = self.sessions_opened.load(Ordering::Relaxed);
        opened.saturating_sub(self.sessions_closed.load(Ordering::Relaxed))
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            workers_created: self.workers_created.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let s = self.snapshot();

        format!(
            r#"Mux Metrics
===========
Uptime: {} seconds

Sessions:
  Opened: {}
  Closed: {}

Frames:
  Sent:     {} ({} payload bytes)
  Received: {} ({} payload bytes)

Errors:
  Decode:   {}
  Dispatch: {}

Workers created: {}
"#,
            s.uptime_secs,
            s.sessions_opened,
            s.sessions_closed,
            s.frames_sent,
            s.bytes_sent,
            s.frames_received,
            s.bytes_received,
            s.decode_errors,
            s.dispatch_failures,
            s.workers_created,
        )
    }
}

impl Default for MuxMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Seconds since the collector started
    pub uptime_secs: u64,
    /// Sessions registered
    pub sessions_opened: u64,
    /// Sessions torn down
    pub sessions_closed: u64,
    /// Frames written
    pub frames_sent: u64,
    /// Frames read
    pub frames_received: u64,
    /// Payload bytes written
    pub bytes_sent: u64,
    /// Payload bytes read
    pub bytes_received: u64,
    /// Transports dropped on a framing error
    pub decode_errors: u64,
    /// Failed upstream dials
    pub dispatch_failures: u64,
    /// Client workers created
    pub workers_created: u64,
}

impl MetricsSnapshot {
    /// Calculate throughput in payload bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 / self.uptime_secs as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = MuxMetrics::new();
        assert_eq!(metrics.active_sessions(), 0);
        assert_eq!(metrics.snapshot().frames_sent, 0);
    }

    #[test]
    fn test_session_counting() {
        let metrics = MuxMetrics::new();

        metrics.increment_sessions_opened();
        metrics.increment_sessions_opened();
        assert_eq!(metrics.active_sessions(), 2);

        metrics.increment_sessions_closed();
        assert_eq!(metrics.active_sessions(), 1);
    }

    #[test]
    fn test_frame_counting() {
        let metrics = MuxMetrics::new();

        metrics.record_frame_sent(1000);
        metrics.record_frame_sent(0);
        metrics.record_frame_received(20);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_sent, 2);
        assert_eq!(snapshot.bytes_sent, 1000);
        assert_eq!(snapshot.frames_received, 1);
        assert_eq!(snapshot.bytes_received, 20);
    }

    #[test]
    fn test_snapshot_throughput() {
        let snapshot = MetricsSnapshot {
            uptime_secs: 100,
            bytes_sent: 10000,
            bytes_received: 20000,
            ..Default::default()
        };

        assert!((snapshot.throughput_bps() - 300.0).abs() < 0.01);
        assert_eq!(MetricsSnapshot::default().throughput_bps(), 0.0);
    }

    #[test]
    fn test_format_report() {
        let metrics = MuxMetrics::new();
        metrics.increment_decode_errors();

        let report = metrics.format_report();
        assert!(report.contains("Mux Metrics"));
        assert!(report.contains("Decode:   1"));
    }
}
