//! Proxy metrics collection.
//!
//! Aggregate counters only; no destinations or peer identities are kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Proxy metrics collector, shared by every session of one controller.
pub struct ProxyMetrics {
    start_time: Instant,
    /// Connections opened through either session role
    total_connections: AtomicU64,
    /// Connections currently open
    active_connections: AtomicU64,
    /// Relay requests refused for missing consent
    refused_consent: AtomicU64,
    /// Relay requests refused by destination policy
    refused_policy: AtomicU64,
    /// SOCKS handshakes that failed to parse
    protocol_errors: AtomicU64,
    /// Sessions torn down by transport loss
    transport_failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            refused_consent: AtomicU64::new(0),
            refused_policy: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            transport_failures: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn increment_refused_consent(&self) {
        self.refused_consent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_refused_policy(&self) {
        self.refused_policy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_transport_failures(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn refused_consent(&self) -> u64 {
        self.refused_consent.load(Ordering::Relaxed)
    }

    pub fn refused_policy(&self) -> u64 {
        self.refused_policy.load(Ordering::Relaxed)
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            refused_consent: self.refused_consent(),
            refused_policy: self.refused_policy(),
            protocol_errors: self.protocol_errors(),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let s = self.snapshot();

        format!(
            r#"peershare metrics
=================
Uptime: {} seconds

Connections:
  Total:  {}
  Active: {}

Refused:
  No consent: {}
  Policy:     {}

Traffic:
  Sent:     {} bytes
  Received: {} bytes

Errors:
  Protocol:  {}
  Transport: {}
"#,
            s.uptime_secs,
            s.total_connections,
            s.active_connections,
            s.refused_consent,
            s.refused_policy,
            s.bytes_sent,
            s.bytes_received,
            s.protocol_errors,
            s.transport_failures,
        )
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_consent: u64,
    pub refused_policy: u64,
    pub protocol_errors: u64,
    pub transport_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl MetricsSnapshot {
    /// Share of relay requests refused for any reason.
    pub fn refusal_rate(&self) -> f64 {
        let refused = self.refused_consent + self.refused_policy;
        let attempts = self.total_connections + refused;
        if attempts == 0 {
            0.0
        } else {
            refused as f64 / attempts as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 / self.uptime_secs as f64
        }
    }
}
