//! Traffic statistics collection.
//!
//! Byte counters are cumulative and can only move forward from the point of
//! view of the consumer: a counter that goes backwards (interface reset,
//! relay restart) produces a zero delta, never a negative one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Snapshot of received/sent byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficStats {
    /// Bytes received from the tunnel
    pub bytes_received: u64,
    /// Bytes sent into the tunnel
    pub bytes_sent: u64,
}

impl TrafficStats {
    /// Create a new snapshot.
    pub fn new(bytes_received: u64, bytes_sent: u64) -> Self {
        Self {
            bytes_received,
            bytes_sent,
        }
    }

    /// Total bytes in both directions.
    pub fn total(&self) -> u64 {
        self.bytes_received.saturating_add(self.bytes_sent)
    }

    /// Combine two snapshots.
    pub fn merge(&self, other: &TrafficStats) -> TrafficStats {
        TrafficStats {
            bytes_received: self.bytes_received.saturating_add(other.bytes_received),
            bytes_sent: self.bytes_sent.saturating_add(other.bytes_sent),
        }
    }

    /// Per-second rates `(received, sent)` over `elapsed`.
    pub fn rate_over(&self, elapsed: Duration) -> (f64, f64) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        (
            self.bytes_received as f64 / secs,
            self.bytes_sent as f64 / secs,
        )
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "RX: {}, TX: {}",
            format_bytes(self.bytes_received),
            format_bytes(self.bytes_sent)
        )
    }
}

impl fmt::Display for TrafficStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// Format a byte count for display.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a bytes-per-second rate for display.
pub fn format_rate(bytes_per_sec: f64) -> String {
    let clamped = if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
        bytes_per_sec.round() as u64
    } else {
        0
    };
    format!("{}/s", format_bytes(clamped))
}

/// One reading of the cumulative counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSample {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub taken_at: Instant,
}

impl TrafficSample {
    /// Take a sample of `stats` stamped now.
    pub fn now(stats: TrafficStats) -> Self {
        Self::at(stats, Instant::now())
    }

    /// Take a sample of `stats` stamped at `taken_at`.
    pub fn at(stats: TrafficStats, taken_at: Instant) -> Self {
        Self {
            bytes_received: stats.bytes_received,
            bytes_sent: stats.bytes_sent,
            taken_at,
        }
    }

    /// Counters as a plain snapshot.
    pub fn stats(&self) -> TrafficStats {
        TrafficStats::new(self.bytes_received, self.bytes_sent)
    }

    /// Delta from `previous` to `self`, clamped at zero per direction.
    pub fn delta_since(&self, previous: &TrafficSample) -> TrafficDelta {
        TrafficDelta {
            received: self.bytes_received.saturating_sub(previous.bytes_received),
            sent: self.bytes_sent.saturating_sub(previous.bytes_sent),
            elapsed: self.taken_at.saturating_duration_since(previous.taken_at),
        }
    }
}

/// Bytes moved between two consecutive samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    pub received: u64,
    pub sent: u64,
    pub elapsed: Duration,
}

impl TrafficDelta {
    /// Delta as a stats snapshot.
    pub fn as_stats(&self) -> TrafficStats {
        TrafficStats::new(self.received, self.sent)
    }

    /// `(received, sent)` bytes per second.
    pub fn rate(&self) -> (f64, f64) {
        self.as_stats().rate_over(self.elapsed)
    }

    pub fn is_zero(&self) -> bool {
        self.received == 0 && self.sent == 0
    }
}
