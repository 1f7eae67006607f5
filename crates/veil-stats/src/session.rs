//! Tunnel session accounting.
//!
//! An [`OpenSession`] is the mutable record of the session in progress. It is
//! consumed by [`OpenSession::close`], which yields the frozen
//! [`SessionRecord`] that goes into the session log.

use crate::traffic::{TrafficDelta, TrafficStats};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum performance samples retained per session
pub const MAX_PERFORMANCE_SAMPLES: usize = 720;

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Process/relay performance at one point in a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSample {
    /// CPU usage of the tunnel process (percent of one core)
    pub cpu_percent: f32,
    /// Resident memory of the tunnel process
    pub memory_bytes: u64,
    /// Average relay latency, if the relay engine reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Unix milliseconds
    pub taken_at: u64,
}

/// A completed tunnel session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    /// Unix milliseconds
    pub started_at: u64,
    /// Unix milliseconds
    pub ended_at: u64,
    pub server_address: String,
    pub link_type: String,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub performance: Vec<PerformanceSample>,
}

impl SessionRecord {
    /// Wall-clock length of the session.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.ended_at.saturating_sub(self.started_at))
    }

    /// Bytes moved during the session.
    pub fn traffic(&self) -> TrafficStats {
        TrafficStats::new(self.bytes_received, self.bytes_sent)
    }

    pub fn average_cpu_percent(&self) -> Option<f32> {
        if self.performance.is_empty() {
            return None;
        }
        let sum: f32 = self.performance.iter().map(|p| p.cpu_percent).sum();
        Some(sum / self.performance.len() as f32)
    }

    pub fn average_memory_bytes(&self) -> Option<u64> {
        if self.performance.is_empty() {
            return None;
        }
        let sum: u128 = self.performance.iter().map(|p| p.memory_bytes as u128).sum();
        Some((sum / self.performance.len() as u128) as u64)
    }

    /// Mean over the samples that carry a latency.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let latencies: Vec<f64> = self
            .performance
            .iter()
            .filter_map(|p| p.latency_ms)
            .collect();
        if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        }
    }
}

/// The session currently in progress.
#[derive(Debug)]
pub struct OpenSession {
    id: String,
    started_at: u64,
    server_address: String,
    link_type: String,
    traffic: TrafficStats,
    performance: VecDeque<PerformanceSample>,
}

impl OpenSession {
    /// Open a session starting now.
    pub fn start(server_address: impl Into<String>, link_type: impl Into<String>) -> Self {
        Self::start_at(now_millis(), server_address, link_type)
    }

    /// Open a session with an explicit start time (unix ms).
    pub fn start_at(
        started_at: u64,
        server_address: impl Into<String>,
        link_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at,
            server_address: server_address.into(),
            link_type: link_type.into(),
            traffic: TrafficStats::default(),
            performance: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// Running totals so far.
    pub fn traffic(&self) -> TrafficStats {
        self.traffic
    }

    /// Add a sampling delta to the running totals.
    pub fn record_traffic(&mut self, delta: &TrafficDelta) {
        self.traffic = self.traffic.merge(&delta.as_stats());
    }

    /// Append a performance sample, dropping the oldest beyond the cap.
    pub fn record_performance(&mut self, sample: PerformanceSample) {
        if self.performance.len() == MAX_PERFORMANCE_SAMPLES {
            self.performance.pop_front();
        }
        self.performance.push_back(sample);
    }

    pub fn performance_len(&self) -> usize {
        self.performance.len()
    }

    /// Freeze the session now.
    pub fn close(self) -> SessionRecord {
        self.close_at(now_millis())
    }

    /// Freeze the session at `ended_at` (unix ms, clamped to the start).
    pub fn close_at(self, ended_at: u64) -> SessionRecord {
        SessionRecord {
            id: self.id,
            started_at: self.started_at,
            ended_at: ended_at.max(self.started_at),
            server_address: self.server_address,
            link_type: self.link_type,
            bytes_received: self.traffic.bytes_received,
            bytes_sent: self.traffic.bytes_sent,
            performance: self.performance.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(received: u64, sent: u64) -> TrafficDelta {
        TrafficDelta {
            received,
            sent,
            elapsed: Duration::from_secs(1),
        }
    }

    fn sample(cpu: f32, memory: u64, latency: Option<f64>) -> PerformanceSample {
        PerformanceSample {
            cpu_percent: cpu,
            memory_bytes: memory,
            latency_ms: latency,
            taken_at: 0,
        }
    }

    #[test]
    fn test_session_accumulates_traffic() {
        let mut session = OpenSession::start_at(1_000, "vpn.example.com", "wifi");
        session.record_traffic(&delta(100, 10));
        session.record_traffic(&delta(50, 0));

        let record = session.close_at(61_000);
        assert_eq!(record.bytes_received, 150);
        assert_eq!(record.bytes_sent, 10);
        assert_eq!(record.duration(), Duration::from_secs(60));
        assert_eq!(record.server_address, "vpn.example.com");
        assert_eq!(record.link_type, "wifi");
    }

    #[test]
    fn test_close_before_start_is_clamped() {
        let session = OpenSession::start_at(5_000, "a", "wired");
        let record = session.close_at(4_000);
        assert_eq!(record.ended_at, 5_000);
        assert_eq!(record.duration(), Duration::ZERO);
    }

    #[test]
    fn test_performance_cap() {
        let mut session = OpenSession::start("a", "wifi");
        for i in 0..(MAX_PERFORMANCE_SAMPLES + 5) {
            session.record_performance(sample(i as f32, 0, None));
        }
        assert_eq!(session.performance_len(), MAX_PERFORMANCE_SAMPLES);

        let record = session.close();
        // The five oldest samples were dropped
        assert_eq!(record.performance[0].cpu_percent, 5.0);
    }

    #[test]
    fn test_performance_averages() {
        let mut session = OpenSession::start("a", "wifi");
        session.record_performance(sample(10.0, 100, Some(20.0)));
        session.record_performance(sample(30.0, 300, None));
        session.record_performance(sample(20.0, 200, Some(40.0)));

        let record = session.close();
        assert_eq!(record.average_cpu_percent(), Some(20.0));
        assert_eq!(record.average_memory_bytes(), Some(200));
        assert_eq!(record.average_latency_ms(), Some(30.0));
    }

    #[test]
    fn test_empty_performance_averages() {
        let record = OpenSession::start("a", "wifi").close();
        assert_eq!(record.average_cpu_percent(), None);
        assert_eq!(record.average_memory_bytes(), None);
        assert_eq!(record.average_latency_ms(), None);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = OpenSession::start_at(1, "srv", "cellular").close_at(2);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["serverAddress"], "srv");
        assert_eq!(json["linkType"], "cellular");
        assert_eq!(json["endedAt"], 2);
        assert!(json.get("performance").is_none());
    }
}
