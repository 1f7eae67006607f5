//! Traffic and performance probes read by the sampling timer.

use crate::error::TunnelError;
use veil_stats::TrafficStats;

/// Cumulative byte counters of the tunnel interface.
///
/// Counters may reset; the sampler clamps the resulting deltas.
pub trait InterfaceCounters: Send + Sync {
    fn read(&self) -> Result<TrafficStats, TunnelError>;
}

/// Resource usage of the tunnel process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Source of process performance samples
pub trait PerformanceProbe: Send + Sync {
    /// `None` when the process cannot be inspected right now
    fn sample(&self) -> Option<ProcessUsage>;
}
