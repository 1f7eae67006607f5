//! Veil Traffic Accounting
//!
//! Byte counters, per-session accounting and the persisted session log
//! used by the tunnel controller.

mod session;
mod store;
mod traffic;

pub use session::{now_millis, OpenSession, PerformanceSample, SessionRecord, MAX_PERFORMANCE_SAMPLES};
pub use store::{write_atomic, write_atomic_private, SessionStatistics, SessionStore, StoreError};
pub use traffic::{format_bytes, format_rate, TrafficDelta, TrafficSample, TrafficStats};
