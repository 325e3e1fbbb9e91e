//! Operational surface: admin snapshots and engine counters.

pub mod admin;
pub mod metrics;

pub use admin::{DistributionReport, GroupDistribution};
pub use metrics::{EngineMetrics, MetricsSnapshot};
