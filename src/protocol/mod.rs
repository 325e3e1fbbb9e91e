//! Protocol value types shared between the transport layer, the session
//! engine, and the backend queue seam.
//!
//! - `event` - mesh events with routing headers
//! - `subscription` - topic subscriptions and consumption modes
//! - `agent` - connecting client identity

pub mod agent;
pub mod event;
pub mod subscription;

pub use agent::{Purpose, UserAgent};
pub use event::MeshEvent;
pub use subscription::{SubscriptionItem, SubscriptionMode};

/// Canonical group key: client-reported group qualified by mesh environment.
/// All registry lookups and membership checks use this derived name, never
/// the raw client value.
pub fn build_client_group(group: &str, env: &str) -> String {
    format!("{group}-{env}")
}

/// Instance name reported to the backend queue when a group channel starts.
pub fn build_mesh_client_id(subsystem: &str, purpose: Purpose, cluster: &str) -> String {
    format!("{subsystem}-{}-{cluster}", purpose.as_str())
}
