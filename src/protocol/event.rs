//! Mesh events: the unit of routing between clients and the backend queue.
//!
//! Routing metadata rides on string headers so it survives the backend
//! round-trip (send-back counters, receipt stamps, business sequence keys).

use crate::core::time::unix_millis;
use bytes::Bytes;
use std::collections::HashMap;

/// Business sequence key, used for log correlation.
pub const HDR_KEYS: &str = "keys";
/// Times this message has been returned to the backend for redelivery.
pub const HDR_SEND_BACK_TIMES: &str = "mesh_send_back_times";
/// Node that last returned this message to the backend.
pub const HDR_SEND_BACK_IP: &str = "mesh_send_back_ip";
/// Wall timestamp at which the mesh received the message from the backend.
pub const HDR_RECEIVE_TIMESTAMP: &str = "req_mq2mesh_timestamp";
/// Node identity that received the message from the backend.
pub const HDR_RECEIVE_IP: &str = "req_receive_mesh_ip";

/// One event flowing through the mesh.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MeshEvent {
    /// Unique event id.
    pub id: String,
    /// Destination topic.
    pub topic: String,
    /// Routing and correlation headers.
    pub headers: HashMap<String, String>,
    /// Opaque payload.
    pub payload: Bytes,
}

impl MeshEvent {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            headers: HashMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Business sequence for log correlation; falls back to the event id.
    pub fn biz_seq(&self) -> &str {
        self.header(HDR_KEYS).unwrap_or(&self.id)
    }

    /// How many times this message has been sent back to the backend.
    pub fn send_back_times(&self) -> u32 {
        self.header(HDR_SEND_BACK_TIMES)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Record one more send-back hop from the given node.
    pub fn mark_send_back(&mut self, node_ip: &str) {
        let times = self.send_back_times() + 1;
        self.set_header(HDR_SEND_BACK_TIMES, times.to_string());
        self.set_header(HDR_SEND_BACK_IP, node_ip.to_string());
    }

    /// Stamp receipt metadata when the message arrives from the backend.
    pub fn stamp_receipt(&mut self, node_ip: &str) {
        self.set_header(HDR_RECEIVE_TIMESTAMP, unix_millis().to_string());
        self.set_header(HDR_RECEIVE_IP, node_ip.to_string());
    }
}
