//! Engine counters, cheap enough to bump on every hot-path event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the registry and every group wrapper.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    sessions_created: AtomicU64,
    sessions_closed: AtomicU64,
    messages_downstream: AtomicU64,
    messages_sent_back: AtomicU64,
    messages_dropped: AtomicU64,
    unack_expired: AtomicU64,
}

impl EngineMetrics {
    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downstream(&self) {
        self.messages_downstream.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_back(&self) {
        self.messages_sent_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unack_expired(&self) {
        self.unack_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            messages_downstream: self.messages_downstream.load(Ordering::Relaxed),
            messages_sent_back: self.messages_sent_back.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            unack_expired: self.unack_expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, for admin output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_closed: u64,
    pub messages_downstream: u64,
    pub messages_sent_back: u64,
    pub messages_dropped: u64,
    pub unack_expired: u64,
}
