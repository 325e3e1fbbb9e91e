//! Delivery target selection for load-balanced messages.

use crate::core::time::Clock;
use crate::session::Session;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks the session that receives the next persistent delivery for a topic.
pub trait DispatchStrategy<C: Clock>: Send + Sync {
    /// One eligible session from the candidates, or none when no candidate
    /// is available for the topic.
    fn select(&self, topic: &str, candidates: &[Arc<Session<C>>]) -> Option<Arc<Session<C>>>;
}

/// Round-robin over the sessions currently available for the topic. Sessions
/// that are not running or have dropped the topic are skipped, so a stalled
/// client never captures the rotation.
#[derive(Default)]
pub struct FreePriorityDispatch {
    cursor: AtomicUsize,
}

impl FreePriorityDispatch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C: Clock> DispatchStrategy<C> for FreePriorityDispatch {
    fn select(&self, topic: &str, candidates: &[Arc<Session<C>>]) -> Option<Arc<Session<C>>> {
        let available: Vec<&Arc<Session<C>>> = candidates
            .iter()
            .filter(|s| s.is_available(topic))
            .collect();
        if available.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
        Some(available[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;
    use crate::protocol::{Purpose, SubscriptionItem, UserAgent};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn running_session(port: u16) -> Arc<Session<SystemClock>> {
        let (tx, _rx) = mpsc::channel(8);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let session = Arc::new(Session::new(
            UserAgent::new("g", "5109", Purpose::Sub),
            addr,
            tx,
        ));
        session.context().put(SubscriptionItem::persistent("t1"));
        session.mark_running();
        session
    }

    #[test]
    fn test_rotates_over_available_sessions() {
        let dispatch = FreePriorityDispatch::new();
        let sessions = vec![running_session(1), running_session(2)];

        let first = dispatch.select("t1", &sessions).unwrap();
        let second = dispatch.select("t1", &sessions).unwrap();
        assert_ne!(first.remote_addr(), second.remote_addr());
    }

    #[test]
    fn test_skips_unavailable_sessions() {
        let dispatch = FreePriorityDispatch::new();
        let healthy = running_session(1);
        let closed = running_session(2);
        closed.mark_closed();
        let sessions = vec![closed, healthy.clone()];

        for _ in 0..4 {
            let picked = dispatch.select("t1", &sessions).unwrap();
            assert_eq!(picked.remote_addr(), healthy.remote_addr());
        }
    }

    #[test]
    fn test_none_when_no_candidate_has_topic() {
        let dispatch = FreePriorityDispatch::new();
        let sessions = vec![running_session(1)];
        assert!(dispatch.select("other", &sessions).is_none());
    }

    #[test]
    fn test_none_on_empty_candidates() {
        let dispatch = FreePriorityDispatch::new();
        let sessions: Vec<Arc<Session<SystemClock>>> = Vec::new();
        assert!(dispatch.select("t1", &sessions).is_none());
    }
}
