//! One live client connection: identity, subscription context, and
//! lifecycle state.

use super::push::{OutboundMessage, SessionPusher};
use crate::core::time::{unix_millis, Clock};
use crate::group::wrapper::{ClientGroupWrapper, GroupError};
use crate::protocol::{SubscriptionItem, UserAgent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("session has no client group attached")]
    GroupUnavailable,
    #[error(transparent)]
    Group(#[from] GroupError),
}

/// Created on hello, Running once the registry has readied it, Closed is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Constructed,
    Running,
    Closed,
}

/// Topics this session has subscribed to, keyed by topic name.
#[derive(Default)]
pub struct SessionContext {
    subscriptions: Mutex<HashMap<String, SubscriptionItem>>,
}

impl SessionContext {
    pub fn put(&self, item: SubscriptionItem) {
        self.subscriptions.lock().insert(item.topic.clone(), item);
    }

    pub fn remove(&self, topic: &str) -> Option<SubscriptionItem> {
        self.subscriptions.lock().remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains_key(topic)
    }

    pub fn items(&self) -> Vec<SubscriptionItem> {
        self.subscriptions.lock().values().cloned().collect()
    }
}

/// A connected client. Holds a weak handle to its group wrapper; the
/// registry owns the strong side and tears the group down when its last
/// member leaves.
pub struct Session<C: Clock> {
    client: UserAgent,
    remote_addr: SocketAddr,
    state: Mutex<SessionState>,
    context: SessionContext,
    pusher: SessionPusher,
    group: Mutex<Weak<ClientGroupWrapper<C>>>,
    create_time_ms: u64,
    last_heartbeat_ms: AtomicU64,
}

impl<C: Clock> Session<C> {
    pub fn new(
        client: UserAgent,
        remote_addr: SocketAddr,
        downstream_tx: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let now = unix_millis();
        Self {
            client,
            remote_addr,
            state: Mutex::new(SessionState::Constructed),
            context: SessionContext::default(),
            pusher: SessionPusher::new(downstream_tx),
            group: Mutex::new(Weak::new()),
            create_time_ms: now,
            last_heartbeat_ms: AtomicU64::new(now),
        }
    }

    pub fn client(&self) -> &UserAgent {
        &self.client
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn pusher(&self) -> &SessionPusher {
        &self.pusher
    }

    pub fn create_time_ms(&self) -> u64 {
        self.create_time_ms
    }

    pub(crate) fn set_client_group_wrapper(&self, wrapper: &Arc<ClientGroupWrapper<C>>) {
        *self.group.lock() = Arc::downgrade(wrapper);
    }

    pub fn client_group_wrapper(&self) -> Option<Arc<ClientGroupWrapper<C>>> {
        self.group.lock().upgrade()
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat_ms.store(unix_millis(), Ordering::SeqCst);
    }

    /// Milliseconds since the last heartbeat (or creation).
    pub fn heartbeat_age_ms(&self) -> u64 {
        unix_millis().saturating_sub(self.last_heartbeat_ms.load(Ordering::SeqCst))
    }

    /// Eligible to receive a delivery for the topic right now.
    pub fn is_available(&self, topic: &str) -> bool {
        self.state() == SessionState::Running && self.context.contains(topic)
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Constructed {
            *state = SessionState::Running;
        }
    }

    /// Transition to Closed. Returns false if already closed, so teardown
    /// runs exactly once per session.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Closed {
            return false;
        }
        *state = SessionState::Closed;
        true
    }

    /// Register the subscriptions with this session's group and the backend.
    ///
    /// The state lock is held across the group mutation so a concurrent
    /// close observes either none or all of this call's registrations.
    pub fn subscribe(self: &Arc<Self>, items: &[SubscriptionItem]) -> Result<(), SessionError> {
        let state = self.state.lock();
        if *state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let wrapper = self
            .group
            .lock()
            .upgrade()
            .ok_or(SessionError::GroupUnavailable)?;
        for item in items {
            self.context.put(item.clone());
            wrapper.add_subscription(item, self)?;
            wrapper.subscribe(item)?;
            tracing::info!(
                client = %self.client,
                topic = %item.topic,
                mode = item.mode.as_str(),
                "session subscribed"
            );
        }
        drop(state);
        Ok(())
    }

    /// Drop the subscriptions; the backend unsubscribes only when no other
    /// session in the group still wants the topic.
    pub fn unsubscribe(self: &Arc<Self>, items: &[SubscriptionItem]) -> Result<(), SessionError> {
        let state = self.state.lock();
        if *state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let wrapper = self
            .group
            .lock()
            .upgrade()
            .ok_or(SessionError::GroupUnavailable)?;
        for item in items {
            self.context.remove(&item.topic);
            wrapper.remove_subscription(item, self)?;
            if !wrapper.has_subscription(&item.topic) {
                wrapper.unsubscribe(item)?;
            }
            tracing::info!(
                client = %self.client,
                topic = %item.topic,
                "session unsubscribed"
            );
        }
        drop(state);
        Ok(())
    }

    /// Hand an outbound frame to the transport. Best-effort; the pending
    /// table owns redelivery for persistent messages.
    pub fn downstream_msg(&self, msg: OutboundMessage) -> bool {
        self.pusher.push(msg)
    }

    /// Tell the client the server is going away.
    pub fn notify_goodbye(&self) {
        if !self.pusher.push(OutboundMessage::ServerGoodbye) {
            tracing::warn!(client = %self.client, "goodbye not delivered");
        }
    }
}

impl<C: Clock> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client.to_string())
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;
    use crate::protocol::Purpose;

    fn make_session() -> Session<SystemClock> {
        let (tx, _rx) = mpsc::channel(8);
        Session::new(
            UserAgent::new("billing", "5109", Purpose::Sub),
            "127.0.0.1:5200".parse().unwrap(),
            tx,
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        let session = make_session();
        assert_eq!(session.state(), SessionState::Constructed);

        session.mark_running();
        assert_eq!(session.state(), SessionState::Running);

        assert!(session.mark_closed());
        assert!(!session.mark_closed());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_availability_requires_running_and_topic() {
        let session = make_session();
        session.context().put(SubscriptionItem::persistent("t1"));
        assert!(!session.is_available("t1"));

        session.mark_running();
        assert!(session.is_available("t1"));
        assert!(!session.is_available("t2"));

        session.mark_closed();
        assert!(!session.is_available("t1"));
    }

    #[test]
    fn test_subscribe_without_group_fails() {
        let session = Arc::new(make_session());
        let err = session
            .subscribe(&[SubscriptionItem::persistent("t1")])
            .unwrap_err();
        assert!(matches!(err, SessionError::GroupUnavailable));
    }

    #[test]
    fn test_heartbeat_refreshes_age() {
        let session = make_session();
        session.heartbeat();
        assert!(session.heartbeat_age_ms() < 1_000);
    }
}
