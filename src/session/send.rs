//! Upstream path: events published by a client into the backend queue.

use super::session::{Session, SessionError, SessionState};
use crate::core::time::{unix_millis, Clock};
use crate::protocol::{MeshEvent, UserAgent};
use crate::queue::{ReplyCallback, SendCallback};
use std::net::SocketAddr;
use std::time::Duration;

/// Provenance of an upstream event, carried for logging and the send-back
/// path. Internal sends (redelivery returns) have no originating session.
#[derive(Debug, Clone)]
pub struct UpStreamMsgContext {
    pub session: Option<SocketAddr>,
    pub client: Option<UserAgent>,
    pub enqueue_ms: u64,
}

impl UpStreamMsgContext {
    pub fn from_session<C: Clock>(session: &Session<C>) -> Self {
        Self {
            session: Some(session.remote_addr()),
            client: Some(session.client().clone()),
            enqueue_ms: unix_millis(),
        }
    }

    /// Context for sends the broker originates itself.
    pub fn internal() -> Self {
        Self {
            session: None,
            client: None,
            enqueue_ms: unix_millis(),
        }
    }
}

impl<C: Clock> Session<C> {
    /// Publish an event through this session's group producer.
    pub fn upstream_msg(
        &self,
        event: MeshEvent,
        callback: SendCallback,
    ) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let wrapper = self
            .client_group_wrapper()
            .ok_or(SessionError::GroupUnavailable)?;
        let ctx = UpStreamMsgContext::from_session(self);
        tracing::debug!(
            biz_seq = event.biz_seq(),
            topic = %event.topic,
            client = %ctx.client.as_ref().map(ToString::to_string).unwrap_or_default(),
            "upstream send"
        );
        wrapper.send(event, callback)?;
        Ok(())
    }

    /// Request/reply through this session's group producer.
    pub fn upstream_request(
        &self,
        event: MeshEvent,
        callback: ReplyCallback,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let wrapper = self
            .client_group_wrapper()
            .ok_or(SessionError::GroupUnavailable)?;
        tracing::debug!(
            biz_seq = event.biz_seq(),
            topic = %event.topic,
            "upstream request"
        );
        wrapper.request(event, callback, timeout)?;
        Ok(())
    }

    /// Publish a reply event for a request this session consumed earlier.
    /// Replies ride the same group producer as ordinary sends.
    pub fn upstream_reply(
        &self,
        event: MeshEvent,
        callback: SendCallback,
    ) -> Result<(), SessionError> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let wrapper = self
            .client_group_wrapper()
            .ok_or(SessionError::GroupUnavailable)?;
        tracing::debug!(
            biz_seq = event.biz_seq(),
            topic = %event.topic,
            "upstream reply"
        );
        wrapper.send(event, callback)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::SystemClock;
    use crate::protocol::Purpose;
    use crate::session::OutboundMessage;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_upstream_without_group_fails() {
        let (tx, _rx) = mpsc::channel::<OutboundMessage>(4);
        let session: Arc<Session<SystemClock>> = Arc::new(Session::new(
            UserAgent::new("billing", "5109", Purpose::Pub),
            "127.0.0.1:5300".parse().unwrap(),
            tx,
        ));
        let err = session
            .upstream_msg(MeshEvent::new("t1", Vec::new()), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, SessionError::GroupUnavailable));
    }

    #[test]
    fn test_reply_without_group_fails() {
        let (tx, _rx) = mpsc::channel::<OutboundMessage>(4);
        let session: Arc<Session<SystemClock>> = Arc::new(Session::new(
            UserAgent::new("billing", "5109", Purpose::Sub),
            "127.0.0.1:5301".parse().unwrap(),
            tx,
        ));
        let err = session
            .upstream_reply(MeshEvent::new("t1", Vec::new()), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, SessionError::GroupUnavailable));
    }

    #[test]
    fn test_internal_context_has_no_session() {
        let ctx = UpStreamMsgContext::internal();
        assert!(ctx.session.is_none());
        assert!(ctx.client.is_none());
        assert!(ctx.enqueue_ms > 0);
    }
}
