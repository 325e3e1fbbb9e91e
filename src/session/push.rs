//! Downstream delivery state: the per-session pending-acknowledgment table.
//!
//! Every message handed to a client stays in its session's table until the
//! client acknowledges it, the sweep expires it, or the session closes and
//! the context is redelivered to another session.

use crate::protocol::{MeshEvent, SubscriptionItem};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

/// One in-flight delivery attempt. Owned by the pending-ack table of exactly
/// one session at a time; reassigned (not copied) on redelivery.
#[derive(Debug)]
pub struct DownStreamMsgContext {
    pub seq: u64,
    pub event: MeshEvent,
    /// Session currently responsible for acknowledging this delivery.
    pub session_addr: SocketAddr,
    pub subscription_item: SubscriptionItem,
    /// Broadcast deliveries are never redelivered on session loss.
    pub broadcast: bool,
    pub create_time: Instant,
    pub expire_at: Instant,
}

impl DownStreamMsgContext {
    pub fn new(
        seq: u64,
        event: MeshEvent,
        session_addr: SocketAddr,
        subscription_item: SubscriptionItem,
        create_time: Instant,
        expire_at: Instant,
    ) -> Self {
        let broadcast = subscription_item.mode.is_broadcast();
        Self {
            seq,
            event,
            session_addr,
            subscription_item,
            broadcast,
            create_time,
            expire_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expire_at
    }

    /// Outbound frame for this context; the context itself stays in the
    /// pending table.
    pub fn delivery(&self) -> OutboundMessage {
        OutboundMessage::Event {
            seq: self.seq,
            event: self.event.clone(),
        }
    }
}

/// Frame handed to the transport layer for one session.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Event { seq: u64, event: MeshEvent },
    /// Best-effort shutdown notice; the transport should flush and close.
    ServerGoodbye,
}

/// Downstream side of a session: outbound channel plus unacked deliveries.
pub struct SessionPusher {
    downstream_tx: mpsc::Sender<OutboundMessage>,
    unack: Mutex<HashMap<u64, DownStreamMsgContext>>,
}

impl SessionPusher {
    pub fn new(downstream_tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            downstream_tx,
            unack: Mutex::new(HashMap::new()),
        }
    }

    /// Register an in-flight delivery awaiting client acknowledgment.
    pub fn unack_msg(&self, ctx: DownStreamMsgContext) {
        self.unack.lock().insert(ctx.seq, ctx);
    }

    /// Client acknowledged; the context leaves the table.
    pub fn ack(&self, seq: u64) -> Option<DownStreamMsgContext> {
        self.unack.lock().remove(&seq)
    }

    pub fn unack_count(&self) -> usize {
        self.unack.lock().len()
    }

    /// Drain every pending context, for redelivery on session close.
    pub fn take_all(&self) -> Vec<DownStreamMsgContext> {
        let mut unack = self.unack.lock();
        unack.drain().map(|(_, ctx)| ctx).collect()
    }

    /// Remove and return contexts past their expiry deadline.
    pub fn take_expired(&self, now: Instant) -> Vec<DownStreamMsgContext> {
        let mut unack = self.unack.lock();
        let expired_seqs: Vec<u64> = unack
            .iter()
            .filter(|(_, ctx)| ctx.is_expired(now))
            .map(|(&seq, _)| seq)
            .collect();
        expired_seqs
            .into_iter()
            .filter_map(|seq| unack.remove(&seq))
            .collect()
    }

    /// Non-blocking handoff to the transport. Delivery failure is the
    /// transport's to report; the pending table already owns redelivery.
    pub fn push(&self, msg: OutboundMessage) -> bool {
        match self.downstream_tx.try_send(msg) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("downstream channel rejected message: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubscriptionMode;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    fn make_ctx(seq: u64, ttl: Duration) -> DownStreamMsgContext {
        let now = Instant::now();
        DownStreamMsgContext::new(
            seq,
            MeshEvent::new("t1", Vec::new()),
            addr(),
            SubscriptionItem::new("t1", SubscriptionMode::Persistent),
            now,
            now + ttl,
        )
    }

    #[test]
    fn test_unack_and_ack() {
        let (tx, _rx) = mpsc::channel(4);
        let pusher = SessionPusher::new(tx);

        pusher.unack_msg(make_ctx(1, Duration::from_secs(30)));
        pusher.unack_msg(make_ctx(2, Duration::from_secs(30)));
        assert_eq!(pusher.unack_count(), 2);

        let ctx = pusher.ack(1).unwrap();
        assert_eq!(ctx.seq, 1);
        assert_eq!(pusher.unack_count(), 1);
        assert!(pusher.ack(1).is_none());
    }

    #[test]
    fn test_take_expired_only_removes_past_deadline() {
        let (tx, _rx) = mpsc::channel(4);
        let pusher = SessionPusher::new(tx);

        pusher.unack_msg(make_ctx(1, Duration::from_millis(0)));
        pusher.unack_msg(make_ctx(2, Duration::from_secs(60)));

        let expired = pusher.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].seq, 1);
        assert_eq!(pusher.unack_count(), 1);
    }

    #[test]
    fn test_take_all_drains() {
        let (tx, _rx) = mpsc::channel(4);
        let pusher = SessionPusher::new(tx);

        pusher.unack_msg(make_ctx(1, Duration::from_secs(30)));
        pusher.unack_msg(make_ctx(2, Duration::from_secs(30)));

        assert_eq!(pusher.take_all().len(), 2);
        assert_eq!(pusher.unack_count(), 0);
    }

    #[test]
    fn test_push_reports_full_channel() {
        let (tx, _rx) = mpsc::channel(1);
        let pusher = SessionPusher::new(tx);

        assert!(pusher.push(OutboundMessage::ServerGoodbye));
        assert!(!pusher.push(OutboundMessage::ServerGoodbye));
    }

    #[test]
    fn test_broadcast_flag_follows_mode() {
        let now = Instant::now();
        let ctx = DownStreamMsgContext::new(
            9,
            MeshEvent::new("t1", Vec::new()),
            addr(),
            SubscriptionItem::new("t1", SubscriptionMode::Broadcasting),
            now,
            now + Duration::from_secs(1),
        );
        assert!(ctx.broadcast);
    }
}
