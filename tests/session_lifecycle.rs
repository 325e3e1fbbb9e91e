//! Session lifecycle against the full engine: hello, ready, close with
//! redelivery, expiry sweeps, and graceful shutdown.

mod common;

use common::{connect_consumer, connect_producer, fast_config, make_engine, peer, recv_event};
use meshbus::event::MeshEvent;
use meshbus::ops::admin;
use meshbus::protocol::{Purpose, SubscriptionItem, UserAgent};
use meshbus::session::{OutboundMessage, SessionState};
use std::time::Duration;

#[tokio::test]
async fn test_close_redelivers_unacked_to_surviving_session() {
    let (mapping, _driver) = make_engine(fast_config());
    let (doomed, mut doomed_rx) =
        connect_consumer(&mapping, "billing", 1, &[SubscriptionItem::persistent("t1")]);
    let (survivor, mut survivor_rx) =
        connect_consumer(&mapping, "billing", 2, &[SubscriptionItem::persistent("t1")]);
    let (producer, _prx) = connect_producer(&mapping, "billing", 3);

    // Two messages, one per consumer under round-robin.
    for _ in 0..2 {
        producer
            .upstream_msg(MeshEvent::new("t1", Vec::new()), Box::new(|r| r.unwrap()))
            .unwrap();
    }
    let _ = recv_event(&mut doomed_rx).await;
    let _ = recv_event(&mut survivor_rx).await;
    assert_eq!(doomed.pusher().unack_count(), 1);
    assert_eq!(survivor.pusher().unack_count(), 1);

    mapping.close_session(&doomed);

    // The doomed session's pending delivery moved to the survivor.
    assert_eq!(survivor.pusher().unack_count(), 2);
    let _ = recv_event(&mut survivor_rx).await;
    assert_eq!(mapping.session_count(), 2);
}

#[tokio::test]
async fn test_close_is_idempotent_and_tears_down_group() {
    let (mapping, _driver) = make_engine(fast_config());
    let (session, _rx) =
        connect_consumer(&mapping, "billing", 1, &[SubscriptionItem::persistent("t1")]);
    assert_eq!(mapping.group_count(), 1);

    mapping.close_session(&session);
    mapping.close_session(&session);

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(mapping.session_count(), 0);
    assert_eq!(mapping.group_count(), 0);
    assert_eq!(mapping.metrics().snapshot().sessions_closed, 1);
}

#[tokio::test]
async fn test_subscribe_after_close_is_rejected() {
    let (mapping, _driver) = make_engine(fast_config());
    let (session, _rx) =
        connect_consumer(&mapping, "billing", 1, &[SubscriptionItem::persistent("t1")]);

    mapping.close_session(&session);
    assert!(session
        .subscribe(&[SubscriptionItem::persistent("t2")])
        .is_err());
}

#[tokio::test]
async fn test_heartbeat_keeps_session_alive_through_sweep() {
    let mut config = fast_config();
    config.session.expired_ms = 40;
    let (mapping, _driver) = make_engine(config);
    let (fresh, _rx1) =
        connect_consumer(&mapping, "billing", 1, &[SubscriptionItem::persistent("t1")]);
    let (stale, _rx2) =
        connect_consumer(&mapping, "billing", 2, &[SubscriptionItem::persistent("t1")]);

    tokio::time::sleep(Duration::from_millis(60)).await;
    fresh.heartbeat();
    mapping.sweep_expired_sessions();

    assert_eq!(fresh.state(), SessionState::Running);
    assert_eq!(stale.state(), SessionState::Closed);
    assert_eq!(mapping.session_count(), 1);
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (mapping, _driver) = make_engine(fast_config());
    let item = SubscriptionItem::persistent("t1");
    let (session, _rx) = connect_consumer(&mapping, "billing", 1, &[item.clone()]);
    let (producer, _prx) = connect_producer(&mapping, "billing", 2);

    session.unsubscribe(&[item]).unwrap();

    // Nothing listens on t1 anymore; the publish is reported as unroutable.
    producer
        .upstream_msg(
            MeshEvent::new("t1", Vec::new()),
            Box::new(|r| assert!(r.is_err())),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.pusher().unack_count(), 0);
}

#[tokio::test]
async fn test_graceful_shutdown_says_goodbye_first() {
    let (mapping, _driver) = make_engine(fast_config());
    let (_session, mut rx) =
        connect_consumer(&mapping, "billing", 1, &[SubscriptionItem::persistent("t1")]);

    mapping.shutdown().await;

    assert!(matches!(rx.recv().await, Some(OutboundMessage::ServerGoodbye)));
    assert_eq!(mapping.session_count(), 0);
    assert_eq!(mapping.group_count(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_each_group() {
    let (mapping, _driver) = make_engine(fast_config());
    let (_billing, mut billing_rx) =
        connect_consumer(&mapping, "billing", 1, &[SubscriptionItem::persistent("t1")]);
    let (_orders, mut orders_rx) =
        connect_consumer(&mapping, "orders", 2, &[SubscriptionItem::persistent("t2")]);

    mapping.shutdown().await;

    assert!(matches!(
        billing_rx.recv().await,
        Some(OutboundMessage::ServerGoodbye)
    ));
    assert!(matches!(
        orders_rx.recv().await,
        Some(OutboundMessage::ServerGoodbye)
    ));
    assert_eq!(mapping.session_count(), 0);
    assert_eq!(mapping.group_count(), 0);
    assert_eq!(mapping.group_lock_count(), 0);
}

#[tokio::test]
async fn test_admin_view_tracks_lifecycle() {
    let (mapping, _driver) = make_engine(fast_config());
    let (session, _rx) =
        connect_consumer(&mapping, "billing", 1, &[SubscriptionItem::persistent("t1")]);

    let report = admin::session_distribution(&mapping);
    assert_eq!(report.session_count, 1);
    assert_eq!(report.groups[0].topics, vec!["t1".to_string()]);
    assert_eq!(admin::clients_by_subsystem(&mapping, "5109").len(), 1);

    mapping.close_session(&session);
    let report = admin::session_distribution(&mapping);
    assert_eq!(report.session_count, 0);
    assert!(report.groups.is_empty());
}

#[tokio::test]
async fn test_producer_session_has_observed_address() {
    let (mapping, _driver) = make_engine(fast_config());
    let (tx, _rx) = mapping.downstream_channel();
    let mut agent = UserAgent::new("billing", "5109", Purpose::Pub);
    agent.host = "203.0.113.7".into();
    agent.port = 9999;

    let session = mapping.create_session(agent, peer(42), tx).unwrap();
    assert_eq!(session.client().host, "127.0.0.1");
    assert_eq!(session.client().port, 42);
}
