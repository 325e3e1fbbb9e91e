//! Shared helpers for integration tests.
#![allow(dead_code)]

use meshbus::config::Config;
use meshbus::group::mapping::ClientSessionGroupMapping;
use meshbus::protocol::{Purpose, SubscriptionItem, UserAgent};
use meshbus::queue::memory::MemoryQueueDriver;
use meshbus::session::{OutboundMessage, Session};
use meshbus::time::SystemClock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type Mapping = ClientSessionGroupMapping<SystemClock>;
pub type TestSession = Arc<Session<SystemClock>>;

/// Config with shutdown pauses short enough for tests.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.shutdown.grace_interval_ms = 1;
    config.shutdown.final_pause_ms = 1;
    config
}

pub fn make_engine(config: Config) -> (Arc<Mapping>, MemoryQueueDriver) {
    let driver = MemoryQueueDriver::new();
    let mapping = ClientSessionGroupMapping::new(
        Arc::new(config),
        SystemClock,
        Arc::new(driver.clone()),
    );
    (mapping, driver)
}

pub fn peer(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

/// Register a subscriber session, subscribe it, and ready it.
pub fn connect_consumer(
    mapping: &Arc<Mapping>,
    group: &str,
    port: u16,
    items: &[SubscriptionItem],
) -> (TestSession, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mapping.downstream_channel();
    let session = mapping
        .create_session(UserAgent::new(group, "5109", Purpose::Sub), peer(port), tx)
        .expect("create consumer session");
    session.subscribe(items).expect("subscribe");
    mapping.ready_session(&session).expect("ready session");
    (session, rx)
}

/// Register a publisher session.
pub fn connect_producer(
    mapping: &Arc<Mapping>,
    group: &str,
    port: u16,
) -> (TestSession, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mapping.downstream_channel();
    let session = mapping
        .create_session(UserAgent::new(group, "5109", Purpose::Pub), peer(port), tx)
        .expect("create producer session");
    (session, rx)
}

/// Wait for the next event frame on a session channel, with a bound so a
/// broken routing path fails the test instead of hanging it.
pub async fn recv_event(rx: &mut mpsc::Receiver<OutboundMessage>) -> (u64, meshbus::event::MeshEvent) {
    let frame = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed");
    match frame {
        OutboundMessage::Event { seq, event } => (seq, event),
        OutboundMessage::ServerGoodbye => panic!("unexpected goodbye frame"),
    }
}
