//! One client group: backend channels, member sessions, and the listeners
//! that route consumed messages to them.

use super::dispatch::DispatchStrategy;
use crate::core::config::Config;
use crate::core::time::Clock;
use crate::ops::metrics::EngineMetrics;
use crate::protocol::{build_client_group, build_mesh_client_id, MeshEvent, Purpose, SubscriptionItem};
use crate::queue::{
    CommitAction, ConsumeContext, EventListener, MeshQueueConsumer, MeshQueueProducer,
    QueueClientConfig, QueueDriver, QueueError,
};
use crate::session::{DownStreamMsgContext, Session};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("session group {session_group} does not belong to {group}")]
    GroupMismatch {
        group: String,
        session_group: String,
    },
    #[error("no subscription for topic {0}")]
    SubscriptionAbsent(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Node-level knobs a group needs, lifted out of the full config.
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub node_ip: String,
    pub cluster: String,
    pub env: String,
    pub idc: String,
    pub send_back_max_times: u32,
    pub msg_ttl: Duration,
}

impl GroupSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            node_ip: cfg.server.ip.clone(),
            cluster: cfg.server.cluster.clone(),
            env: cfg.server.env.clone(),
            idc: cfg.server.idc.clone(),
            send_back_max_times: cfg.queue.send_back_max_times,
            msg_ttl: Duration::from_millis(cfg.queue.msg_ttl_ms),
        }
    }
}

struct Members<C: Clock> {
    consumers: HashMap<SocketAddr, Arc<Session<C>>>,
    producers: HashMap<SocketAddr, Arc<Session<C>>>,
}

struct TopicTable<C: Clock> {
    /// Sessions listening on each topic.
    sessions: HashMap<String, Vec<Arc<Session<C>>>>,
    /// Group-level subscription descriptor per topic. First subscriber
    /// wins; later sessions join under the established mode.
    subscriptions: HashMap<String, SubscriptionItem>,
}

/// Everything one client group owns: its producer, its persistent and
/// broadcast consumers, its member sessions, and its topic routing table.
///
/// Lifecycle flags are independent so each backend channel can be inited,
/// started, and shut down exactly once per cycle; shutdown resets them so
/// a revived group starts from scratch.
pub struct ClientGroupWrapper<C: Clock> {
    group: String,
    settings: GroupSettings,
    clock: C,
    dispatcher: Arc<dyn DispatchStrategy<C>>,
    metrics: Arc<EngineMetrics>,

    producer: Arc<dyn MeshQueueProducer>,
    persistent_consumer: Arc<dyn MeshQueueConsumer>,
    broadcast_consumer: Arc<dyn MeshQueueConsumer>,

    members: Mutex<Members<C>>,
    topics: Mutex<TopicTable<C>>,

    producer_started: AtomicBool,
    persistent_inited: AtomicBool,
    persistent_started: AtomicBool,
    broadcast_inited: AtomicBool,
    broadcast_started: AtomicBool,
    seq: AtomicU64,
}

impl<C: Clock> ClientGroupWrapper<C> {
    pub fn new(
        group: impl Into<String>,
        settings: GroupSettings,
        clock: C,
        driver: &dyn QueueDriver,
        dispatcher: Arc<dyn DispatchStrategy<C>>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            group: group.into(),
            settings,
            clock,
            dispatcher,
            metrics,
            producer: driver.create_producer(),
            persistent_consumer: driver.create_consumer(),
            broadcast_consumer: driver.create_consumer(),
            members: Mutex::new(Members {
                consumers: HashMap::new(),
                producers: HashMap::new(),
            }),
            topics: Mutex::new(TopicTable {
                sessions: HashMap::new(),
                subscriptions: HashMap::new(),
            }),
            producer_started: AtomicBool::new(false),
            persistent_inited: AtomicBool::new(false),
            persistent_started: AtomicBool::new(false),
            broadcast_inited: AtomicBool::new(false),
            broadcast_started: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// A session belongs here only if its qualified group key matches.
    fn check_group(&self, session: &Session<C>) -> Result<(), GroupError> {
        let session_group = build_client_group(&session.client().group, &self.settings.env);
        if session_group == self.group {
            Ok(())
        } else {
            Err(GroupError::GroupMismatch {
                group: self.group.clone(),
                session_group,
            })
        }
    }

    // ---- membership ----

    pub fn add_consumer_session(&self, session: Arc<Session<C>>) -> Result<bool, GroupError> {
        self.check_group(&session)?;
        let mut members = self.members.lock();
        Ok(members
            .consumers
            .insert(session.remote_addr(), session)
            .is_none())
    }

    pub fn remove_consumer_session(&self, addr: SocketAddr) -> bool {
        self.members.lock().consumers.remove(&addr).is_some()
    }

    pub fn add_producer_session(&self, session: Arc<Session<C>>) -> Result<bool, GroupError> {
        self.check_group(&session)?;
        let mut members = self.members.lock();
        Ok(members
            .producers
            .insert(session.remote_addr(), session)
            .is_none())
    }

    pub fn remove_producer_session(&self, addr: SocketAddr) -> bool {
        self.members.lock().producers.remove(&addr).is_some()
    }

    pub fn consumer_count(&self) -> usize {
        self.members.lock().consumers.len()
    }

    pub fn producer_count(&self) -> usize {
        self.members.lock().producers.len()
    }

    /// True while any session, consumer or producer, still belongs here.
    pub fn has_members(&self) -> bool {
        let members = self.members.lock();
        !(members.consumers.is_empty() && members.producers.is_empty())
    }

    // ---- topic routing table ----

    pub fn add_subscription(
        &self,
        item: &SubscriptionItem,
        session: &Arc<Session<C>>,
    ) -> Result<(), GroupError> {
        self.check_group(session)?;
        let mut topics = self.topics.lock();
        let listeners = topics.sessions.entry(item.topic.clone()).or_default();
        if !listeners
            .iter()
            .any(|s| s.remote_addr() == session.remote_addr())
        {
            listeners.push(session.clone());
        }
        topics
            .subscriptions
            .entry(item.topic.clone())
            .or_insert_with(|| item.clone());
        Ok(())
    }

    pub fn remove_subscription(
        &self,
        item: &SubscriptionItem,
        session: &Arc<Session<C>>,
    ) -> Result<(), GroupError> {
        self.check_group(session)?;
        let mut topics = self.topics.lock();
        let Some(listeners) = topics.sessions.get_mut(&item.topic) else {
            return Err(GroupError::SubscriptionAbsent(item.topic.clone()));
        };
        listeners.retain(|s| s.remote_addr() != session.remote_addr());
        if listeners.is_empty() {
            // Both entries go together; a topic with no subscribers must not
            // linger in either map.
            topics.sessions.remove(&item.topic);
            topics.subscriptions.remove(&item.topic);
        }
        Ok(())
    }

    pub fn has_subscription(&self, topic: &str) -> bool {
        self.topics
            .lock()
            .sessions
            .get(topic)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn subscription_for(&self, topic: &str) -> Option<SubscriptionItem> {
        self.topics.lock().subscriptions.get(topic).cloned()
    }

    pub fn sessions_for_topic(&self, topic: &str) -> Vec<Arc<Session<C>>> {
        self.topics
            .lock()
            .sessions
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.topics.lock().subscriptions.keys().cloned().collect()
    }

    // ---- backend channel lifecycle ----

    fn client_config(&self, subsystem: &str, purpose: Purpose, broadcast: bool) -> QueueClientConfig {
        QueueClientConfig {
            group: self.group.clone(),
            instance_name: build_mesh_client_id(subsystem, purpose, &self.settings.cluster),
            idc: self.settings.idc.clone(),
            broadcast,
        }
    }

    /// Guard pattern shared by every lifecycle flag: exactly one caller
    /// performs the transition, the rest see an immediate Ok.
    fn enter(flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn start_producer(&self, subsystem: &str) -> Result<(), GroupError> {
        if !Self::enter(&self.producer_started) {
            return Ok(());
        }
        let cfg = self.client_config(subsystem, Purpose::Pub, false);
        if let Err(err) = self.producer.init(&cfg).and_then(|()| self.producer.start()) {
            self.producer_started.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        tracing::info!(group = %self.group, "group producer started");
        Ok(())
    }

    pub fn shutdown_producer(&self) {
        if !self.producer_started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.producer.shutdown() {
            tracing::warn!(group = %self.group, "producer shutdown failed: {err}");
        }
        tracing::info!(group = %self.group, "group producer shut down");
    }

    pub fn init_persistent_consumer(self: &Arc<Self>, subsystem: &str) -> Result<(), GroupError> {
        if !Self::enter(&self.persistent_inited) {
            return Ok(());
        }
        let listener = Arc::new(GroupDispatchListener {
            wrapper: Arc::downgrade(self),
            broadcast: false,
        });
        let result = self
            .persistent_consumer
            .init(&self.client_config(subsystem, Purpose::Sub, false))
            .and_then(|()| self.persistent_consumer.register_listener(listener));
        if let Err(err) = result {
            self.persistent_inited.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        tracing::info!(group = %self.group, "persistent consumer inited");
        Ok(())
    }

    pub fn init_broadcast_consumer(self: &Arc<Self>, subsystem: &str) -> Result<(), GroupError> {
        if !Self::enter(&self.broadcast_inited) {
            return Ok(());
        }
        let listener = Arc::new(GroupDispatchListener {
            wrapper: Arc::downgrade(self),
            broadcast: true,
        });
        let result = self
            .broadcast_consumer
            .init(&self.client_config(subsystem, Purpose::Sub, true))
            .and_then(|()| self.broadcast_consumer.register_listener(listener));
        if let Err(err) = result {
            self.broadcast_inited.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        tracing::info!(group = %self.group, "broadcast consumer inited");
        Ok(())
    }

    pub fn start_persistent_consumer(&self) -> Result<(), GroupError> {
        if !self.persistent_inited.load(Ordering::SeqCst) || !Self::enter(&self.persistent_started)
        {
            return Ok(());
        }
        if let Err(err) = self.persistent_consumer.start() {
            self.persistent_started.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        tracing::info!(group = %self.group, "persistent consumer started");
        Ok(())
    }

    pub fn start_broadcast_consumer(&self) -> Result<(), GroupError> {
        if !self.broadcast_inited.load(Ordering::SeqCst) || !Self::enter(&self.broadcast_started) {
            return Ok(());
        }
        if let Err(err) = self.broadcast_consumer.start() {
            self.broadcast_started.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        tracing::info!(group = %self.group, "broadcast consumer started");
        Ok(())
    }

    pub fn shutdown_persistent_consumer(&self) {
        self.persistent_started.store(false, Ordering::SeqCst);
        if !self.persistent_inited.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.persistent_consumer.shutdown() {
            tracing::warn!(group = %self.group, "persistent consumer shutdown failed: {err}");
        }
    }

    pub fn shutdown_broadcast_consumer(&self) {
        self.broadcast_started.store(false, Ordering::SeqCst);
        if !self.broadcast_inited.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.broadcast_consumer.shutdown() {
            tracing::warn!(group = %self.group, "broadcast consumer shutdown failed: {err}");
        }
    }

    /// Init both consumer channels with their dispatch listeners.
    pub fn init_consumers(self: &Arc<Self>, subsystem: &str) -> Result<(), GroupError> {
        self.init_persistent_consumer(subsystem)?;
        self.init_broadcast_consumer(subsystem)?;
        Ok(())
    }

    /// Start whichever consumer channels are inited but not yet started.
    pub fn start_consumers(&self) -> Result<(), GroupError> {
        self.start_persistent_consumer()?;
        self.start_broadcast_consumer()?;
        Ok(())
    }

    pub fn shutdown_consumers(&self) {
        self.shutdown_persistent_consumer();
        self.shutdown_broadcast_consumer();
        tracing::info!(group = %self.group, "group consumers shut down");
    }

    /// Full teardown of every backend channel this group started.
    pub fn shutdown(&self) {
        self.shutdown_consumers();
        self.shutdown_producer();
        tracing::info!(group = %self.group, "group wrapper shut down");
    }

    /// Register the topic with the backend channel matching its mode.
    pub fn subscribe(&self, item: &SubscriptionItem) -> Result<(), GroupError> {
        if item.mode.is_broadcast() {
            self.broadcast_consumer.subscribe(&item.topic)?;
        } else {
            self.persistent_consumer.subscribe(&item.topic)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, item: &SubscriptionItem) -> Result<(), GroupError> {
        if item.mode.is_broadcast() {
            self.broadcast_consumer.unsubscribe(&item.topic)?;
        } else {
            self.persistent_consumer.unsubscribe(&item.topic)?;
        }
        Ok(())
    }

    // ---- upstream ----

    pub fn send(
        &self,
        event: MeshEvent,
        callback: crate::queue::SendCallback,
    ) -> Result<(), GroupError> {
        self.producer.send(event, callback)?;
        Ok(())
    }

    pub fn request(
        &self,
        event: MeshEvent,
        callback: crate::queue::ReplyCallback,
        timeout: Duration,
    ) -> Result<(), GroupError> {
        self.producer.request(event, callback, timeout)?;
        Ok(())
    }

    // ---- downstream ----

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn deliver(&self, session: &Arc<Session<C>>, event: MeshEvent, item: SubscriptionItem) {
        let now = self.clock.now();
        let ctx = DownStreamMsgContext::new(
            self.next_seq(),
            event,
            session.remote_addr(),
            item,
            now,
            now + self.settings.msg_ttl,
        );
        tracing::debug!(
            group = %self.group,
            biz_seq = ctx.event.biz_seq(),
            seq = ctx.seq,
            session = %ctx.session_addr,
            "downstream delivery"
        );
        let frame = ctx.delivery();
        // Pending table first, so an ack arriving immediately finds the entry.
        session.pusher().unack_msg(ctx);
        if session.downstream_msg(frame) {
            self.metrics.record_downstream();
        }
    }

    fn dispatch_persistent(&self, event: &MeshEvent) -> bool {
        let candidates = self.sessions_for_topic(&event.topic);
        let Some(session) = self.dispatcher.select(&event.topic, &candidates) else {
            return false;
        };
        let item = self
            .subscription_for(&event.topic)
            .unwrap_or_else(|| SubscriptionItem::persistent(&event.topic));
        self.deliver(&session, event.clone(), item);
        true
    }

    /// Fan out to every available session, one spawned task per delivery so
    /// a slow client cannot stall its siblings. Returns the fan-out width.
    fn dispatch_broadcast(self: &Arc<Self>, event: &MeshEvent) -> usize {
        let candidates = self.sessions_for_topic(&event.topic);
        let item = self
            .subscription_for(&event.topic)
            .unwrap_or_else(|| SubscriptionItem::broadcasting(&event.topic));
        let mut delivered = 0;
        for session in candidates {
            if !session.is_available(&event.topic) {
                continue;
            }
            delivered += 1;
            let wrapper = self.clone();
            let event = event.clone();
            let item = item.clone();
            tokio::spawn(async move {
                wrapper.deliver(&session, event, item);
            });
        }
        delivered
    }

    /// Route one message consumed from the backend. Persistent messages are
    /// committed with the broker taking over redelivery; broadcast ones are
    /// best-effort and committed regardless of per-client outcome.
    pub(crate) fn handle_inbound(
        self: &Arc<Self>,
        mut event: MeshEvent,
        ctx: ConsumeContext,
        broadcast: bool,
    ) {
        event.stamp_receipt(&self.settings.node_ip);
        if broadcast {
            if self.dispatch_broadcast(&event) == 0 {
                tracing::debug!(
                    group = %self.group,
                    topic = %event.topic,
                    biz_seq = event.biz_seq(),
                    "no session available for broadcast message"
                );
                ctx.commit(CommitAction::CommitMessage);
            } else {
                ctx.commit(CommitAction::ManualAck);
            }
        } else if self.dispatch_persistent(&event) {
            ctx.commit(CommitAction::ManualAck);
        } else {
            self.send_back(event);
            ctx.commit(CommitAction::CommitMessage);
        }
    }

    /// Re-route a delivery whose session went away. Broadcast contexts are
    /// dropped; persistent ones move to another eligible session, or are
    /// dropped with a warning when none is left.
    pub fn handle_orphan(&self, mut ctx: DownStreamMsgContext) {
        if ctx.broadcast {
            tracing::debug!(
                group = %self.group,
                seq = ctx.seq,
                "broadcast delivery dropped with its session"
            );
            self.metrics.record_drop();
            return;
        }
        let candidates = self.sessions_for_topic(&ctx.event.topic);
        if let Some(session) = self.dispatcher.select(&ctx.event.topic, &candidates) {
            ctx.session_addr = session.remote_addr();
            tracing::info!(
                group = %self.group,
                seq = ctx.seq,
                session = %ctx.session_addr,
                "redelivering unacked message"
            );
            let frame = ctx.delivery();
            session.pusher().unack_msg(ctx);
            if session.downstream_msg(frame) {
                self.metrics.record_downstream();
            }
        } else {
            tracing::warn!(
                group = %self.group,
                seq = ctx.seq,
                biz_seq = ctx.event.biz_seq(),
                "no session left for redelivery, dropping unacked message"
            );
            self.metrics.record_drop();
        }
    }

    /// A delivery sat unacknowledged past its deadline. Administrative ack:
    /// the entry is dropped to bound the pending table, not retried.
    pub fn handle_expired(&self, ctx: DownStreamMsgContext) {
        self.metrics.record_unack_expired();
        tracing::warn!(
            group = %self.group,
            seq = ctx.seq,
            biz_seq = ctx.event.biz_seq(),
            session = %ctx.session_addr,
            "unacked message expired, dropping"
        );
    }

    /// Return a message to the backend for redelivery elsewhere, up to the
    /// configured hop limit.
    pub fn send_back(&self, mut event: MeshEvent) {
        if event.send_back_times() >= self.settings.send_back_max_times {
            tracing::warn!(
                group = %self.group,
                biz_seq = event.biz_seq(),
                times = event.send_back_times(),
                "message dropped after send-back limit"
            );
            self.metrics.record_drop();
            return;
        }
        event.mark_send_back(&self.settings.node_ip);
        self.metrics.record_send_back();
        let group = self.group.clone();
        let biz_seq = event.biz_seq().to_string();
        let result = self.producer.send(
            event,
            Box::new(move |r| {
                if let Err(err) = r {
                    tracing::warn!(group = %group, biz_seq = %biz_seq, "send-back failed: {err}");
                }
            }),
        );
        if let Err(err) = result {
            tracing::warn!(group = %self.group, "send-back rejected by producer: {err}");
            self.metrics.record_drop();
        }
    }
}

/// Bridges one backend consumer channel into the group's routing table.
struct GroupDispatchListener<C: Clock> {
    wrapper: Weak<ClientGroupWrapper<C>>,
    broadcast: bool,
}

impl<C: Clock> EventListener for GroupDispatchListener<C> {
    fn on_event(&self, event: MeshEvent, ctx: ConsumeContext) {
        match self.wrapper.upgrade() {
            Some(wrapper) => wrapper.handle_inbound(event, ctx, self.broadcast),
            None => ctx.commit(CommitAction::CommitMessage),
        }
    }
}
