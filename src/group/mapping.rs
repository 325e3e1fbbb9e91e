//! Session registry: owns every live session and every client group, and
//! runs the expiry sweeps over both.

use super::dispatch::FreePriorityDispatch;
use super::wrapper::{ClientGroupWrapper, GroupError, GroupSettings};
use crate::core::config::Config;
use crate::core::time::Clock;
use crate::ops::metrics::EngineMetrics;
use crate::protocol::{build_client_group, UserAgent};
use crate::queue::QueueDriver;
use crate::session::{OutboundMessage, Session, SessionState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("session is closed")]
    Closed,
    #[error("session has no client group attached")]
    GroupUnavailable,
    #[error("client purpose {0} cannot be readied as a consumer")]
    NotConsumer(String),
    #[error(transparent)]
    Group(#[from] GroupError),
}

/// Registry of sessions by peer address and group wrappers by qualified
/// group key. Group init and teardown are serialized per group through a
/// dedicated lock table.
pub struct ClientSessionGroupMapping<C: Clock> {
    config: Arc<Config>,
    clock: C,
    driver: Arc<dyn QueueDriver>,
    metrics: Arc<EngineMetrics>,
    sessions: Mutex<HashMap<SocketAddr, Arc<Session<C>>>>,
    groups: Mutex<HashMap<String, Arc<ClientGroupWrapper<C>>>>,
    group_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<C: Clock> ClientSessionGroupMapping<C> {
    pub fn new(config: Arc<Config>, clock: C, driver: Arc<dyn QueueDriver>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            driver,
            metrics: Arc::new(EngineMetrics::default()),
            sessions: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            group_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn session(&self, addr: SocketAddr) -> Option<Arc<Session<C>>> {
        self.sessions.lock().get(&addr).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn group(&self, key: &str) -> Option<Arc<ClientGroupWrapper<C>>> {
        self.groups.lock().get(key).cloned()
    }

    pub fn groups(&self) -> Vec<Arc<ClientGroupWrapper<C>>> {
        self.groups.lock().values().cloned().collect()
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Init locks currently retained; tracks the group table.
    pub fn group_lock_count(&self) -> usize {
        self.group_locks.lock().len()
    }

    /// Outbound channel sized from configuration, for the transport layer.
    pub fn downstream_channel(
        &self,
    ) -> (
        mpsc::Sender<OutboundMessage>,
        mpsc::Receiver<OutboundMessage>,
    ) {
        mpsc::channel(self.config.session.downstream_buffer)
    }

    fn group_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.group_locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Register a new session for the peer. Idempotent per address: a second
    /// hello from the same peer returns the existing session.
    pub fn create_session(
        &self,
        mut client: UserAgent,
        addr: SocketAddr,
        downstream_tx: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<Session<C>>, MappingError> {
        if let Some(existing) = self.session(addr) {
            tracing::info!(client = %existing.client(), %addr, "session already registered");
            return Ok(existing);
        }
        // The observed peer address is authoritative over the declared one.
        client.host = addr.ip().to_string();
        client.port = addr.port();
        let session = Arc::new(Session::new(client, addr, downstream_tx));
        self.init_group_wrapper(&session)?;
        self.sessions.lock().insert(addr, session.clone());
        self.metrics.record_session_created();
        tracing::info!(client = %session.client(), %addr, "session created");
        Ok(session)
    }

    fn init_group_wrapper(&self, session: &Arc<Session<C>>) -> Result<(), MappingError> {
        let key = build_client_group(&session.client().group, &self.config.server.env);
        let lock = self.group_lock(&key);
        let _guard = lock.lock();

        let wrapper = {
            let mut groups = self.groups.lock();
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    tracing::info!(group = %key, "creating client group wrapper");
                    ClientGroupWrapper::new(
                        key.clone(),
                        GroupSettings::from_config(&self.config),
                        self.clock.clone(),
                        self.driver.as_ref(),
                        Arc::new(FreePriorityDispatch::new()),
                        self.metrics.clone(),
                    )
                })
                .clone()
        };
        session.set_client_group_wrapper(&wrapper);
        if session.client().is_consumer() {
            // Channels are inited here but only started at ready, after the
            // client has had a chance to subscribe.
            wrapper.init_consumers(&session.client().subsystem)?;
        } else {
            wrapper.add_producer_session(session.clone())?;
            wrapper.start_producer(&session.client().subsystem)?;
            // Producers have no ready step; they publish as soon as the
            // hello completes.
            session.mark_running();
        }
        Ok(())
    }

    /// Join the session to the group's consumer set, start the consumer
    /// channels, and mark the session running. Producers never go through
    /// ready.
    pub fn ready_session(&self, session: &Arc<Session<C>>) -> Result<(), MappingError> {
        if session.state() == SessionState::Closed {
            return Err(MappingError::Closed);
        }
        if !session.client().is_consumer() {
            return Err(MappingError::NotConsumer(
                session.client().purpose.as_str().to_string(),
            ));
        }
        let wrapper = session
            .client_group_wrapper()
            .ok_or(MappingError::GroupUnavailable)?;
        wrapper.add_consumer_session(session.clone())?;
        wrapper.start_consumers()?;
        session.mark_running();
        tracing::info!(client = %session.client(), "session ready");
        Ok(())
    }

    /// Tear a session down: unregister it, redeliver its unacked persistent
    /// messages, and remove the group once its last member leaves. Safe to
    /// call more than once.
    pub fn close_session(&self, session: &Arc<Session<C>>) {
        if !session.mark_closed() {
            return;
        }
        let addr = session.remote_addr();
        self.sessions.lock().remove(&addr);
        self.metrics.record_session_closed();
        tracing::info!(client = %session.client(), %addr, "session closing");

        let Some(wrapper) = session.client_group_wrapper() else {
            return;
        };
        if session.client().is_consumer() {
            for item in session.context().items() {
                if let Err(err) = wrapper.remove_subscription(&item, session) {
                    tracing::debug!(topic = %item.topic, "subscription already gone: {err}");
                }
                if !wrapper.has_subscription(&item.topic) {
                    if let Err(err) = wrapper.unsubscribe(&item) {
                        tracing::warn!(topic = %item.topic, "unsubscribe on close failed: {err}");
                    }
                }
            }
            wrapper.remove_consumer_session(addr);
            for ctx in session.pusher().take_all() {
                wrapper.handle_orphan(ctx);
            }
            // Last consumer gone: stop the consume channels even while
            // producer sessions keep the group itself alive.
            if wrapper.consumer_count() == 0 {
                wrapper.shutdown_consumers();
            }
        } else {
            wrapper.remove_producer_session(addr);
        }
        self.clean_group_if_empty(&wrapper);
    }

    fn clean_group_if_empty(&self, wrapper: &Arc<ClientGroupWrapper<C>>) {
        let key = wrapper.group().to_string();
        let lock = self.group_lock(&key);
        {
            let _guard = lock.lock();
            if wrapper.has_members() {
                return;
            }
            if self.groups.lock().remove(&key).is_some() {
                wrapper.shutdown();
                tracing::info!(group = %key, "group removed, last member session left");
            }
        }
        // Discard the init lock with the group, unless the group was already
        // re-created or another caller still holds a handle to the lock.
        let mut locks = self.group_locks.lock();
        if let Some(entry) = locks.get(&key) {
            let in_use =
                Arc::strong_count(entry) > 2 || self.groups.lock().contains_key(&key);
            if !in_use {
                locks.remove(&key);
            }
        }
    }

    /// Evict sessions whose heartbeat is older than the configured expiry.
    pub fn sweep_expired_sessions(&self) {
        let threshold = self.config.session.expired_ms;
        let expired: Vec<Arc<Session<C>>> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.heartbeat_age_ms() > threshold)
            .cloned()
            .collect();
        for session in expired {
            tracing::warn!(
                client = %session.client(),
                age_ms = session.heartbeat_age_ms(),
                "evicting expired session"
            );
            self.close_session(&session);
        }
    }

    /// Pull deliveries past their ack deadline out of every session. Each
    /// one gets an administrative ack so the pending tables stay bounded.
    pub fn sweep_expired_unacks(&self) {
        let now = self.clock.now();
        for session in self.sessions() {
            let expired = session.pusher().take_expired(now);
            if expired.is_empty() {
                continue;
            }
            let Some(wrapper) = session.client_group_wrapper() else {
                continue;
            };
            for ctx in expired {
                wrapper.handle_expired(ctx);
            }
        }
    }

    /// Background sweeps; both stop when the shutdown signal fires.
    pub fn spawn_sweepers(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.clone().run_session_sweeper(shutdown.clone()),
            self.clone().run_unack_sweeper(shutdown),
        ]
    }

    fn run_session_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.session.expired_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.clock.sleep(interval) => self.sweep_expired_sessions(),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn run_unack_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.session.unack_expired_sweep_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.clock.sleep(interval) => self.sweep_expired_unacks(),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Graceful drain, group by group: goodbye to the group's clients, a
    /// grace pause for in-flight acks, then close them. A final pass sweeps
    /// any session left and tears down any group still standing.
    pub async fn shutdown(&self) {
        tracing::info!(
            sessions = self.session_count(),
            groups = self.group_count(),
            "session registry shutting down"
        );
        let grace = Duration::from_millis(self.config.shutdown.grace_interval_ms);
        for wrapper in self.groups() {
            let members: Vec<Arc<Session<C>>> = self
                .sessions()
                .into_iter()
                .filter(|s| {
                    s.client_group_wrapper()
                        .is_some_and(|w| Arc::ptr_eq(&w, &wrapper))
                })
                .collect();
            for session in &members {
                session.notify_goodbye();
            }
            self.clock.sleep(grace).await;
            for session in &members {
                self.close_session(session);
            }
        }
        for session in self.sessions() {
            session.notify_goodbye();
            self.close_session(&session);
        }
        self.clock
            .sleep(Duration::from_millis(self.config.shutdown.final_pause_ms))
            .await;
        for wrapper in self.groups() {
            wrapper.shutdown();
        }
        self.groups.lock().clear();
        self.group_locks.lock().clear();
        tracing::info!("session registry shut down");
    }
}
