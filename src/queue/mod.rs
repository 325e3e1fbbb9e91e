//! Backend message-queue seam.
//!
//! The routing engine never implements queue semantics; it talks to the
//! backend through the narrow producer/consumer contracts below. A real
//! deployment plugs in a connector for its queue; `memory` provides an
//! in-process driver for standalone mode and tests.

pub mod memory;

use crate::protocol::MeshEvent;
use std::sync::Arc;
use std::time::Duration;

/// Backend queue failures surfaced to the routing engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue channel not started")]
    NotStarted,
    #[error("queue channel already started")]
    AlreadyStarted,
    #[error("no listener registered for consumer")]
    NoListener,
    #[error("no route for topic {0}")]
    NoRoute(String),
    #[error("backend send failed: {0}")]
    SendFailed(String),
}

/// Properties handed to a backend channel when it is initialized for a group.
#[derive(Debug, Clone)]
pub struct QueueClientConfig {
    pub group: String,
    pub instance_name: String,
    pub idc: String,
    /// Only meaningful for consumers: selects the broadcast channel flavor.
    pub broadcast: bool,
}

/// What the engine tells the backend about a consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitAction {
    /// The backend may forget the message; the broker owns nothing further.
    CommitMessage,
    /// The backend may forget the message; the broker now owns redelivery
    /// until the client acknowledges.
    ManualAck,
}

/// Per-message consume handle. Commit exactly once; dropping without a
/// commit is treated as `CommitMessage` by drivers that care.
pub struct ConsumeContext {
    committer: Option<Box<dyn FnOnce(CommitAction) + Send>>,
}

impl ConsumeContext {
    pub fn new(committer: impl FnOnce(CommitAction) + Send + 'static) -> Self {
        Self {
            committer: Some(Box::new(committer)),
        }
    }

    /// A context that ignores the commit outcome, for tests and fallbacks.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn commit(mut self, action: CommitAction) {
        if let Some(committer) = self.committer.take() {
            committer(action);
        }
    }
}

impl std::fmt::Debug for ConsumeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("committed", &self.committer.is_none())
            .finish()
    }
}

/// Callback invoked once the backend accepts or rejects an upstream send.
pub type SendCallback = Box<dyn FnOnce(Result<(), QueueError>) + Send>;

/// Callback invoked with the reply to a request/reply exchange.
pub type ReplyCallback = Box<dyn FnOnce(Result<MeshEvent, QueueError>) + Send>;

/// Receives messages consumed from a backend channel.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: MeshEvent, ctx: ConsumeContext);
}

/// Producer side of a group's backend channel.
pub trait MeshQueueProducer: Send + Sync {
    fn init(&self, cfg: &QueueClientConfig) -> Result<(), QueueError>;
    fn start(&self) -> Result<(), QueueError>;
    fn shutdown(&self) -> Result<(), QueueError>;
    fn send(&self, event: MeshEvent, callback: SendCallback) -> Result<(), QueueError>;
    fn request(
        &self,
        event: MeshEvent,
        callback: ReplyCallback,
        timeout: Duration,
    ) -> Result<(), QueueError>;
}

/// Consumer side of a group's backend channel.
pub trait MeshQueueConsumer: Send + Sync {
    fn init(&self, cfg: &QueueClientConfig) -> Result<(), QueueError>;
    fn start(&self) -> Result<(), QueueError>;
    fn shutdown(&self) -> Result<(), QueueError>;
    fn subscribe(&self, topic: &str) -> Result<(), QueueError>;
    fn unsubscribe(&self, topic: &str) -> Result<(), QueueError>;
    fn register_listener(&self, listener: Arc<dyn EventListener>) -> Result<(), QueueError>;
}

/// Creates backend channels on demand; one producer plus two consumers per
/// client group.
pub trait QueueDriver: Send + Sync {
    fn create_producer(&self) -> Arc<dyn MeshQueueProducer>;
    fn create_consumer(&self) -> Arc<dyn MeshQueueConsumer>;
}
