//! Topic subscriptions and their consumption modes.

/// Consumption model for a topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Load-balanced delivery: one recipient per message, redelivery on
    /// recipient loss.
    Persistent,
    /// Fan-out to every available consumer, best-effort, no redelivery.
    Broadcasting,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Persistent => "persistent",
            SubscriptionMode::Broadcasting => "broadcasting",
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, SubscriptionMode::Broadcasting)
    }
}

/// Immutable descriptor of a topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubscriptionItem {
    pub topic: String,
    pub mode: SubscriptionMode,
}

impl SubscriptionItem {
    pub fn new(topic: impl Into<String>, mode: SubscriptionMode) -> Self {
        Self {
            topic: topic.into(),
            mode,
        }
    }

    pub fn persistent(topic: impl Into<String>) -> Self {
        Self::new(topic, SubscriptionMode::Persistent)
    }

    pub fn broadcasting(topic: impl Into<String>) -> Self {
        Self::new(topic, SubscriptionMode::Broadcasting)
    }
}
