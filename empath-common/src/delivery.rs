use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Where a spooled message currently sits in the outbound relay pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Queued, no delivery attempt has started yet.
    Pending,
    /// An SMTP session to a remote MX is currently in flight.
    InProgress,
    /// Accepted by the remote MX; terminal.
    Completed,
    /// Rejected with a permanent (5xx) error; terminal.
    Failed(String),
    /// A transient (4xx) error was hit; will be retried.
    Retry { attempts: u32, last_error: String },
    /// Exceeded the maximum retention window without a successful delivery; terminal.
    Expired,
}

impl DeliveryStatus {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Expired)
    }
}

/// A single recorded attempt to deliver a message to a remote MX.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub server: String,
    pub timestamp: u64,
    pub error: Option<String>,
}

/// Delivery-scoped state attached to a [`crate::context::Context`] so it can
/// survive a restart alongside the spooled message it describes (RFC 3461/3464
/// DSN bookkeeping lives here too).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryContext {
    pub message_id: String,
    pub domain: Arc<str>,
    pub server: Option<String>,
    pub error: Option<String>,
    pub attempts: Option<u32>,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub attempt_history: Vec<DeliveryAttempt>,
    pub queued_at: u64,
    pub next_retry_at: Option<u64>,
    #[serde(default)]
    pub current_server_index: usize,
}
