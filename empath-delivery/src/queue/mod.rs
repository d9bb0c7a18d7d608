//! Delivery queue management

pub mod cleanup;
pub mod retry;

use dashmap::DashMap;
use empath_common::DeliveryStatus;
use empath_spool::SpooledMessageId;

use crate::{dns::MailServer, types::DeliveryInfo};

/// Manages the delivery queue for outbound messages
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    /// Map of message IDs to delivery information
    pub(crate) queue: std::sync::Arc<DashMap<SpooledMessageId, DeliveryInfo>>,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryQueue {
    /// Create a new empty delivery queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Number of messages currently tracked by the queue
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Insert delivery information for a message, overwriting any existing entry
    ///
    /// Used when restoring delivery state persisted to the spool (e.g. after a restart).
    pub fn insert(&self, message_id: SpooledMessageId, info: DeliveryInfo) {
        self.queue.insert(message_id, info);
    }

    /// Add a message to the delivery queue
    pub fn enqueue(&self, message_id: SpooledMessageId, recipient_domain: String) {
        self.queue.insert(
            message_id.clone(),
            DeliveryInfo::new(message_id, recipient_domain),
        );
    }

    /// Get delivery info for a message
    #[must_use]
    pub fn get(&self, message_id: &SpooledMessageId) -> Option<DeliveryInfo> {
        self.queue.get(message_id).map(|entry| entry.clone())
    }

    /// Update the status of a message
    pub fn update_status(&self, message_id: &SpooledMessageId, status: DeliveryStatus) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.status = status;
        }
    }

    /// Record a delivery attempt
    pub fn record_attempt(
        &self,
        message_id: &SpooledMessageId,
        attempt: empath_common::DeliveryAttempt,
    ) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.record_attempt(attempt);
        }
    }

    /// Set the resolved mail servers for a message
    pub fn set_mail_servers(
        &self,
        message_id: &SpooledMessageId,
        servers: std::sync::Arc<Vec<MailServer>>,
    ) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.mail_servers = servers;
            info.current_server_index = 0;
        }
    }

    /// Try the next MX server for a message.
    ///
    /// Returns `true` if there is another server to try, `false` if all exhausted.
    pub fn try_next_server(&self, message_id: &SpooledMessageId) -> bool {
        self.queue
            .get_mut(message_id)
            .is_some_and(|mut info| info.try_next_server())
    }

    /// Remove a message from the queue
    pub fn remove(&self, message_id: &SpooledMessageId) -> Option<DeliveryInfo> {
        self.queue.remove(message_id).map(|(_, info)| info)
    }

    /// Set the next retry timestamp for a message (unix seconds)
    pub fn set_next_retry_at(&self, message_id: &SpooledMessageId, next_retry_at: u64) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.next_retry_at = Some(next_retry_at);
        }
    }

    /// Reset the server index to 0 for a message (for new retry cycle)
    pub fn reset_server_index(&self, message_id: &SpooledMessageId) {
        if let Some(mut info) = self.queue.get_mut(message_id) {
            info.reset_server_index();
        }
    }

    /// Get all pending messages
    #[must_use]
    pub fn pending_messages(&self) -> Vec<DeliveryInfo> {
        self.queue
            .iter()
            .filter(|entry| entry.status == DeliveryStatus::Pending)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Get all messages with their current status
    #[must_use]
    pub fn all_messages(&self) -> Vec<DeliveryInfo> {
        self.queue.iter().map(|entry| entry.clone()).collect()
    }
}
