//! Cleanup queue for failed spool deletions
//!
//! When spool deletion fails after successful delivery, messages are added to
//! this cleanup queue for retry with exponential backoff. This prevents disk
//! exhaustion from accumulated .deleted files.

use std::time::SystemTime;

use dashmap::DashMap;
use empath_spool::SpooledMessageId;

/// Cleanup entry tracking a failed deletion
#[derive(Debug, Clone)]
pub struct CleanupEntry {
    /// Message ID that failed to delete
    pub message_id: SpooledMessageId,
    /// Number of deletion attempts
    pub attempt_count: u32,
    /// When to retry next
    pub next_retry_at: SystemTime,
    /// When the first deletion failed
    pub first_failure: SystemTime,
}

/// Queue for managing failed spool deletions with retry logic
#[derive(Debug, Clone, Default)]
pub struct CleanupQueue {
    /// Map of message IDs to cleanup entries (lock-free concurrent access)
    pub(crate) entries: DashMap<SpooledMessageId, CleanupEntry>,
}

impl CleanupQueue {
    /// Create a new empty cleanup queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Add a failed deletion to the cleanup queue
    ///
    /// This should be called when `spool.delete()` fails after successful delivery.
    pub fn add_failed_deletion(&self, message_id: SpooledMessageId) {
        let now = SystemTime::now();

        self.entries.insert(
            message_id.clone(),
            CleanupEntry {
                message_id,
                attempt_count: 1,   // First failure
                next_retry_at: now, // Retry immediately
                first_failure: now,
            },
        );
    }

    /// Get entries that are ready for retry
    ///
    /// Returns entries where `next_retry_at` is in the past.
    pub fn ready_for_retry(&self, now: SystemTime) -> Vec<CleanupEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.value().next_retry_at <= now)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Schedule a retry for a message with exponential backoff
    ///
    /// Increments attempt count and sets next retry time.
    pub fn schedule_retry(&self, message_id: &SpooledMessageId, next_retry_at: SystemTime) {
        if let Some(mut entry) = self.entries.get_mut(message_id) {
            entry.value_mut().attempt_count += 1;
            entry.value_mut().next_retry_at = next_retry_at;
        }
    }

    /// Remove a message from the cleanup queue
    ///
    /// Called after successful deletion or max retries exceeded.
    pub fn remove(&self, message_id: &SpooledMessageId) {
        self.entries.remove(message_id);
    }

    /// Get the number of messages pending cleanup
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
