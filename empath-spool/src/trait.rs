//! The `BackingStore` abstraction all spool implementations satisfy.

use async_trait::async_trait;
use empath_common::context::Context;

use crate::types::SpooledMessageId;

/// Durable (or transient, for testing) storage for spooled messages.
///
/// A backing store owns the full lifecycle of a spooled [`Context`]: assigning
/// it an identifier on write, listing what's currently spooled, and reading,
/// updating or deleting a message by id. Implementations must be safe to
/// share across the scan/process/cleanup tasks that poll the spool
/// concurrently.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Persist a new message, assigning it a fresh [`SpooledMessageId`].
    ///
    /// Implementations should set `context.tracking_id` to the generated id
    /// before returning, so the caller can observe it without a second read.
    ///
    /// # Errors
    /// Returns an error if the message cannot be persisted.
    async fn write(&self, context: &mut Context) -> crate::Result<SpooledMessageId>;

    /// List the ids of every message currently in the store.
    ///
    /// # Errors
    /// Returns an error if the store cannot be enumerated.
    async fn list(&self) -> crate::Result<Vec<SpooledMessageId>>;

    /// Read a message by id.
    ///
    /// # Errors
    /// Returns [`crate::SpoolError::NotFound`] if no message with this id exists.
    async fn read(&self, id: &SpooledMessageId) -> crate::Result<Context>;

    /// Overwrite an existing message's content in place.
    ///
    /// Used to persist delivery state (status, attempts, retry timers) back to
    /// the spool so it survives a restart.
    ///
    /// # Errors
    /// Returns [`crate::SpoolError::NotFound`] if no message with this id exists.
    async fn update(&self, id: &SpooledMessageId, context: &Context) -> crate::Result<()>;

    /// Remove a message from the store.
    ///
    /// # Errors
    /// Returns [`crate::SpoolError::NotFound`] if no message with this id exists.
    async fn delete(&self, id: &SpooledMessageId) -> crate::Result<()>;

    /// Validate the store is ready for use (e.g. create/check a spool directory).
    ///
    /// Called once from [`crate::spool::Spool::init`]. Stores with nothing to
    /// validate (in-memory, test) can rely on the default no-op.
    ///
    /// # Errors
    /// Returns an error if the store is misconfigured or unreachable.
    fn validate(&self) -> crate::Result<()> {
        Ok(())
    }

    /// Start watching for messages placed in the store by an external process.
    ///
    /// Returns `None` if the store has no notion of external writers (the
    /// default). Implementations that do (e.g. a file-backed store) return a
    /// channel that yields the id of each externally-observed message, so
    /// [`crate::spool::Spool::serve`] can react to it without a full rescan.
    ///
    /// # Errors
    /// Returns an error if the watcher cannot be started.
    fn watch(&self) -> crate::Result<Option<tokio::sync::mpsc::UnboundedReceiver<SpooledMessageId>>> {
        Ok(None)
    }
}
