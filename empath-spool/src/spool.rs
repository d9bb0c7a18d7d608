//! Lifecycle wrapper around a [`BackingStore`].
//!
//! `Spool` owns a backing store and drives its lifecycle: validating it at
//! startup and, while the process runs, watching for messages placed into it
//! by something other than this process (e.g. an operator dropping a file
//! directly into a file-backed spool directory).

use empath_common::{Signal, internal, tracing};
use empath_tracing::traced;

use crate::r#trait::BackingStore;

/// Owns a backing store and its lifecycle (`init`/`serve`).
///
/// Generic over the backend so the same wrapper works for file-backed,
/// memory-backed, or test stores; all backend-specific behaviour lives behind
/// [`BackingStore::validate`] and [`BackingStore::watch`].
#[derive(Debug)]
pub struct Spool<Backend: BackingStore> {
    store: Backend,
}

impl<Backend: BackingStore> Spool<Backend> {
    /// Wrap a backing store
    pub const fn new(store: Backend) -> Self {
        Self { store }
    }

    /// Validate the backing store is ready for use (e.g. spool directory exists)
    ///
    /// # Errors
    /// Returns an error if the backing store fails validation
    pub fn init(&mut self) -> crate::Result<()> {
        internal!("Initialising spool ...");
        self.store.validate()
    }

    /// Get a reference to the backing store
    pub const fn store(&self) -> &Backend {
        &self.store
    }

    /// Run the spool for the lifetime of the process
    ///
    /// Watches for externally-written messages (if the backend supports it)
    /// until a shutdown signal is received. Messages are still discovered via
    /// a full spool scan regardless, so a backend with no watcher support is
    /// simply idle until shutdown.
    ///
    /// # Errors
    /// Returns an error if the backing store's watcher cannot be started
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> crate::Result<()> {
        internal!("Spool starting");

        let mut watch = self.store.watch()?;

        loop {
            tokio::select! {
                id = async {
                    match &mut watch {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match id {
                        Some(id) => tracing::debug!(message_id = %id, "Observed externally-spooled message"),
                        None => watch = None,
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Spool shutting down");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Spool shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
