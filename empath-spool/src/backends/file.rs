//! File-backed spool storage.
//!
//! Each message is split across two files named after its [`SpooledMessageId`]:
//! `<id>.bin` holds the bincode-encoded [`Context`] metadata (envelope, status,
//! session metadata, ...) and `<id>.eml` holds the raw message body. Splitting
//! the two means the (potentially large) body never round-trips through
//! bincode, and lets an operator inspect `.eml` files directly.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use empath_common::{context::Context, tracing};
use notify::Watcher as _;
use tokio::sync::mpsc;

use crate::{SpoolError, error::ValidationError, r#trait::BackingStore, types::SpooledMessageId};

fn default_spool_path() -> PathBuf {
    PathBuf::from("/var/spool/empath")
}

/// Unix directories a spool must never be pointed at.
#[cfg(unix)]
const SYSTEM_PREFIXES: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr/bin", "/boot", "/sys", "/proc", "/dev",
];

/// Windows directories a spool must never be pointed at (checked case-insensitively).
#[cfg(windows)]
const SYSTEM_PREFIXES: &[&str] = &["c:\\windows", "c:\\program files", "c:\\programdata"];

/// Validate the *shape* of a spool path (absolute, no traversal, not a system
/// directory), without touching the filesystem.
///
/// This runs at config time (builder, deserialization) so a bad path is
/// rejected before the process ever tries to create it. Filesystem-level
/// checks (exists, writable) happen later in [`BackingStore::validate`].
fn validate_path(path: &Path) -> crate::Result<()> {
    let display = path.display().to_string();

    if display.contains("..") {
        return Err(
            ValidationError::InvalidConfiguration(format!("spool path cannot contain '..': {display}")).into(),
        );
    }

    if !path.is_absolute() {
        return Err(
            ValidationError::InvalidConfiguration(format!("spool path must be absolute: {display}")).into(),
        );
    }

    #[cfg(windows)]
    let comparison = display.to_lowercase();
    #[cfg(not(windows))]
    let comparison = display.clone();

    if SYSTEM_PREFIXES.iter().any(|prefix| comparison.starts_with(prefix)) {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path must not be a system directory: {display}"
        ))
        .into());
    }

    Ok(())
}

/// File-based backing store implementation
///
/// Messages are persisted under a configured directory, surviving process
/// restarts. This is the production backend; [`super::memory::MemoryBackingStore`]
/// is for testing and transient use.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
}

impl<'de> serde::Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        struct Raw {
            #[serde(default = "default_spool_path")]
            path: PathBuf,
        }

        let raw = Raw::deserialize(deserializer)?;
        validate_path(&raw.path).map_err(serde::de::Error::custom)?;
        Ok(Self { path: raw.path })
    }
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: default_spool_path(),
        }
    }
}

impl FileBackingStore {
    /// Start building a `FileBackingStore` with a custom path
    #[must_use]
    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    /// The directory this store reads and writes messages in
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn bin_path(&self, id: &SpooledMessageId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }

    fn eml_path(&self, id: &SpooledMessageId) -> PathBuf {
        self.path.join(format!("{id}.eml"))
    }
}

/// Builder for [`FileBackingStore`]
#[derive(Debug, Default)]
pub struct FileBackingStoreBuilder {
    path: Option<PathBuf>,
}

impl FileBackingStoreBuilder {
    /// Set the spool directory
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Build the store
    ///
    /// Only validates the *shape* of the path (absolute, no `..`, not a
    /// system directory); the spool directory itself is created and checked
    /// later by [`BackingStore::validate`], once the store is handed to a
    /// [`crate::spool::Spool`].
    ///
    /// # Errors
    /// Returns a [`crate::SpoolError::Validation`] if the path is relative,
    /// contains `..`, or points at a system directory.
    pub fn build(self) -> crate::Result<FileBackingStore> {
        let path = self.path.unwrap_or_else(default_spool_path);
        validate_path(&path)?;
        Ok(FileBackingStore { path })
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn write(&self, context: &mut Context) -> crate::Result<SpooledMessageId> {
        let id = SpooledMessageId::generate();
        context.tracking_id = Some(id.to_string());
        self.write_at(&id, context).await?;
        Ok(id)
    }

    async fn list(&self) -> crate::Result<Vec<SpooledMessageId>> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Some(filename) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };

            // The `.bin` file is the canonical record of a message; the
            // sibling `.eml` is just its body.
            if filename.ends_with(".bin")
                && let Some(id) = SpooledMessageId::from_filename(&filename)
            {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &SpooledMessageId) -> crate::Result<Context> {
        let meta = tokio::fs::read(self.bin_path(id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpoolError::NotFound(id.clone())
            } else {
                SpoolError::Io(e)
            }
        })?;

        let (mut context, _): (Context, usize) =
            bincode::serde::decode_from_slice(&meta, bincode::config::legacy())
                .map_err(|e| SpoolError::Serialization(e.into()))?;

        let body = tokio::fs::read(self.eml_path(id)).await?;
        context.data = Some(std::sync::Arc::from(body));

        Ok(context)
    }

    async fn update(&self, id: &SpooledMessageId, context: &Context) -> crate::Result<()> {
        if !self.bin_path(id).exists() {
            return Err(SpoolError::NotFound(id.clone()));
        }
        let mut context = context.clone();
        self.write_at(id, &mut context).await
    }

    async fn delete(&self, id: &SpooledMessageId) -> crate::Result<()> {
        tokio::fs::remove_file(self.bin_path(id))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SpoolError::NotFound(id.clone())
                } else {
                    SpoolError::Io(e)
                }
            })?;

        // The body may already be gone if a previous delete partially failed; that's fine.
        let _ = tokio::fs::remove_file(self.eml_path(id)).await;

        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        std::fs::create_dir_all(&self.path)?;

        let metadata = std::fs::metadata(&self.path)?;
        if !metadata.is_dir() {
            return Err(crate::error::ValidationError::NotDirectory(
                self.path.display().to_string(),
            )
            .into());
        }

        if metadata.permissions().readonly() {
            return Err(crate::error::ValidationError::NotWritable(
                self.path.display().to_string(),
            )
            .into());
        }

        Ok(())
    }

    fn watch(&self) -> crate::Result<Option<mpsc::UnboundedReceiver<SpooledMessageId>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else {
                return;
            };
            if !matches!(event.kind, notify::EventKind::Create(_)) {
                return;
            }
            for changed in &event.paths {
                let Some(filename) = changed.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Some(id) = SpooledMessageId::from_filename(filename)
                    && filename.ends_with(".bin")
                    && tx.send(id).is_err()
                {
                    tracing::debug!("Spool watcher channel closed, no longer forwarding events");
                }
            }
        })
        .map_err(|e| SpoolError::WatchError(e.to_string()))?;

        watcher
            .watch(&path, notify::RecursiveMode::NonRecursive)
            .map_err(|e| SpoolError::WatchError(e.to_string()))?;

        // Leak the watcher for the life of the process; it's torn down with the
        // process, and `Spool::serve` only ever creates one per backing store.
        std::mem::forget(watcher);

        Ok(Some(rx))
    }
}

impl FileBackingStore {
    async fn write_at(&self, id: &SpooledMessageId, context: &mut Context) -> crate::Result<()> {
        let body = context.data.clone().unwrap_or_else(|| std::sync::Arc::from(&[][..]));

        let encoded = bincode::serde::encode_to_vec(&*context, bincode::config::legacy())
            .map_err(|e| SpoolError::Serialization(e.into()))?;

        tokio::fs::write(self.bin_path(id), encoded).await?;
        tokio::fs::write(self.eml_path(id), &*body).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use empath_common::envelope::Envelope;

    use super::*;

    fn temp_store() -> (FileBackingStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = FileBackingStore::builder()
            .path(dir.path())
            .build()
            .expect("build store");
        (store, dir)
    }

    fn test_context(data: &str) -> Context {
        Context {
            envelope: Envelope::default(),
            data: Some(std::sync::Arc::from(data.as_bytes())),
            id: "test.example.com".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips_body_and_metadata() {
        let (store, _dir) = temp_store();
        let mut ctx = test_context("hello world");

        let id = store.write(&mut ctx).await.expect("write");
        assert_eq!(ctx.tracking_id, Some(id.to_string()));

        let read = store.read(&id).await.expect("read");
        assert_eq!(read.data.as_deref(), Some(b"hello world".as_slice()));
        assert_eq!(read.id, "test.example.com");
    }

    #[tokio::test]
    async fn list_only_counts_each_message_once() {
        let (store, _dir) = temp_store();
        let mut a = test_context("a");
        let mut b = test_context("b");
        store.write(&mut a).await.expect("write a");
        store.write(&mut b).await.expect("write b");

        let ids = store.list().await.expect("list");
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn read_missing_message_is_not_found() {
        let (store, _dir) = temp_store();
        let id = SpooledMessageId::generate();
        let err = store.read(&id).await.unwrap_err();
        assert!(matches!(err, SpoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_missing_message_is_not_found() {
        let (store, _dir) = temp_store();
        let id = SpooledMessageId::generate();
        let ctx = test_context("x");
        let err = store.update(&id, &ctx).await.unwrap_err();
        assert!(matches!(err, SpoolError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_both_files() {
        let (store, _dir) = temp_store();
        let mut ctx = test_context("gone soon");
        let id = store.write(&mut ctx).await.expect("write");

        store.delete(&id).await.expect("delete");
        assert!(!store.bin_path(&id).exists());
        assert!(!store.eml_path(&id).exists());
    }
}
