//! Persisted Pool Snapshots
//!
//! Each pool persists its credential records as one JSON object keyed by
//! credential id. Writes are debounced: bursts of mutations collapse into a
//! single rewrite of the whole file. Persistence is best-effort; failures are
//! logged and never reach the caller of a pool operation.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::credential::Credential;
use crate::error::Result;

/// Default delay between the first mutation and the rewrite
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Debounced JSON snapshot of one pool
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    path: PathBuf,
    debounce: Duration,
    pending: Mutex<Option<String>>,
    flush_scheduled: AtomicBool,
    /// Serializes take, write and rename of the shared temp file
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.inner.path)
            .field("debounce", &self.inner.debounce)
            .finish_non_exhaustive()
    }
}

impl SnapshotStore {
    /// Create a store writing to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_debounce(path, DEFAULT_FLUSH_DEBOUNCE)
    }

    /// Create a store with a custom debounce window
    pub fn with_debounce(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                path: path.into(),
                debounce,
                pending: Mutex::new(None),
                flush_scheduled: AtomicBool::new(false),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Store for a named pool inside a snapshot directory
    pub fn for_pool(dir: impl AsRef<Path>, pool: &str, debounce: Duration) -> Self {
        Self::with_debounce(dir.as_ref().join(format!("{pool}.json")), debounce)
    }

    /// Snapshot file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Load the persisted records
    ///
    /// A missing or unreadable snapshot yields an empty map.
    #[must_use]
    pub fn load(&self) -> HashMap<String, Credential> {
        let path = &self.inner.path;
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read pool snapshot");
                return HashMap::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring corrupt pool snapshot");
                HashMap::new()
            }
        }
    }

    /// Schedule a rewrite with the given records
    ///
    /// Inside a Tokio runtime the write happens after the debounce window and
    /// only the latest scheduled contents are written. Outside a runtime the
    /// write is immediate.
    pub fn schedule(&self, records: &HashMap<String, Credential>) {
        let contents = match serde_json::to_string_pretty(records) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode pool snapshot");
                return;
            }
        };
        *self.inner.pending.lock() = Some(contents);

        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let weak = Arc::downgrade(&self.inner);
                let debounce = self.inner.debounce;
                handle.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.flush_scheduled.store(false, Ordering::Release);
                        inner.write_pending_logged();
                    }
                });
            }
            Err(_) => {
                self.inner.flush_scheduled.store(false, Ordering::Release);
                self.inner.write_pending_logged();
            }
        }
    }

    /// Write any pending contents now
    pub fn flush(&self) -> Result<()> {
        self.inner.write_pending()
    }
}

impl SnapshotInner {
    fn write_pending(&self) -> Result<()> {
        let _writing = self.write_lock.lock();
        let Some(contents) = self.pending.lock().take() else {
            return Ok(());
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::trace!(path = %self.path.display(), "Pool snapshot written");
        Ok(())
    }

    fn write_pending_logged(&self) {
        if let Err(e) = self.write_pending() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write pool snapshot");
        }
    }
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        self.write_pending_logged();
    }
}
