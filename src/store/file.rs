use super::collection::{Collection, DocumentFeed, Listeners};
use super::record::{Fields, StoreTimestamp};
use super::DocumentStore;
use crate::clock::Clock;
use crate::domain::OwnerId;
use crate::error::{Result, TaskError};
use crate::persistence::{atomic_write, read_file};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct State {
    collection: Collection,
    listeners: Listeners,
    /// Modification time of the file when last read or written
    seen_modified: Option<SystemTime>,
}

struct Inner {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the file if it changed on disk. Returns whether it did.
    fn refresh(&self, state: &mut State) -> Result<bool> {
        let modified = modified_time(&self.path);
        if modified == state.seen_modified {
            return Ok(false);
        }
        state.collection = load_collection(&self.path)?;
        state.seen_modified = modified;
        Ok(true)
    }

    fn persist(&self, state: &mut State) -> Result<()> {
        let json = serde_json::to_string_pretty(&state.collection)?;
        atomic_write(&self.path, &json).map_err(|e| TaskError::Store(format!("{:#}", e)))?;
        state.seen_modified = modified_time(&self.path);
        Ok(())
    }

    fn listen(&self, owner: &OwnerId) -> Result<DocumentFeed> {
        let mut state = self.state();
        self.refresh(&mut state)?;
        let State {
            collection,
            listeners,
            ..
        } = &mut *state;
        Ok(listeners.register(owner, collection))
    }

    /// Apply one write: refresh, mutate, persist, publish
    fn write<T>(&self, op: impl FnOnce(&mut Collection, StoreTimestamp) -> Result<T>) -> Result<T> {
        let now = StoreTimestamp::server_now(self.clock.as_ref());
        let mut state = self.state();
        self.refresh(&mut state)?;
        let out = op(&mut state.collection, now)?;
        self.persist(&mut state)?;
        let State {
            collection,
            listeners,
            ..
        } = &mut *state;
        listeners.publish(collection);
        Ok(out)
    }

    fn poll_external(&self) -> Result<bool> {
        let mut state = self.state();
        let changed = self.refresh(&mut state)?;
        if changed {
            debug!(path = %self.path.display(), "task file changed on disk");
            let State {
                collection,
                listeners,
                ..
            } = &mut *state;
            listeners.publish(collection);
        }
        Ok(changed)
    }
}

/// Document store persisted to a JSON file.
///
/// Every write reloads the file if another process changed it, applies the
/// change and writes the whole collection back atomically. File access runs
/// on tokio's blocking pool. [`JsonFileStore::watch`] polls the modification
/// time so edits from other processes reach live queries too.
pub struct JsonFileStore {
    inner: Arc<Inner>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        let collection = load_collection(&path)?;
        let seen_modified = modified_time(&path);
        info!(path = %path.display(), documents = collection.len(), "opened task file");
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                clock,
                state: Mutex::new(State {
                    collection,
                    listeners: Listeners::default(),
                    seen_modified,
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Check for out-of-band edits once, publishing if the file changed.
    /// Blocks on file I/O.
    pub fn poll_external(&self) -> Result<bool> {
        self.inner.poll_external()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| TaskError::Store(format!("task file access failed: {}", e)))?
    }

    /// Poll for out-of-band edits until cancelled
    pub async fn watch(self: Arc<Self>, poll_interval: Duration, cancel: CancellationToken) {
        info!(path = %self.path().display(), "task file watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("task file watcher stopped");
                    break;
                }
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.blocking(|inner| inner.poll_external()).await {
                        warn!(error = %e, "could not reload task file");
                    }
                }
            }
        }
    }
}

fn load_collection(path: &Path) -> Result<Collection> {
    let content = read_file(path).map_err(|e| TaskError::Store(format!("{:#}", e)))?;
    if content.trim().is_empty() {
        return Ok(Collection::default());
    }
    Ok(serde_json::from_str(&content)?)
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn listen(&self, owner: &OwnerId) -> Result<DocumentFeed> {
        let owner = owner.clone();
        self.blocking(move |inner| inner.listen(&owner)).await
    }

    async fn insert(&self, fields: Fields) -> Result<String> {
        self.blocking(move |inner| inner.write(|collection, now| Ok(collection.insert(fields, now))))
            .await
    }

    async fn merge(&self, owner: &OwnerId, id: &str, fields: Fields) -> Result<()> {
        let owner = owner.clone();
        let id = id.to_string();
        self.blocking(move |inner| {
            inner.write(|collection, now| collection.merge(&owner, &id, fields, now))
        })
        .await
    }

    async fn delete(&self, owner: &OwnerId, id: &str) -> Result<()> {
        let owner = owner.clone();
        let id = id.to_string();
        self.blocking(move |inner| inner.write(|collection, _| collection.delete(&owner, &id)))
            .await
    }
}
