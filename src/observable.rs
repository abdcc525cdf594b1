use crate::domain::{sort_newest_first, Task};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;

/// One complete task set, newest first
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    /// Local time the snapshot was installed
    pub received_at: DateTime<Utc>,
    /// Increments with every install, starting at 1
    pub version: u64,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Load state of the task list
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    /// Nothing received yet
    Loading,
    Ready(Arc<Snapshot>),
    /// The subscription could not be set up, or the store closed it
    Failed(String),
}

impl LoadState {
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        match self {
            LoadState::Ready(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Writer half. Not `Clone`: the subscription callback is the only writer,
/// and every install replaces the whole task set.
#[derive(Debug)]
pub struct SnapshotCache {
    tx: watch::Sender<LoadState>,
    version: u64,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LoadState::Loading);
        Self { tx, version: 0 }
    }

    /// Replace the current snapshot with `tasks`
    pub fn install(&mut self, mut tasks: Vec<Task>, received_at: DateTime<Utc>) -> Arc<Snapshot> {
        sort_newest_first(&mut tasks);
        self.version += 1;
        let snapshot = Arc::new(Snapshot {
            tasks,
            received_at,
            version: self.version,
        });
        self.tx.send_replace(LoadState::Ready(Arc::clone(&snapshot)));
        snapshot
    }

    /// Record that loading failed
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.tx.send_replace(LoadState::Failed(reason.into()));
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the cache
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<LoadState>,
}

impl SnapshotReader {
    /// Currently installed snapshot, if any
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.rx.borrow().snapshot().cloned()
    }

    pub fn state(&self) -> LoadState {
        self.rx.borrow().clone()
    }

    /// Treat the current state as seen by [`changed`](Self::changed)
    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Wait until the first snapshot is installed.
    /// Returns `None` if loading failed or the writer went away.
    pub async fn ready(&mut self) -> Option<Arc<Snapshot>> {
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state {
                LoadState::Ready(snapshot) => return Some(snapshot),
                LoadState::Failed(_) => return None,
                LoadState::Loading => {}
            }
            self.rx.changed().await.ok()?;
        }
    }

    /// Wait for the next install or failure
    pub async fn changed(&mut self) -> Option<LoadState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
