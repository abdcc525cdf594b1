use crate::clock::{Clock, ManualClock};
use crate::observable::{Snapshot, SnapshotCache, SnapshotReader};
use crate::session::{SessionContext, User};
use crate::store::{MemoryDocumentStore, Subscription, TaskStoreAdapter};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Fixed instant every fixture clock starts at
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

pub struct Fixture {
    pub clock: ManualClock,
    pub store: Arc<MemoryDocumentStore>,
    pub adapter: TaskStoreAdapter,
    pub reader: SnapshotReader,
    _subscription: Subscription,
}

impl Fixture {
    /// Memory store, manual clock and a subscription installing into a cache
    pub async fn signed_in(uid: &str) -> Self {
        let clock = ManualClock::new(start());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryDocumentStore::new(Arc::clone(&shared)));
        let adapter = TaskStoreAdapter::new(store.clone(), SessionContext::signed_in(User::new(uid)))
            .with_clock(Arc::clone(&shared));

        let mut cache = SnapshotCache::new();
        let mut reader = cache.reader();
        let installer_clock = Arc::clone(&shared);
        let subscription = adapter
            .subscribe(move |tasks| {
                cache.install(tasks, installer_clock.now());
            })
            .await
            .expect("subscribe");
        reader.ready().await.expect("initial snapshot");

        Self {
            clock,
            store,
            adapter,
            reader,
            _subscription: subscription,
        }
    }

    pub fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }
}

/// Wait until the installed snapshot satisfies `pred`
pub async fn wait_for(
    reader: &mut SnapshotReader,
    pred: impl Fn(&Snapshot) -> bool,
) -> Arc<Snapshot> {
    let wait = async {
        loop {
            if let Some(snapshot) = reader.latest() {
                if pred(&snapshot) {
                    return snapshot;
                }
            }
            reader.changed().await.expect("cache writer dropped");
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for snapshot")
}
