use crate::domain::{ElapsedCounter, TaskId, TaskPatch};
use crate::error::Result;
use crate::observable::{LoadState, Snapshot, SnapshotReader};
use crate::store::TaskStoreAdapter;
use crate::ticker;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Latest elapsed seconds per task
pub type ElapsedReadings = Arc<HashMap<TaskId, u64>>;

/// Counts seconds for every open task in the installed snapshot.
///
/// The persisted `timeSpent` is written only when a running task is seen
/// completed.
pub struct ElapsedTracker {
    adapter: TaskStoreAdapter,
    snapshot: SnapshotReader,
    cancel: CancellationToken,
    period: Duration,
    counters: HashMap<TaskId, ElapsedCounter>,
    readings: watch::Sender<ElapsedReadings>,
    seen_version: u64,
    in_flight: JoinSet<(TaskId, Result<()>)>,
}

impl ElapsedTracker {
    pub fn new(adapter: TaskStoreAdapter, snapshot: SnapshotReader, cancel: CancellationToken) -> Self {
        let (readings, _rx) = watch::channel(ElapsedReadings::default());
        Self {
            adapter,
            snapshot,
            cancel,
            period: ticker::tick_duration(),
            counters: HashMap::new(),
            readings,
            seen_version: 0,
            in_flight: JoinSet::new(),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Follow the published readings
    pub fn readings(&self) -> watch::Receiver<ElapsedReadings> {
        self.readings.subscribe()
    }

    pub fn elapsed(&self, id: &TaskId) -> Option<u64> {
        self.counters.get(id).map(|counter| counter.seconds)
    }

    /// Bring the counters in line with the installed snapshot, if it changed
    pub fn sync(&mut self) {
        let Some(snapshot) = self.snapshot.latest() else {
            return;
        };
        if snapshot.version == self.seen_version {
            return;
        }
        self.seen_version = snapshot.version;
        self.reconcile(&snapshot);
    }

    /// Seed new tasks, pause completed ones, resume reopened ones and forget
    /// deleted ones
    pub fn reconcile(&mut self, snapshot: &Snapshot) {
        let mut live = HashSet::with_capacity(snapshot.len());
        let mut to_save = Vec::new();

        for task in &snapshot.tasks {
            live.insert(task.id.clone());
            let Some(counter) = self.counters.get_mut(&task.id) else {
                self.counters.insert(
                    task.id.clone(),
                    ElapsedCounter::seeded(task.time_spent, task.is_completed),
                );
                continue;
            };

            counter.observe_persisted(task.time_spent);
            if task.is_completed && counter.running {
                counter.pause();
                if counter.unsaved() > 0 {
                    to_save.push((task.id.clone(), counter.seconds));
                    counter.mark_saved();
                }
            } else if !task.is_completed && !counter.running {
                counter.start();
            }
        }
        self.counters.retain(|id, _| live.contains(id));

        for (id, seconds) in to_save {
            self.save(id, seconds);
        }
        self.publish();
    }

    /// One tick: sync, then add a second to every running counter
    pub fn tick(&mut self) {
        self.sync();
        for counter in self.counters.values_mut() {
            counter.tick();
        }
        self.publish();
    }

    /// Wait for outstanding write-backs
    pub async fn settle(&mut self) {
        while let Some(outcome) = self.in_flight.join_next().await {
            match outcome {
                Ok((id, Err(e))) => warn!(task_id = %id, error = %e, "could not save elapsed time"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "elapsed time write aborted"),
            }
        }
    }

    fn save(&mut self, id: TaskId, seconds: u64) {
        debug!(task_id = %id, seconds, "saving elapsed time");
        let adapter = self.adapter.clone();
        self.in_flight.spawn(async move {
            let result = adapter.update(&id, TaskPatch::default().time_spent(seconds)).await;
            if let Err(e) = &result {
                warn!(task_id = %id, error = %e, "could not save elapsed time");
            }
            (id, result)
        });
    }

    fn publish(&self) {
        let readings: HashMap<TaskId, u64> = self
            .counters
            .iter()
            .map(|(id, counter)| (id.clone(), counter.seconds))
            .collect();
        self.readings.send_replace(Arc::new(readings));
    }

    fn reap(&mut self) {
        while self.in_flight.try_join_next().is_some() {}
    }

    /// Count every period until cancelled, reconciling as snapshots arrive
    pub async fn run(mut self) {
        let mut reader = self.snapshot.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            ready = reader.ready() => {
                if ready.is_none() {
                    info!("no task snapshot, elapsed tracker not started");
                    return;
                }
            }
        }
        self.sync();

        info!(period_ms = self.period.as_millis() as u64, "elapsed tracker started");
        let mut ticks = ticker::interval(self.period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticks.tick() => {
                    self.reap();
                    self.tick();
                }
                changed = reader.changed() => {
                    if let None | Some(LoadState::Failed(_)) = changed {
                        info!("task list stopped updating");
                        break;
                    }
                    self.sync();
                }
            }
        }

        self.in_flight.shutdown().await;
        info!("elapsed tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewTask;
    use crate::store::memory::WriteOp;
    use crate::store::record::FIELD_TIME_SPENT;
    use crate::testing::{start, wait_for, Fixture};
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn tracker(fixture: &Fixture) -> ElapsedTracker {
        ElapsedTracker::new(
            fixture.adapter.clone(),
            fixture.reader.clone(),
            CancellationToken::new(),
        )
    }

    fn time_writes(fixture: &Fixture) -> Vec<Value> {
        fixture
            .store
            .writes()
            .into_iter()
            .filter_map(|op| match op {
                WriteOp::Merge(_, fields) => fields.get(FIELD_TIME_SPENT).cloned(),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_counts_only_open_tasks() {
        let mut fixture = Fixture::signed_in("alice").await;
        let open = fixture.adapter.create(&NewTask::new("Open", start())).await.unwrap();
        let done = fixture.adapter.create(&NewTask::new("Done", start())).await.unwrap();
        fixture.adapter.complete(&done).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.tasks.iter().any(|t| t.is_completed)).await;

        let mut tracker = tracker(&fixture);
        for _ in 0..3 {
            tracker.tick();
        }
        assert_eq!(tracker.elapsed(&open), Some(3));
        assert_eq!(tracker.elapsed(&done), Some(0));
        assert_eq!(tracker.readings().borrow().get(&open), Some(&3));
    }

    #[tokio::test]
    async fn test_seeds_from_persisted_time() {
        let mut fixture = Fixture::signed_in("alice").await;
        let id = fixture.adapter.create(&NewTask::new("Resumed", start())).await.unwrap();
        fixture
            .adapter
            .update(&id, TaskPatch::default().time_spent(100))
            .await
            .unwrap();
        wait_for(&mut fixture.reader, |s| {
            s.tasks.first().is_some_and(|t| t.time_spent == 100)
        })
        .await;

        let mut tracker = tracker(&fixture);
        tracker.tick();
        assert_eq!(tracker.elapsed(&id), Some(101));
    }

    #[tokio::test]
    async fn test_completion_stops_counting_and_saves_once() {
        let mut fixture = Fixture::signed_in("alice").await;
        let id = fixture.adapter.create(&NewTask::new("Work", start())).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.len() == 1).await;

        let mut tracker = tracker(&fixture);
        for _ in 0..5 {
            tracker.tick();
        }

        fixture.adapter.complete(&id).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.tasks.first().is_some_and(|t| t.is_completed)).await;
        tracker.tick();
        tracker.tick();
        assert_eq!(tracker.elapsed(&id), Some(5));

        tracker.settle().await;
        assert_eq!(time_writes(&fixture), vec![Value::from(5u64)]);

        // The saved value coming back does not trigger another write
        wait_for(&mut fixture.reader, |s| s.tasks.first().is_some_and(|t| t.time_spent == 5)).await;
        tracker.tick();
        tracker.settle().await;
        assert_eq!(time_writes(&fixture).len(), 1);
    }

    #[tokio::test]
    async fn test_reopened_task_resumes_without_replay() {
        let mut fixture = Fixture::signed_in("alice").await;
        let id = fixture.adapter.create(&NewTask::new("Again", start())).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.len() == 1).await;

        let mut tracker = tracker(&fixture);
        tracker.tick();
        tracker.tick();

        fixture.adapter.complete(&id).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.tasks.first().is_some_and(|t| t.is_completed)).await;
        for _ in 0..10 {
            tracker.tick();
        }

        fixture
            .adapter
            .update(&id, TaskPatch::completed(false))
            .await
            .unwrap();
        wait_for(&mut fixture.reader, |s| s.tasks.first().is_some_and(|t| !t.is_completed)).await;
        tracker.tick();
        assert_eq!(tracker.elapsed(&id), Some(3));
    }

    #[tokio::test]
    async fn test_completed_without_ticks_writes_nothing() {
        let mut fixture = Fixture::signed_in("alice").await;
        let id = fixture.adapter.create(&NewTask::new("Quick", start())).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.len() == 1).await;

        let mut tracker = tracker(&fixture);
        tracker.sync();
        fixture.adapter.complete(&id).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.tasks.first().is_some_and(|t| t.is_completed)).await;
        tracker.sync();
        tracker.settle().await;
        assert!(time_writes(&fixture).is_empty());
    }

    #[tokio::test]
    async fn test_deleted_tasks_are_forgotten() {
        let mut fixture = Fixture::signed_in("alice").await;
        let id = fixture.adapter.create(&NewTask::new("Gone", start())).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.len() == 1).await;

        let mut tracker = tracker(&fixture);
        tracker.tick();
        fixture.adapter.remove(&id).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.is_empty()).await;
        tracker.tick();

        assert_eq!(tracker.elapsed(&id), None);
        assert!(tracker.readings().borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_every_period() {
        let mut fixture = Fixture::signed_in("alice").await;
        let id = fixture.adapter.create(&NewTask::new("Timed", start())).await.unwrap();
        wait_for(&mut fixture.reader, |s| s.len() == 1).await;

        let cancel = CancellationToken::new();
        let tracker = ElapsedTracker::new(fixture.adapter.clone(), fixture.reader.clone(), cancel.clone());
        let readings = tracker.readings();
        let handle = tokio::spawn(tracker.run());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(readings.borrow().get(&id), Some(&3));

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(readings.borrow().get(&id), Some(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_counting_when_task_list_fails() {
        let fixture = Fixture::signed_in("alice").await;
        let mut cache = crate::observable::SnapshotCache::new();
        let id = TaskId::new("t1");
        let task = crate::domain::Task {
            id: id.clone(),
            title: "Open".to_string(),
            image_url: None,
            start_date: start(),
            end_date: None,
            is_completed: false,
            time_spent: 0,
            created_at: start(),
            updated_at: start(),
            owner_id: crate::domain::OwnerId::new("alice"),
        };
        cache.install(vec![task], start());

        let tracker = ElapsedTracker::new(fixture.adapter.clone(), cache.reader(), CancellationToken::new());
        let readings = tracker.readings();
        let handle = tokio::spawn(tracker.run());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(readings.borrow().get(&id), Some(&2));

        cache.fail("task feed closed by store");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(readings.borrow().get(&id), Some(&2));
    }
}
