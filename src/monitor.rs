use crate::clock::Clock;
use crate::domain::{Task, TaskId};
use crate::error::Result;
use crate::observable::{LoadState, SnapshotReader};
use crate::store::TaskStoreAdapter;
use crate::ticker;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ids of open tasks whose deadline is at or before `now`
pub fn expired_tasks(tasks: &[Task], now: DateTime<Utc>) -> Vec<TaskId> {
    tasks
        .iter()
        .filter(|task| task.is_expired_at(now))
        .map(|task| task.id.clone())
        .collect()
}

/// Completes open tasks once their deadline passes.
///
/// Each tick looks at the installed snapshot only. A failed request is
/// logged and the task is tried again on the next tick while it stays expired.
pub struct DeadlineMonitor {
    adapter: TaskStoreAdapter,
    snapshot: SnapshotReader,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    period: Duration,
    in_flight: JoinSet<(TaskId, Result<()>)>,
    /// Tasks with a completion request still outstanding
    pending: HashSet<TaskId>,
}

impl DeadlineMonitor {
    pub fn new(
        adapter: TaskStoreAdapter,
        snapshot: SnapshotReader,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            adapter,
            snapshot,
            clock,
            cancel,
            period: ticker::tick_duration(),
            in_flight: JoinSet::new(),
            pending: HashSet::new(),
        }
    }

    /// Override the tick period
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// One tick: request completion of every expired task in the current
    /// snapshot. Returns the ids a request was issued for.
    pub fn sweep(&mut self) -> Vec<TaskId> {
        self.reap();
        let Some(snapshot) = self.snapshot.latest() else {
            return Vec::new();
        };

        let now = self.clock.now();
        let mut requested = Vec::new();
        for id in expired_tasks(&snapshot.tasks, now) {
            if !self.pending.insert(id.clone()) {
                continue;
            }
            let adapter = self.adapter.clone();
            let task_id = id.clone();
            self.in_flight.spawn(async move {
                let result = adapter.complete(&task_id).await;
                (task_id, result)
            });
            requested.push(id);
        }
        requested
    }

    /// Wait for every outstanding request to finish
    pub async fn settle(&mut self) {
        while let Some(outcome) = self.in_flight.join_next().await {
            self.record(outcome);
        }
    }

    fn reap(&mut self) {
        while let Some(outcome) = self.in_flight.try_join_next() {
            self.record(outcome);
        }
    }

    fn record(&mut self, outcome: std::result::Result<(TaskId, Result<()>), JoinError>) {
        match outcome {
            Ok((id, Ok(()))) => {
                debug!(task_id = %id, "expired task completed");
                self.pending.remove(&id);
            }
            Ok((id, Err(e))) => {
                warn!(task_id = %id, error = %e, "could not complete expired task, retrying next tick");
                self.pending.remove(&id);
            }
            Err(e) => {
                warn!(error = %e, "completion request aborted");
                // Without the id, let every task be retried
                if self.in_flight.is_empty() {
                    self.pending.clear();
                }
            }
        }
    }

    /// Sweep every period until cancelled. Does nothing until the first
    /// snapshot is installed, and exits once the task list fails.
    pub async fn run(mut self) {
        let mut reader = self.snapshot.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            ready = reader.ready() => {
                if ready.is_none() {
                    info!("no task snapshot, deadline monitor not started");
                    return;
                }
            }
        }

        info!(period_ms = self.period.as_millis() as u64, "deadline monitor started");
        let mut ticks = ticker::interval(self.period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                state = reader.changed() => {
                    if let None | Some(LoadState::Failed(_)) = state {
                        info!("task list stopped updating");
                        break;
                    }
                }
                _ = ticks.tick() => {
                    let requested = self.sweep();
                    if !requested.is_empty() {
                        debug!(count = requested.len(), "requested completion of expired tasks");
                    }
                }
            }
        }

        self.in_flight.shutdown().await;
        info!("deadline monitor stopped");
    }
}
