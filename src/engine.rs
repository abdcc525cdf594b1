use crate::clock::Clock;
use crate::domain::{NewTask, TaskId, TaskPatch, TaskView};
use crate::error::{Result, TaskError};
use crate::monitor::DeadlineMonitor;
use crate::observable::{LoadState, SnapshotCache, SnapshotReader};
use crate::persistence::Config;
use crate::session::{SessionContext, User};
use crate::store::{BlobStore, DocumentStore, Subscription, TaskStoreAdapter};
use crate::ticker;
use crate::tracker::{ElapsedReadings, ElapsedTracker};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Tick periods for the per-session timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub monitor_period: Duration,
    pub tracker_period: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            monitor_period: ticker::tick_duration(),
            tracker_period: ticker::tick_duration(),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            monitor_period: config.monitor_period(),
            tracker_period: config.tracker_period(),
        }
    }
}

/// Everything that lives for one signed-in user: one task subscription
/// feeding a snapshot cache, plus the deadline monitor and the elapsed
/// tracker reading from it.
pub struct SessionRuntime {
    user: User,
    adapter: TaskStoreAdapter,
    clock: Arc<dyn Clock>,
    reader: SnapshotReader,
    readings: watch::Receiver<ElapsedReadings>,
    subscription: Option<Subscription>,
    cancel: CancellationToken,
    timers: Vec<JoinHandle<()>>,
}

impl SessionRuntime {
    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn adapter(&self) -> &TaskStoreAdapter {
        &self.adapter
    }

    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    pub fn readings(&self) -> watch::Receiver<ElapsedReadings> {
        self.readings.clone()
    }

    pub fn state(&self) -> LoadState {
        self.reader.state()
    }

    /// Wait for the first snapshot; `false` if loading failed
    pub async fn loaded(&self) -> bool {
        self.reader.clone().ready().await.is_some()
    }

    /// Aggregate view at the current time, `None` until loaded
    pub fn view(&self) -> Option<TaskView> {
        self.view_at(self.clock.now())
    }

    pub fn view_at(&self, now: DateTime<Utc>) -> Option<TaskView> {
        let snapshot = self.reader.latest()?;
        let readings = Arc::clone(&self.readings.borrow());
        Some(TaskView::build(&snapshot.tasks, now, &readings))
    }

    pub async fn create(&self, input: &NewTask) -> Result<TaskId> {
        self.adapter.create(input).await
    }

    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<()> {
        self.adapter.update(id, patch).await
    }

    pub async fn remove(&self, id: &TaskId) -> Result<()> {
        self.adapter.remove(id).await
    }

    pub async fn attach_image(&self, id: &TaskId, local: &Path) -> Result<String> {
        self.adapter.attach_image(id, local).await
    }

    /// Flip completion of a task in the current snapshot. Completing also
    /// saves the elapsed seconds counted so far. Returns the new state.
    pub async fn toggle(&self, id: &TaskId) -> Result<bool> {
        let snapshot = self
            .reader
            .latest()
            .ok_or_else(|| TaskError::NotFound(format!("task {} (tasks not loaded)", id)))?;
        let task = snapshot
            .tasks
            .iter()
            .find(|task| task.id == *id)
            .ok_or_else(|| TaskError::NotFound(format!("task {}", id)))?;

        let patch = if task.is_completed {
            TaskPatch::completed(false)
        } else {
            let counted = self.readings.borrow().get(id).copied().unwrap_or(0);
            TaskPatch::completed(true).time_spent(counted.max(task.time_spent))
        };
        let done = !task.is_completed;
        self.adapter.update(id, patch).await?;
        info!(task_id = %id, completed = done, "toggled task");
        Ok(done)
    }

    /// Stop the subscription and both timers
    pub async fn shutdown(mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.cancel.cancel();
        for timer in self.timers.drain(..) {
            if let Err(e) = timer.await {
                error!(error = %e, "session timer panicked");
            }
        }
        info!(user = %self.user.uid, "session stopped");
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts and stops [`SessionRuntime`]s as users sign in and out
pub struct TaskEngine {
    store: Arc<dyn DocumentStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    cancel: CancellationToken,
    current: Option<SessionRuntime>,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            blobs: None,
            clock,
            options: EngineOptions::default(),
            cancel: CancellationToken::new(),
            current: None,
        }
    }

    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Token that stops [`run`](Self::run) and every session under it
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The running session, if someone is signed in
    pub fn session(&self) -> Option<&SessionRuntime> {
        self.current.as_ref()
    }

    /// Start a runtime for `user`.
    ///
    /// If the store rejects the subscription the runtime still comes up, in
    /// the [`LoadState::Failed`] state and without timers. A feed the store
    /// closes later moves it to that state too, and both timers stop.
    pub async fn start_session(&self, user: User) -> SessionRuntime {
        let mut adapter = TaskStoreAdapter::new(
            Arc::clone(&self.store),
            SessionContext::signed_in(user.clone()),
        )
        .with_clock(Arc::clone(&self.clock));
        if let Some(blobs) = &self.blobs {
            adapter = adapter.with_blobs(Arc::clone(blobs));
        }

        let cache = Arc::new(Mutex::new(SnapshotCache::new()));
        let reader = cache.lock().unwrap_or_else(|e| e.into_inner()).reader();
        let cancel = self.cancel.child_token();

        let writer = Arc::clone(&cache);
        let closer = Arc::clone(&cache);
        let clock = Arc::clone(&self.clock);
        let subscription = adapter
            .subscribe_until_closed(
                move |tasks| {
                    writer
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .install(tasks, clock.now());
                },
                move |reason| {
                    closer.lock().unwrap_or_else(|e| e.into_inner()).fail(reason);
                },
            )
            .await;

        let (subscription, timers, readings) = match subscription {
            Ok(subscription) => {
                let monitor = DeadlineMonitor::new(
                    adapter.clone(),
                    reader.clone(),
                    Arc::clone(&self.clock),
                    cancel.child_token(),
                )
                .with_period(self.options.monitor_period);
                let tracker = ElapsedTracker::new(adapter.clone(), reader.clone(), cancel.child_token())
                    .with_period(self.options.tracker_period);
                let readings = tracker.readings();

                let timers = vec![tokio::spawn(monitor.run()), tokio::spawn(tracker.run())];
                (Some(subscription), timers, readings)
            }
            Err(e) => {
                warn!(user = %user.uid, error = %e, "failed to load tasks");
                cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .fail(e.to_string());
                let (_tx, readings) = watch::channel(ElapsedReadings::default());
                (None, Vec::new(), readings)
            }
        };

        info!(user = %user.uid, "session started");
        SessionRuntime {
            user,
            adapter,
            clock: Arc::clone(&self.clock),
            reader,
            readings,
            subscription,
            cancel,
            timers,
        }
    }

    /// Move to `user`: stop the current session unless it already belongs to
    /// them, then start one if someone is signed in
    pub async fn switch_user(&mut self, user: Option<User>) {
        let unchanged = match (&self.current, &user) {
            (Some(session), Some(user)) => session.user().uid == user.uid,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(session) = self.current.take() {
            session.shutdown().await;
        }
        if let Some(user) = user {
            self.current = Some(self.start_session(user).await);
        }
    }

    /// Follow `auth` until cancelled or the signal goes away.
    ///
    /// `on_update` runs after every auth change, snapshot install and
    /// elapsed-time tick, with the session current at that moment.
    pub async fn run<F>(mut self, mut auth: watch::Receiver<Option<User>>, mut on_update: F)
    where
        F: FnMut(Option<&SessionRuntime>),
    {
        let initial = auth.borrow_and_update().clone();
        self.switch_user(initial).await;
        on_update(self.session());

        let mut watched = Watched::of(self.session());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = auth.changed() => {
                    if changed.is_err() {
                        info!("auth signal closed");
                        break;
                    }
                    let user = auth.borrow_and_update().clone();
                    self.switch_user(user).await;
                    watched = Watched::of(self.session());
                }
                state = next_state(&mut watched.reader) => {
                    if state.is_none() {
                        watched.reader = None;
                    }
                }
                reading = next_reading(&mut watched.readings) => {
                    if reading.is_none() {
                        watched.readings = None;
                    }
                }
            }
            on_update(self.session());
        }

        self.shutdown().await;
    }

    /// Stop the current session, if any
    pub async fn shutdown(&mut self) {
        if let Some(session) = self.current.take() {
            session.shutdown().await;
        }
    }
}

/// Change feeds of the current session
struct Watched {
    reader: Option<SnapshotReader>,
    readings: Option<watch::Receiver<ElapsedReadings>>,
}

impl Watched {
    fn of(session: Option<&SessionRuntime>) -> Self {
        let Some(session) = session else {
            return Self {
                reader: None,
                readings: None,
            };
        };
        let mut reader = session.reader();
        reader.mark_seen();
        let mut readings = session.readings();
        readings.borrow_and_update();
        Self {
            reader: Some(reader),
            readings: Some(readings),
        }
    }
}

async fn next_state(reader: &mut Option<SnapshotReader>) -> Option<LoadState> {
    match reader {
        Some(reader) => reader.changed().await,
        None => std::future::pending().await,
    }
}

async fn next_reading(readings: &mut Option<watch::Receiver<ElapsedReadings>>) -> Option<()> {
    match readings {
        Some(readings) => readings.changed().await.ok(),
        None => std::future::pending().await,
    }
}
