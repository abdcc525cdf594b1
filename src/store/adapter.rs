use super::blob::BlobStore;
use super::record::{
    Document, Fields, StoreTimestamp, FIELD_END_DATE, FIELD_IMAGE_URL, FIELD_IS_COMPLETED,
    FIELD_OWNER_ID, FIELD_START_DATE, FIELD_TIME_SPENT, FIELD_TITLE, FIELD_CREATED_AT,
    FIELD_UPDATED_AT,
};
use super::DocumentStore;
use crate::clock::{Clock, SystemClock};
use crate::domain::task::ValidNewTask;
use crate::domain::{FieldUpdate, NewTask, OwnerId, Task, TaskId, TaskPatch};
use crate::error::{Result, TaskError};
use crate::session::SessionContext;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SnapshotCallback = Box<dyn FnMut(Vec<Task>) + Send>;
type ClosedCallback = Box<dyn FnOnce(String) + Send>;

struct Callbacks {
    on_snapshot: SnapshotCallback,
    on_closed: Option<ClosedCallback>,
}

/// Handle to a live task query.
///
/// Unsubscribing (or dropping the handle) detaches the listener. Once
/// [`unsubscribe`](Self::unsubscribe) returns, the callback is never invoked
/// again.
#[must_use = "dropping a Subscription detaches the listener"]
pub struct Subscription {
    inner: Option<ActiveSubscription>,
}

struct ActiveSubscription {
    cancel: CancellationToken,
    callback: Arc<Mutex<Option<Callbacks>>>,
    _task: JoinHandle<()>,
}

impl Subscription {
    /// Handle that was never attached to anything
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Whether snapshots can still arrive
    pub fn is_active(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|active| !active.cancel.is_cancelled())
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(active) = self.inner.take() {
            active.cancel.cancel();
            // Waits for an in-progress callback, then disarms it
            active
                .callback
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Task operations scoped to one session.
///
/// Owns the stored layout: loose documents become [`Task`] values (unreadable
/// ones are skipped), inputs and patches become field maps, and
/// [`StoreTimestamp`] is converted to and from `DateTime<Utc>` here only.
#[derive(Clone)]
pub struct TaskStoreAdapter {
    store: Arc<dyn DocumentStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    session: SessionContext,
    clock: Arc<dyn Clock>,
}

impl TaskStoreAdapter {
    pub fn new(store: Arc<dyn DocumentStore>, session: SessionContext) -> Self {
        Self {
            store,
            blobs: None,
            session,
            clock: Arc::new(SystemClock),
        }
    }

    /// Enable image uploads
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Clock used when a stored record lacks a timestamp
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Follow the signed-in user's tasks.
    ///
    /// `on_snapshot` receives the full task set right away and again after
    /// every change. Without a signed-in user this returns a no-op handle and
    /// the callback never runs. Fails only if the store rejects the query.
    pub async fn subscribe<F>(&self, on_snapshot: F) -> Result<Subscription>
    where
        F: FnMut(Vec<Task>) + Send + 'static,
    {
        self.subscribe_until_closed(on_snapshot, |_| {}).await
    }

    /// Like [`subscribe`](Self::subscribe), and `on_closed` runs once if the
    /// store ends the query on its own. Neither callback runs after
    /// unsubscribing.
    pub async fn subscribe_until_closed<F, C>(
        &self,
        on_snapshot: F,
        on_closed: C,
    ) -> Result<Subscription>
    where
        F: FnMut(Vec<Task>) + Send + 'static,
        C: FnOnce(String) + Send + 'static,
    {
        let Some(owner) = self.session.owner().cloned() else {
            debug!("no signed-in user, not subscribing");
            return Ok(Subscription::noop());
        };

        let mut feed = self.store.listen(&owner).await.map_err(|e| {
            warn!(owner = %owner, error = %e, "could not subscribe to tasks");
            e
        })?;

        let cancel = CancellationToken::new();
        let callback = Arc::new(Mutex::new(Some(Callbacks {
            on_snapshot: Box::new(on_snapshot),
            on_closed: Some(Box::new(on_closed)),
        })));

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let callback = Arc::clone(&callback);
            let clock = Arc::clone(&self.clock);
            let owner = owner.clone();
            async move {
                loop {
                    let docs = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        docs = feed.recv() => docs,
                    };
                    let mut slot = callback.lock().unwrap_or_else(|e| e.into_inner());
                    let Some(callbacks) = slot.as_mut() else {
                        break;
                    };
                    match docs {
                        Some(docs) => {
                            let tasks = normalize_snapshot(docs, &owner, clock.now());
                            (callbacks.on_snapshot)(tasks);
                        }
                        None => {
                            warn!(owner = %owner, "task feed closed by store");
                            if let Some(on_closed) = callbacks.on_closed.take() {
                                on_closed("task feed closed by store".to_string());
                            }
                            break;
                        }
                    }
                }
                cancel.cancel();
                debug!(owner = %owner, "task subscription ended");
            }
        });

        info!(owner = %owner, "subscribed to tasks");
        Ok(Subscription {
            inner: Some(ActiveSubscription {
                cancel,
                callback,
                _task: task,
            }),
        })
    }

    /// Persist a new task for the signed-in user and return its id
    pub async fn create(&self, input: &NewTask) -> Result<TaskId> {
        let owner = self.session.require_owner()?;
        let valid = input.validate()?;

        let id = self
            .store
            .insert(new_task_fields(&valid, owner))
            .await
            .map_err(|e| {
                warn!(owner = %owner, error = %e, "could not create task");
                e
            })?;

        info!(task_id = %id, owner = %owner, "created task");
        Ok(TaskId::new(id))
    }

    /// Merge `patch` into a stored task
    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<()> {
        let owner = self.session.require_owner()?;
        let patch = patch.validate()?;
        if patch.is_empty() {
            debug!(task_id = %id, "empty patch, nothing to write");
            return Ok(());
        }

        self.store
            .merge(owner, id.as_str(), patch_fields(patch))
            .await
            .map_err(|e| {
                warn!(task_id = %id, error = %e, "could not update task");
                e
            })?;
        debug!(task_id = %id, "updated task");
        Ok(())
    }

    /// Mark a task completed
    pub async fn complete(&self, id: &TaskId) -> Result<()> {
        self.update(id, TaskPatch::completed(true)).await
    }

    /// Delete a task
    pub async fn remove(&self, id: &TaskId) -> Result<()> {
        let owner = self.session.require_owner()?;
        self.store.delete(owner, id.as_str()).await.map_err(|e| {
            warn!(task_id = %id, error = %e, "could not delete task");
            e
        })?;
        info!(task_id = %id, "deleted task");
        Ok(())
    }

    /// Upload an image and store its URL on the task
    pub async fn attach_image(&self, id: &TaskId, local: &Path) -> Result<String> {
        self.session.require_owner()?;
        let blobs = self
            .blobs
            .as_ref()
            .ok_or_else(|| TaskError::Store("no blob storage configured".to_string()))?;

        let url = blobs.upload(local).await?;
        self.update(id, TaskPatch::default().image(url.clone())).await?;
        Ok(url)
    }
}

fn to_native(at: DateTime<Utc>) -> StoreTimestamp {
    StoreTimestamp::new(at.timestamp(), at.timestamp_subsec_nanos())
}

fn from_native(ts: StoreTimestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos).single()
}

fn timestamp_value(at: DateTime<Utc>) -> Value {
    to_native(at).to_value()
}

fn new_task_fields(task: &ValidNewTask, owner: &OwnerId) -> Fields {
    let mut fields = Fields::new();
    fields.insert(FIELD_TITLE.to_string(), Value::from(task.title.clone()));
    fields.insert(
        FIELD_IMAGE_URL.to_string(),
        task.image_url.clone().map(Value::from).unwrap_or(Value::Null),
    );
    fields.insert(FIELD_START_DATE.to_string(), timestamp_value(task.start_date));
    fields.insert(
        FIELD_END_DATE.to_string(),
        task.end_date.map(timestamp_value).unwrap_or(Value::Null),
    );
    fields.insert(FIELD_IS_COMPLETED.to_string(), Value::Bool(false));
    fields.insert(FIELD_TIME_SPENT.to_string(), Value::from(0u64));
    fields.insert(FIELD_OWNER_ID.to_string(), Value::from(owner.as_str()));
    fields
}

fn patch_fields(patch: TaskPatch) -> Fields {
    let mut fields = Fields::new();
    if let Some(title) = patch.title {
        fields.insert(FIELD_TITLE.to_string(), Value::from(title));
    }
    match patch.image_url {
        FieldUpdate::Unchanged => {}
        FieldUpdate::Clear => {
            fields.insert(FIELD_IMAGE_URL.to_string(), Value::Null);
        }
        FieldUpdate::Set(url) => {
            fields.insert(FIELD_IMAGE_URL.to_string(), Value::from(url));
        }
    }
    if let Some(start) = patch.start_date {
        fields.insert(FIELD_START_DATE.to_string(), timestamp_value(start));
    }
    match patch.end_date {
        FieldUpdate::Unchanged => {}
        FieldUpdate::Clear => {
            fields.insert(FIELD_END_DATE.to_string(), Value::Null);
        }
        FieldUpdate::Set(end) => {
            fields.insert(FIELD_END_DATE.to_string(), timestamp_value(end));
        }
    }
    if let Some(done) = patch.is_completed {
        fields.insert(FIELD_IS_COMPLETED.to_string(), Value::Bool(done));
    }
    if let Some(seconds) = patch.time_spent {
        fields.insert(FIELD_TIME_SPENT.to_string(), Value::from(seconds));
    }
    fields
}

/// Turn one result set into tasks, dropping unreadable or foreign documents
fn normalize_snapshot(docs: Vec<Document>, owner: &OwnerId, now: DateTime<Utc>) -> Vec<Task> {
    docs.iter()
        .filter_map(|doc| match normalize_document(doc, now) {
            Ok(task) if task.owner_id == *owner => Some(task),
            Ok(task) => {
                warn!(task_id = %task.id, owner = %task.owner_id, "dropping task of another owner");
                None
            }
            Err(reason) => {
                warn!(doc_id = %doc.id, reason = %reason, "skipping unreadable task document");
                None
            }
        })
        .collect()
}

fn normalize_document(doc: &Document, now: DateTime<Utc>) -> std::result::Result<Task, String> {
    let fields = &doc.fields;

    let title = fields
        .get(FIELD_TITLE)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "missing title".to_string())?;
    let owner = fields
        .get(FIELD_OWNER_ID)
        .and_then(Value::as_str)
        .ok_or_else(|| "missing owner".to_string())?;

    let image_url = fields
        .get(FIELD_IMAGE_URL)
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string);
    let time_spent = fields
        .get(FIELD_TIME_SPENT)
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|s| *s >= 0.0).map(|s| s as u64))
        })
        .unwrap_or(0);

    Ok(Task {
        id: TaskId::new(doc.id.clone()),
        title: title.to_string(),
        image_url,
        start_date: read_timestamp(fields, FIELD_START_DATE)?.unwrap_or(now),
        end_date: read_timestamp(fields, FIELD_END_DATE)?,
        is_completed: fields
            .get(FIELD_IS_COMPLETED)
            .and_then(Value::as_bool)
            .unwrap_or(false),
        time_spent,
        created_at: read_timestamp(fields, FIELD_CREATED_AT)?.unwrap_or(now),
        updated_at: read_timestamp(fields, FIELD_UPDATED_AT)?.unwrap_or(now),
        owner_id: OwnerId::new(owner),
    })
}

/// Absent or null reads as `None`; anything else must be a valid timestamp
fn read_timestamp(fields: &Fields, key: &str) -> std::result::Result<Option<DateTime<Utc>>, String> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => StoreTimestamp::from_value(value)
            .and_then(from_native)
            .map(Some)
            .ok_or_else(|| format!("malformed {}", key)),
    }
}
