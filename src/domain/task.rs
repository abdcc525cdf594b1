use crate::error::{Result, TaskError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default time limit for new tasks, in minutes
pub const DEFAULT_TIME_LIMIT_MINUTES: u32 = 30;
/// Smallest time limit the creation form allows
pub const MIN_TIME_LIMIT_MINUTES: u32 = 5;
/// Increment used when adjusting a time limit
pub const TIME_LIMIT_STEP_MINUTES: u32 = 5;

/// Store-assigned task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the user a task belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A task as seen by everything above the store adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    /// Trimmed, non-empty title
    pub title: String,
    /// Download URL of an attached image
    pub image_url: Option<String>,
    /// When the task becomes active
    pub start_date: DateTime<Utc>,
    /// Deadline; `None` means the task never expires
    pub end_date: Option<DateTime<Utc>>,
    pub is_completed: bool,
    /// Persisted seconds spent while active
    pub time_spent: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner_id: OwnerId,
}

impl Task {
    /// Whether the deadline has passed while the task is still open.
    /// A deadline equal to `now` counts as passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed && self.end_date.is_some_and(|end| now >= end)
    }

    /// Time left until the deadline (negative once passed)
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.end_date.map(|end| end.signed_duration_since(now))
    }

    pub fn has_deadline(&self) -> bool {
        self.end_date.is_some()
    }
}

/// Time limit picked on the creation form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimit {
    minutes: u32,
    min_minutes: u32,
    step_minutes: u32,
}

impl Default for TimeLimit {
    fn default() -> Self {
        Self {
            minutes: DEFAULT_TIME_LIMIT_MINUTES,
            min_minutes: MIN_TIME_LIMIT_MINUTES,
            step_minutes: TIME_LIMIT_STEP_MINUTES,
        }
    }
}

impl TimeLimit {
    /// Create a limit with the default bounds, clamped to the minimum
    pub fn minutes(minutes: u32) -> Self {
        Self::default().with_minutes(minutes)
    }

    /// Create a limit with custom bounds (from config)
    pub fn with_bounds(minutes: u32, min_minutes: u32, step_minutes: u32) -> Self {
        Self {
            minutes: minutes.max(min_minutes),
            min_minutes,
            step_minutes: step_minutes.max(1),
        }
    }

    pub fn with_minutes(mut self, minutes: u32) -> Self {
        self.minutes = minutes.max(self.min_minutes);
        self
    }

    pub fn as_minutes(&self) -> u32 {
        self.minutes
    }

    /// One step longer
    pub fn increase(&mut self) {
        self.minutes = self.minutes.saturating_add(self.step_minutes);
    }

    /// One step shorter, never below the minimum
    pub fn decrease(&mut self) {
        self.minutes = self
            .minutes
            .saturating_sub(self.step_minutes)
            .max(self.min_minutes);
    }

    pub fn as_duration(&self) -> Duration {
        Duration::minutes(i64::from(self.minutes))
    }

    /// Deadline for a task starting at `start`
    pub fn deadline_from(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + self.as_duration()
    }
}

/// User input for a new task. The store assigns id, owner and timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

impl NewTask {
    /// Task without a deadline
    pub fn new(title: impl Into<String>, start_date: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            start_date: Some(start_date),
            ..Self::default()
        }
    }

    /// Task whose deadline is `start_date + limit`
    pub fn with_time_limit(
        title: impl Into<String>,
        start_date: DateTime<Utc>,
        limit: TimeLimit,
    ) -> Self {
        Self {
            end_date: Some(limit.deadline_from(start_date)),
            ..Self::new(title, start_date)
        }
    }

    pub fn deadline(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Check the input and normalize it for persistence
    pub(crate) fn validate(&self) -> Result<ValidNewTask> {
        let title = validate_title(&self.title)?;
        let start_date = self
            .start_date
            .ok_or_else(|| TaskError::Validation("start date is required".to_string()))?;

        Ok(ValidNewTask {
            title,
            start_date,
            end_date: self.end_date,
            image_url: self.image_url.clone().filter(|url| !url.trim().is_empty()),
        })
    }
}

/// A [`NewTask`] that passed validation
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValidNewTask {
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
}

fn validate_title(title: &str) -> Result<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(TaskError::Validation("title is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Change to an optional field: leave it, clear it, or set it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FieldUpdate<T> {
    #[default]
    Unchanged,
    Clear,
    Set(T),
}

impl<T> FieldUpdate<T> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

/// Partial update of a task. Fields left at their default are not modified.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub image_url: FieldUpdate<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: FieldUpdate<DateTime<Utc>>,
    pub is_completed: Option<bool>,
    pub time_spent: Option<u64>,
}

impl TaskPatch {
    /// Mark complete or reopen
    pub fn completed(done: bool) -> Self {
        Self {
            is_completed: Some(done),
            ..Self::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn deadline(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = FieldUpdate::Set(end_date);
        self
    }

    pub fn clear_deadline(mut self) -> Self {
        self.end_date = FieldUpdate::Clear;
        self
    }

    pub fn image(mut self, url: impl Into<String>) -> Self {
        self.image_url = FieldUpdate::Set(url.into());
        self
    }

    pub fn time_spent(mut self, seconds: u64) -> Self {
        self.time_spent = Some(seconds);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.image_url.is_unchanged()
            && self.start_date.is_none()
            && self.end_date.is_unchanged()
            && self.is_completed.is_none()
            && self.time_spent.is_none()
    }

    /// Reject patches that would leave the task invalid
    pub(crate) fn validate(mut self) -> Result<Self> {
        if let Some(title) = self.title.take() {
            self.title = Some(validate_title(&title)?);
        }
        Ok(self)
    }
}
