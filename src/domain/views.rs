use super::elapsed::format_elapsed;
use super::task::{Task, TaskId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::fmt;

/// Text shown once a deadline has passed
pub const EXPIRED_TEXT: &str = "Time's up!";

/// Time left until a task's deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remaining {
    /// Deadline reached or passed
    Expired,
    /// Strictly positive time left
    Left(Duration),
}

impl fmt::Display for Remaining {
    /// "M:SS", or the expired text
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Expired => f.write_str(EXPIRED_TEXT),
            Remaining::Left(left) => {
                let total_ms = left.num_milliseconds();
                let minutes = total_ms / 60_000;
                let seconds = (total_ms % 60_000) / 1000;
                write!(f, "{}:{:02}", minutes, seconds)
            }
        }
    }
}

/// Remaining time for a task; `None` when it has no deadline
pub fn remaining(task: &Task, now: DateTime<Utc>) -> Option<Remaining> {
    task.remaining_at(now).map(|left| {
        if left <= Duration::zero() {
            Remaining::Expired
        } else {
            Remaining::Left(left)
        }
    })
}

/// Active/completed totals for a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskCounts {
    pub active: usize,
    pub completed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.active + self.completed
    }
}

/// Count open and completed tasks
pub fn count_tasks(tasks: &[Task]) -> TaskCounts {
    let completed = tasks.iter().filter(|t| t.is_completed).count();
    TaskCounts {
        active: tasks.len() - completed,
        completed,
    }
}

/// Sort newest first by creation time. Stable for equal timestamps.
pub fn sort_newest_first(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Get status badge text
pub fn status_badge(task: &Task) -> &'static str {
    if task.is_completed {
        "✓ DONE"
    } else {
        "⏱ ACTIVE"
    }
}

/// One display row of the task list
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    pub task: Task,
    pub remaining: Option<Remaining>,
    /// Displayed seconds spent (tracker value, or the persisted one)
    pub elapsed_seconds: u64,
}

impl TaskRow {
    pub fn elapsed_formatted(&self) -> String {
        format_elapsed(self.elapsed_seconds)
    }

    pub fn remaining_formatted(&self) -> Option<String> {
        self.remaining.map(|r| r.to_string())
    }
}

/// Everything the task screen shows, derived from one snapshot at one instant
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskView {
    pub counts: TaskCounts,
    pub rows: Vec<TaskRow>,
}

impl TaskView {
    /// Derive the view. `elapsed` holds live tracker readings by task id.
    pub fn build(tasks: &[Task], now: DateTime<Utc>, elapsed: &HashMap<TaskId, u64>) -> Self {
        let mut ordered = tasks.to_vec();
        sort_newest_first(&mut ordered);

        let rows = ordered
            .into_iter()
            .map(|task| {
                let elapsed_seconds = elapsed
                    .get(&task.id)
                    .copied()
                    .unwrap_or(task.time_spent)
                    .max(task.time_spent);
                TaskRow {
                    remaining: remaining(&task, now),
                    elapsed_seconds,
                    task,
                }
            })
            .collect();

        Self {
            counts: count_tasks(tasks),
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
