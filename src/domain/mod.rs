pub mod elapsed;
pub mod task;
pub mod views;

pub use elapsed::{format_elapsed, ElapsedCounter};
pub use task::{FieldUpdate, NewTask, OwnerId, Task, TaskId, TaskPatch, TimeLimit};
pub use views::{count_tasks, remaining, sort_newest_first, status_badge, Remaining, TaskCounts, TaskRow, TaskView};
