mod scheduler;
mod task;

pub use scheduler::{Scheduler, SchedulerError, delay_from_secs};
pub use task::{TaskFailure, TaskId, TaskInfo, TaskResult};
