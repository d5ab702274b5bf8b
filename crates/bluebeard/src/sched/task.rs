use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::callback::RegistrationFlag;

pub type TaskResult = anyhow::Result<()>;

pub(crate) type PeriodicFn = Rc<RefCell<dyn FnMut(Duration) -> TaskResult>>;
pub(crate) type OneShotFn = Box<dyn FnOnce(Box<dyn Any>) -> TaskResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum TaskKind {
    Periodic {
        period: Duration,
        callback: PeriodicFn,
    },
    OneShot {
        user_data: Box<dyn Any>,
        callback: OneShotFn,
    },
    PerFrame {
        callback: PeriodicFn,
    },
}

impl TaskKind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            TaskKind::Periodic { .. } => "periodic",
            TaskKind::OneShot { .. } => "event",
            TaskKind::PerFrame { .. } => "frame",
        }
    }
}

pub(crate) struct Task {
    pub name: Rc<str>,
    pub deadline: Duration,
    /// Tick generation the current deadline was set in. A deadline set while
    /// a tick is running waits for the next tick even if already reached.
    pub armed_in: u64,
    pub flag: RegistrationFlag,
    pub kind: TaskKind,
}

impl Task {
    pub(crate) fn key(&self, id: TaskId) -> ScheduleKey {
        ScheduleKey {
            deadline: self.deadline,
            name: Rc::clone(&self.name),
            id,
        }
    }
}

/// Position of a timed task in the run queue: earliest deadline first, equal
/// deadlines by descending name, then by id.
#[derive(Debug, Clone)]
pub(crate) struct ScheduleKey {
    pub deadline: Duration,
    pub name: Rc<str>,
    pub id: TaskId,
}

impl PartialEq for ScheduleKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduleKey {}

impl PartialOrd for ScheduleKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduleKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| other.name.cmp(&self.name))
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub id: Option<TaskId>,
    pub name: String,
    pub kind: &'static str,
    pub period: Option<Duration>,
    pub remaining: Duration,
}

impl fmt::Display for TaskInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{:>6} ", id.to_string())?,
            None => write!(f, "<defunct> ")?,
        }
        write!(f, "{} [{}]", self.name, self.kind)?;
        match self.period {
            Some(period) => write!(f, " every {:.3}s", period.as_secs_f32()),
            None if self.kind == "frame" => Ok(()),
            None => write!(f, " in {:.3}s", self.remaining.as_secs_f32()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: TaskId,
    pub name: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(deadline_ms: u64, name: &str, id: u64) -> ScheduleKey {
        ScheduleKey {
            deadline: Duration::from_millis(deadline_ms),
            name: Rc::from(name),
            id: TaskId(id),
        }
    }

    #[test]
    fn test_key_ordering() {
        assert!(key(10, "a", 1) < key(20, "a", 1));
        assert!(key(10, "b", 5) < key(10, "a", 1));
        assert!(key(10, "a", 1) < key(10, "a", 2));
    }
}
