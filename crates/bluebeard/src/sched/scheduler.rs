use std::any::{Any, type_name};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::callback::{
    CallbackGroup, CallbackHandle, CallbackKind, Console, ConsoleError, Observable,
    RegistrationFlag,
};

use super::task::{
    OneShotFn, PeriodicFn, ScheduleKey, Task, TaskFailure, TaskId, TaskInfo, TaskKind, TaskResult,
};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    #[error("unknown task {0}")]
    UnknownTask(TaskId),
    #[error("negative delay: {0}s")]
    NegativeDelay(f32),
    #[error("invalid delay: {0}s")]
    InvalidDelay(f32),
    #[error("task {0} needs a non-zero period")]
    ZeroPeriod(String),
    #[error("task {0} does not carry a {1}")]
    UserDataType(TaskId, &'static str),
}

/// Converts a configured number of seconds into a delay.
pub fn delay_from_secs(secs: f32) -> Result<Duration, SchedulerError> {
    if secs.is_nan() || secs.is_infinite() {
        return Err(SchedulerError::InvalidDelay(secs));
    }
    if secs < 0.0 {
        return Err(SchedulerError::NegativeDelay(secs));
    }
    Duration::try_from_secs_f32(secs).map_err(|_| SchedulerError::InvalidDelay(secs))
}

enum Due {
    Periodic {
        id: TaskId,
        name: Rc<str>,
        period: Duration,
        callback: PeriodicFn,
    },
    OneShot {
        id: TaskId,
        name: Rc<str>,
        user_data: Box<dyn Any>,
        callback: OneShotFn,
    },
}

struct FrameCall {
    id: TaskId,
    name: Rc<str>,
    flag: RegistrationFlag,
    callback: PeriodicFn,
}

#[derive(Default)]
struct TaskList {
    now: Duration,
    last_dt: Duration,
    generation: u64,
    next_id: u64,
    tasks: HashMap<TaskId, Task>,
    queue: BTreeSet<ScheduleKey>,
    frames: Vec<TaskId>,
    ticking: bool,
}

impl TaskList {
    fn is_live(&self, id: TaskId) -> bool {
        self.tasks.get(&id).is_some_and(|t| !t.flag.is_released())
    }

    fn next_due(&mut self, graveyard: &mut Vec<Task>) -> Option<Due> {
        loop {
            let now = self.now;
            let generation = self.generation;
            let key = self
                .queue
                .iter()
                .take_while(|key| key.deadline <= now)
                .find(|key| {
                    !self
                        .tasks
                        .get(&key.id)
                        .is_some_and(|t| t.deadline == key.deadline && t.armed_in == generation)
                })
                .cloned()?;
            self.queue.remove(&key);

            let Some(task) = self.tasks.get_mut(&key.id) else {
                continue;
            };
            if task.deadline != key.deadline {
                continue;
            }
            if task.flag.is_released() {
                graveyard.extend(self.tasks.remove(&key.id));
                continue;
            }

            match &task.kind {
                TaskKind::Periodic { period, callback } => {
                    let period = *period;
                    let callback = Rc::clone(callback);
                    task.deadline += period;
                    self.queue.insert(task.key(key.id));
                    return Some(Due::Periodic {
                        id: key.id,
                        name: Rc::clone(&task.name),
                        period,
                        callback,
                    });
                }
                TaskKind::OneShot { .. } => {
                    let Some(task) = self.tasks.remove(&key.id) else {
                        continue;
                    };
                    task.flag.release();
                    if let TaskKind::OneShot {
                        user_data,
                        callback,
                    } = task.kind
                    {
                        return Some(Due::OneShot {
                            id: key.id,
                            name: task.name,
                            user_data,
                            callback,
                        });
                    }
                }
                TaskKind::PerFrame { .. } => continue,
            }
        }
    }

    fn collect_frames(&mut self, graveyard: &mut Vec<Task>) -> Vec<FrameCall> {
        let mut calls = Vec::with_capacity(self.frames.len());
        let mut kept = Vec::with_capacity(self.frames.len());

        for id in std::mem::take(&mut self.frames) {
            match self.tasks.get(&id) {
                Some(task) if !task.flag.is_released() => {
                    if let TaskKind::PerFrame { callback } = &task.kind {
                        calls.push(FrameCall {
                            id,
                            name: Rc::clone(&task.name),
                            flag: task.flag.clone(),
                            callback: Rc::clone(callback),
                        });
                    }
                    kept.push(id);
                }
                Some(_) => graveyard.extend(self.tasks.remove(&id)),
                None => {}
            }
        }

        self.frames = kept;
        calls
    }

    fn describe(&self) -> Vec<TaskInfo> {
        let frames = self.frames.iter().filter_map(|id| Some((*id, self.tasks.get(id)?)));
        let timed = self
            .queue
            .iter()
            .filter_map(|key| Some((key.id, self.tasks.get(&key.id)?)));

        timed
            .chain(frames)
            .map(|(id, task)| TaskInfo {
                id: (!task.flag.is_released()).then_some(id),
                name: task.name.to_string(),
                kind: task.kind.label(),
                period: match &task.kind {
                    TaskKind::Periodic { period, .. } => Some(*period),
                    _ => None,
                },
                remaining: task.deadline.saturating_sub(self.now),
            })
            .collect()
    }
}

/// Cooperative scheduler driving every timed callback in the process.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<TaskList>>,
    failures: Observable<TaskFailure>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TaskList::default())),
            failures: Observable::new("scheduler failures"),
        }
    }

    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    pub fn last_dt(&self) -> Duration {
        self.inner.borrow().last_dt
    }

    pub fn failures(&self) -> &Observable<TaskFailure> {
        &self.failures
    }

    pub fn add_task<F>(
        &self,
        name: &str,
        period: Duration,
        group: &mut CallbackGroup,
        callback: F,
    ) -> Result<TaskId, SchedulerError>
    where
        F: FnMut(Duration) -> TaskResult + 'static,
    {
        if period.is_zero() {
            return Err(SchedulerError::ZeroPeriod(name.to_string()));
        }
        let callback: PeriodicFn = Rc::new(RefCell::new(callback));
        Ok(self.insert(name, period, TaskKind::Periodic { period, callback }, group))
    }

    pub fn add_event<T, F>(
        &self,
        name: &str,
        delay: Duration,
        user_data: T,
        group: &mut CallbackGroup,
        callback: F,
    ) -> TaskId
    where
        T: 'static,
        F: FnOnce(T) -> TaskResult + 'static,
    {
        let callback: OneShotFn = Box::new(move |data: Box<dyn Any>| match data.downcast::<T>() {
            Ok(data) => callback(*data),
            Err(_) => anyhow::bail!("event data is not a {}", type_name::<T>()),
        });
        let kind = TaskKind::OneShot {
            user_data: Box::new(user_data),
            callback,
        };
        self.insert(name, delay, kind, group)
    }

    pub fn add_frame_task<F>(&self, name: &str, group: &mut CallbackGroup, callback: F) -> TaskId
    where
        F: FnMut(Duration) -> TaskResult + 'static,
    {
        let callback: PeriodicFn = Rc::new(RefCell::new(callback));
        self.insert(name, Duration::ZERO, TaskKind::PerFrame { callback }, group)
    }

    fn insert(&self, name: &str, delay: Duration, kind: TaskKind, group: &mut CallbackGroup) -> TaskId {
        let flag = RegistrationFlag::new();
        let id = {
            let mut list = self.inner.borrow_mut();
            list.next_id += 1;
            let id = TaskId(list.next_id);

            let per_frame = matches!(kind, TaskKind::PerFrame { .. });
            let task = Task {
                name: Rc::from(name),
                deadline: list.now + delay,
                armed_in: list.generation,
                flag: flag.clone(),
                kind,
            };
            if per_frame {
                list.frames.push(id);
            } else {
                let key = task.key(id);
                list.queue.insert(key);
            }
            list.tasks.insert(id, task);
            id
        };

        log::trace!("scheduled {name} as {id}");
        group.adopt(CallbackHandle::new(CallbackKind::SchedulerTask, id.0, name, flag));
        id
    }

    /// One-shot tasks get a new delay from now. Periodic tasks get a new
    /// period and keep their current countdown.
    pub fn reschedule(&self, id: TaskId, value: Duration) -> Result<(), SchedulerError> {
        let mut guard = self.inner.borrow_mut();
        let list = &mut *guard;
        let now = list.now;
        let generation = list.generation;

        let Some(task) = list.tasks.get_mut(&id).filter(|t| !t.flag.is_released()) else {
            log::error!("reschedule: unknown task {id}");
            return Err(SchedulerError::UnknownTask(id));
        };

        match &mut task.kind {
            TaskKind::Periodic { period, .. } => {
                if value.is_zero() {
                    return Err(SchedulerError::ZeroPeriod(task.name.to_string()));
                }
                *period = value;
            }
            TaskKind::OneShot { .. } => {
                let old = task.key(id);
                task.deadline = now + value;
                task.armed_in = generation;
                let new = task.key(id);
                list.queue.remove(&old);
                list.queue.insert(new);
            }
            TaskKind::PerFrame { .. } => {}
        }
        Ok(())
    }

    /// Cancels a task. One-shot tasks hand back their user data.
    pub fn remove_task(
        &self,
        id: TaskId,
        group: &mut CallbackGroup,
    ) -> Result<Option<Box<dyn Any>>, SchedulerError> {
        let task = {
            let mut guard = self.inner.borrow_mut();
            let list = &mut *guard;
            if !list.is_live(id) {
                log::error!("remove_task: unknown task {id}");
                return Err(SchedulerError::UnknownTask(id));
            }
            let Some(task) = list.tasks.remove(&id) else {
                return Err(SchedulerError::UnknownTask(id));
            };
            list.queue.remove(&task.key(id));
            list.frames.retain(|f| *f != id);
            task
        };

        task.flag.release();
        if group.deregister(CallbackKind::SchedulerTask, id.0).is_err() {
            log::debug!("task {id} ({}) was owned by another group", task.name);
        }

        Ok(match task.kind {
            TaskKind::OneShot { user_data, .. } => Some(user_data),
            _ => None,
        })
    }

    pub fn remove_event<T: 'static>(
        &self,
        id: TaskId,
        group: &mut CallbackGroup,
    ) -> Result<Option<T>, SchedulerError> {
        match self.remove_task(id, group)? {
            Some(data) => data
                .downcast::<T>()
                .map(|data| Some(*data))
                .map_err(|_| SchedulerError::UserDataType(id, type_name::<T>())),
            None => Ok(None),
        }
    }

    pub fn execution_delay(&self, id: TaskId) -> Result<Duration, SchedulerError> {
        let list = self.inner.borrow();
        match list.tasks.get(&id).filter(|t| !t.flag.is_released()) {
            Some(task) => Ok(task.deadline.saturating_sub(list.now)),
            None => {
                log::error!("execution_delay: unknown task {id}");
                Err(SchedulerError::UnknownTask(id))
            }
        }
    }

    pub fn task_name(&self, id: TaskId) -> Option<String> {
        let list = self.inner.borrow();
        list.tasks
            .get(&id)
            .filter(|t| !t.flag.is_released())
            .map(|t| t.name.to_string())
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.inner.borrow().is_live(id)
    }

    pub fn live_task_count(&self) -> usize {
        self.inner
            .borrow()
            .tasks
            .values()
            .filter(|t| !t.flag.is_released())
            .count()
    }

    pub fn describe_tasks(&self) -> Vec<TaskInfo> {
        self.inner.borrow().describe()
    }

    pub fn register_console(
        &self,
        console: &Console,
        group: &mut CallbackGroup,
    ) -> Result<(), ConsoleError> {
        let list: Weak<RefCell<TaskList>> = Rc::downgrade(&self.inner);
        console.add_command("listTasks", group, move |_| {
            let Some(list) = list.upgrade() else {
                return String::from("scheduler is gone");
            };
            let tasks = list.borrow().describe();
            let mut out = format!("{} tasks\n", tasks.len());
            for task in tasks {
                out.push_str(&task.to_string());
                out.push('\n');
            }
            out
        })
    }

    /// Advances simulated time by `dt` and runs everything that became due,
    /// followed by every frame task.
    pub fn tick(&self, dt: Duration) {
        {
            let mut list = self.inner.borrow_mut();
            if list.ticking {
                log::warn!("scheduler tick re-entered from a task; ignoring");
                return;
            }
            list.ticking = true;
            list.generation += 1;
            list.now += dt;
            list.last_dt = dt;
        }

        let mut graveyard = Vec::new();

        loop {
            let due = self.inner.borrow_mut().next_due(&mut graveyard);
            let Some(due) = due else {
                break;
            };

            match due {
                Due::Periodic {
                    id,
                    name,
                    period,
                    callback,
                } => {
                    let result = match callback.try_borrow_mut() {
                        Ok(mut callback) => (*callback)(period),
                        Err(_) => Err(anyhow::anyhow!("task is already running")),
                    };
                    self.report(id, &name, result);
                }
                Due::OneShot {
                    id,
                    name,
                    user_data,
                    callback,
                } => {
                    let result = callback(user_data);
                    self.report(id, &name, result);
                }
            }
        }

        let frames = self.inner.borrow_mut().collect_frames(&mut graveyard);
        for frame in frames {
            if frame.flag.is_released() {
                continue;
            }
            let result = match frame.callback.try_borrow_mut() {
                Ok(mut callback) => (*callback)(dt),
                Err(_) => Err(anyhow::anyhow!("frame task is already running")),
            };
            self.report(frame.id, &frame.name, result);
        }

        self.inner.borrow_mut().ticking = false;
        drop(graveyard);
    }

    fn report(&self, id: TaskId, name: &str, result: TaskResult) {
        if let Err(error) = result {
            log::error!("task {name} ({id}) failed: {error:#}");
            self.failures.emit(&TaskFailure {
                task: id,
                name: name.to_string(),
                error: format!("{error:#}"),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_task_ids_unique() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();

        let mut ids = Vec::new();
        for i in 0..50 {
            ids.push(scheduler.add_event(&format!("e{i}"), ms(10), i, &mut group, |_| Ok(())));
            ids.push(scheduler.add_task(&format!("t{i}"), ms(5), &mut group, |_| Ok(())).unwrap());
        }
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ids.len());
    }

    #[test]
    fn test_equal_deadlines_run_by_descending_name() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["alpha", "charlie", "bravo"] {
            let order = Rc::clone(&order);
            scheduler
                .add_task(name, ms(100), &mut group, move |_| {
                    order.borrow_mut().push(name);
                    Ok(())
                })
                .unwrap();
        }

        scheduler.tick(ms(100));
        assert_eq!(*order.borrow(), vec!["charlie", "bravo", "alpha"]);
    }

    #[test]
    fn test_periodic_deadline_does_not_drift() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        let fired = Rc::new(Cell::new(0));

        let f = Rc::clone(&fired);
        let id = scheduler
            .add_task("pulse", ms(1000), &mut group, move |period| {
                assert_eq!(period, ms(1000));
                f.set(f.get() + 1);
                Ok(())
            })
            .unwrap();

        scheduler.tick(ms(2500));
        assert_eq!(fired.get(), 2);
        assert_eq!(scheduler.execution_delay(id).unwrap(), ms(500));

        scheduler.tick(ms(499));
        assert_eq!(fired.get(), 2);
        scheduler.tick(ms(1));
        assert_eq!(fired.get(), 3);
        assert_eq!(scheduler.execution_delay(id).unwrap(), ms(1000));
    }

    #[test]
    fn test_remove_twice_is_error() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        let id = scheduler.add_event("once", ms(10), "payload", &mut group, |_| Ok(()));

        let data = scheduler.remove_event::<&str>(id, &mut group).unwrap();
        assert_eq!(data, Some("payload"));
        assert_eq!(
            scheduler.remove_task(id, &mut group).unwrap_err(),
            SchedulerError::UnknownTask(id)
        );
        assert!(group.is_empty());
    }

    #[test]
    fn test_event_fires_once_with_user_data() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        let got = Rc::new(RefCell::new(Vec::new()));

        let g = Rc::clone(&got);
        scheduler.add_event("X", ms(2000), 42u32, &mut group, move |data| {
            g.borrow_mut().push(data);
            Ok(())
        });

        scheduler.tick(ms(1000));
        assert!(got.borrow().is_empty());
        scheduler.tick(ms(1500));
        assert_eq!(*got.borrow(), vec![42]);
        scheduler.tick(ms(5000));
        assert_eq!(*got.borrow(), vec![42]);
        assert_eq!(scheduler.live_task_count(), 0);
    }

    #[test]
    fn test_zero_delay_event_runs_on_next_tick() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        let fired = Rc::new(Cell::new(false));

        let f = Rc::clone(&fired);
        scheduler.add_event("asap", Duration::ZERO, (), &mut group, move |_| {
            f.set(true);
            Ok(())
        });
        assert!(!fired.get());
        scheduler.tick(Duration::ZERO);
        assert!(fired.get());
    }

    fn arm_echo(scheduler: &Scheduler, group: &Rc<RefCell<CallbackGroup>>, runs: &Rc<Cell<u32>>) {
        let (sched, grp, count) = (scheduler.clone(), Rc::clone(group), Rc::clone(runs));
        scheduler.add_event("echo", Duration::ZERO, (), &mut group.borrow_mut(), move |_| {
            count.set(count.get() + 1);
            if count.get() < 1000 {
                arm_echo(&sched, &grp, &count);
            }
            Ok(())
        });
    }

    #[test]
    fn test_event_armed_during_tick_waits_for_next_tick() {
        let scheduler = Scheduler::new();
        let group = Rc::new(RefCell::new(CallbackGroup::new()));
        let runs = Rc::new(Cell::new(0));

        arm_echo(&scheduler, &group, &runs);
        scheduler.tick(ms(16));
        assert_eq!(runs.get(), 1);
        scheduler.tick(ms(16));
        assert_eq!(runs.get(), 2);
        assert_eq!(scheduler.live_task_count(), 1);
    }

    #[test]
    fn test_frame_tasks_run_after_timed_in_registration_order() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for name in ["frame-b", "frame-a"] {
            let order = Rc::clone(&order);
            scheduler.add_frame_task(name, &mut group, move |_| {
                order.borrow_mut().push(name);
                Ok(())
            });
        }
        let o = Rc::clone(&order);
        scheduler.add_event("timed", ms(5), (), &mut group, move |_| {
            o.borrow_mut().push("timed");
            Ok(())
        });

        scheduler.tick(ms(10));
        assert_eq!(*order.borrow(), vec!["timed", "frame-b", "frame-a"]);
    }

    #[test]
    fn test_reschedule_semantics() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();

        let event = scheduler.add_event("ev", ms(1000), (), &mut group, |_| Ok(()));
        let periodic = scheduler.add_task("per", ms(1000), &mut group, |_| Ok(())).unwrap();

        scheduler.tick(ms(400));
        scheduler.reschedule(event, ms(1000)).unwrap();
        scheduler.reschedule(periodic, ms(5000)).unwrap();

        assert_eq!(scheduler.execution_delay(event).unwrap(), ms(1000));
        assert_eq!(scheduler.execution_delay(periodic).unwrap(), ms(600));

        scheduler.tick(ms(600));
        assert_eq!(scheduler.execution_delay(periodic).unwrap(), ms(5000));
    }

    #[test]
    fn test_task_removes_itself_and_others() {
        let scheduler = Scheduler::new();
        let group = Rc::new(RefCell::new(CallbackGroup::new()));
        let runs = Rc::new(Cell::new(0));

        let victim = {
            let runs = Rc::clone(&runs);
            scheduler
                .add_task("a-victim", ms(10), &mut group.borrow_mut(), move |_| {
                    runs.set(runs.get() + 100);
                    Ok(())
                })
                .unwrap()
        };

        let own_id = Rc::new(Cell::new(None));
        let killer = {
            let sched = scheduler.clone();
            let owner = Rc::clone(&group);
            let runs = Rc::clone(&runs);
            let own_id = Rc::clone(&own_id);
            let mut group = group.borrow_mut();
            scheduler
                .add_task("z-killer", ms(10), &mut group, move |_| {
                    runs.set(runs.get() + 1);
                    let mut owner = owner.borrow_mut();
                    sched.remove_task(victim, &mut owner)?;
                    if let Some(id) = own_id.get() {
                        sched.remove_task(id, &mut owner)?;
                    }
                    Ok(())
                })
                .unwrap()
        };
        own_id.set(Some(killer));

        scheduler.tick(ms(10));
        assert_eq!(runs.get(), 1);
        scheduler.tick(ms(100));
        assert_eq!(runs.get(), 1);
        assert_eq!(scheduler.live_task_count(), 0);
    }

    #[test]
    fn test_dropping_group_cancels_tasks() {
        let scheduler = Scheduler::new();
        let fired = Rc::new(Cell::new(0));

        let mut group = CallbackGroup::new();
        let f = Rc::clone(&fired);
        let id = scheduler
            .add_task("doomed", ms(10), &mut group, move |_| {
                f.set(f.get() + 1);
                Ok(())
            })
            .unwrap();
        drop(group);

        assert!(!scheduler.is_scheduled(id));
        assert!(scheduler.describe_tasks()[0].id.is_none());

        scheduler.tick(ms(50));
        assert_eq!(fired.get(), 0);
        assert!(scheduler.describe_tasks().is_empty());
    }

    #[test]
    fn test_failing_task_is_reported_and_scheduler_continues() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        let failures = Rc::new(RefCell::new(Vec::new()));

        let f = Rc::clone(&failures);
        scheduler
            .failures()
            .subscribe(&mut group, move |failure: &TaskFailure| {
                f.borrow_mut().push(failure.name.clone())
            });

        let survived = Rc::new(Cell::new(false));
        let s = Rc::clone(&survived);
        scheduler.add_event("broken", ms(1), (), &mut group, |_| anyhow::bail!("boom"));
        scheduler.add_event("after", ms(2), (), &mut group, move |_| {
            s.set(true);
            Ok(())
        });

        scheduler.tick(ms(5));
        assert_eq!(*failures.borrow(), vec!["broken".to_string()]);
        assert!(survived.get());
    }

    #[test]
    fn test_unknown_task_errors() {
        let scheduler = Scheduler::new();
        let bogus = TaskId(99);
        assert!(scheduler.reschedule(bogus, ms(1)).is_err());
        assert!(scheduler.execution_delay(bogus).is_err());
        assert!(scheduler.task_name(bogus).is_none());
    }

    #[test]
    fn test_delay_from_secs() {
        assert_eq!(delay_from_secs(1.5).unwrap(), ms(1500));
        assert_eq!(delay_from_secs(-1.0), Err(SchedulerError::NegativeDelay(-1.0)));
        assert!(delay_from_secs(f32::NAN).is_err());
    }

    #[test]
    fn test_zero_period_rejected() {
        let scheduler = Scheduler::new();
        let mut group = CallbackGroup::new();
        assert!(matches!(
            scheduler.add_task("spin", Duration::ZERO, &mut group, |_| Ok(())),
            Err(SchedulerError::ZeroPeriod(_))
        ));
    }

    #[test]
    fn test_list_tasks_command() {
        let scheduler = Scheduler::new();
        let console = Console::new();
        let mut group = CallbackGroup::new();
        scheduler.register_console(&console, &mut group).unwrap();
        scheduler.add_task("heartbeat", ms(250), &mut group, |_| Ok(())).unwrap();

        let out = console.execute("listTasks").unwrap();
        assert!(out.starts_with("1 tasks"));
        assert!(out.contains("heartbeat"));
    }
}
