//! The task list the automated loop drains.
//!
//! Tasks live in an arena of generation-tagged slots. A [`TaskRef`] stays
//! valid until the task is removed, after which every lookup through it
//! fails instead of reaching whatever task reuses the slot.

use crate::task::{Task, TaskSpec};
use crate::utils::lock;
use crate::waiter::Waiters;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_proto::{Error, Result, RunnerTaskId, TaskId, TaskMessage, TaskStatus};
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

/// Handle to a task slot in a [`TaskQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef {
    index: usize,
    generation: u64,
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

/// Notifications emitted on every queue mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// The task list, its order or the paused flag changed.
    Updated,
    /// A task moved between statuses.
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// A task left the queue for good.
    Removed { task_id: TaskId },
}

struct Slot {
    generation: u64,
    task: Option<Task>,
}

struct QueueState {
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Live slot indices in queue order.
    order: Vec<usize>,
    paused: bool,
    next_id: u64,
}

impl QueueState {
    fn task(&self, r: TaskRef) -> Option<&Task> {
        self.slots
            .get(r.index)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.task.as_ref())
    }

    fn task_mut(&mut self, r: TaskRef) -> Option<&mut Task> {
        self.slots
            .get_mut(r.index)
            .filter(|slot| slot.generation == r.generation)
            .and_then(|slot| slot.task.as_mut())
    }

    fn task_ref(&self, index: usize) -> TaskRef {
        TaskRef {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn insert(&mut self, spec: TaskSpec, status: TaskStatus) -> TaskRef {
        self.next_id += 1;
        let task = Task::new(spec, TaskId::new(format!("task-{}", self.next_id)), status);
        let index = if let Some(index) = self.free.pop() {
            self.slots[index].task = Some(task);
            index
        } else {
            self.slots.push(Slot {
                generation: 0,
                task: Some(task),
            });
            self.slots.len() - 1
        };
        self.order.push(index);
        self.task_ref(index)
    }
}

fn stale(r: TaskRef) -> Error {
    Error::UnknownTask(r.to_string())
}

/// Ordered, pausable list of tasks.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    waiters: Arc<Waiters>,
    events: broadcast::Sender<QueueEvent>,
}

impl TaskQueue {
    pub fn new(poll_interval: Duration, paused: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(QueueState {
                slots: Vec::new(),
                free: Vec::new(),
                order: Vec::new(),
                paused,
                next_id: 0,
            }),
            waiters: Arc::new(Waiters::new(poll_interval)),
            events,
        }
    }

    /// Waiters woken on every mutation.
    pub fn waiters(&self) -> &Arc<Waiters> {
        &self.waiters
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Appends a task ready to run.
    pub fn enqueue(&self, spec: TaskSpec) -> TaskRef {
        let r = lock(&self.state).insert(spec, TaskStatus::Queued);
        debug!(task = %r, "Task enqueued");
        self.notify(None);
        r
    }

    /// Appends a task that waits for an explicit [`submit`](Self::submit).
    pub fn add_prepared(&self, spec: TaskSpec) -> TaskRef {
        let r = lock(&self.state).insert(spec, TaskStatus::Prepared);
        self.notify(None);
        r
    }

    /// Queues a prepared task, or resubmits a finished one.
    ///
    /// Resubmission keeps the previous conversation as an attempt.
    pub fn submit(&self, r: TaskRef) -> Result<()> {
        self.set_status(r, TaskStatus::Queued)
    }

    /// Takes a queued task back out, restoring its prior status.
    pub fn cancel(&self, r: TaskRef) -> bool {
        let change = {
            let mut state = lock(&self.state);
            let Some(task) = state.task_mut(r) else {
                return false;
            };
            if !task.cancel() {
                return false;
            }
            (task.id.clone(), TaskStatus::Queued, task.status())
        };
        self.notify(Some(change));
        true
    }

    /// Drops a task. Outstanding refs to it become stale.
    pub fn remove(&self, r: TaskRef) -> Option<Task> {
        let task = {
            let mut state = lock(&self.state);
            state.task(r)?;
            let slot = &mut state.slots[r.index];
            slot.generation += 1;
            let task = slot.task.take()?;
            state.order.retain(|&i| i != r.index);
            state.free.push(r.index);
            task
        };
        debug!(task_id = %task.id, "Task removed");
        let _ = self.events.send(QueueEvent::Removed {
            task_id: task.id.clone(),
        });
        self.notify(None);
        Some(task)
    }

    /// Resolves once `r` no longer refers to a live task.
    pub async fn wait_removed(&self, r: TaskRef) {
        let mut events = self.subscribe();
        while self.is_live(r) {
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => std::future::pending().await,
            }
        }
    }

    /// Moves the task at position `from` to position `to`.
    pub fn reorder(&self, from: usize, to: usize) -> bool {
        {
            let mut state = lock(&self.state);
            if from >= state.order.len() || to >= state.order.len() {
                return false;
            }
            let index = state.order.remove(from);
            state.order.insert(to, index);
        }
        self.notify(None);
        true
    }

    /// Stops the automated loop from picking new tasks.
    pub fn pause(&self) {
        lock(&self.state).paused = true;
        info!("Queue paused");
        self.notify(None);
    }

    pub fn resume(&self) {
        lock(&self.state).paused = false;
        info!("Queue resumed");
        self.notify(None);
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.state).paused
    }

    /// Sets the visibility flag. Status is untouched.
    pub fn archive(&self, r: TaskRef, archived: bool) -> bool {
        {
            let mut state = lock(&self.state);
            let Some(task) = state.task_mut(r) else {
                return false;
            };
            task.archived = archived;
        }
        self.notify(None);
        true
    }

    /// Returns a copy of the task.
    pub fn get(&self, r: TaskRef) -> Option<Task> {
        lock(&self.state).task(r).cloned()
    }

    /// Reads the task in place.
    pub fn with_task<U>(&self, r: TaskRef, f: impl FnOnce(&Task) -> U) -> Option<U> {
        lock(&self.state).task(r).map(f)
    }

    pub fn status(&self, r: TaskRef) -> Option<TaskStatus> {
        self.with_task(r, Task::status)
    }

    /// Returns true while `r` refers to a task that has not been removed.
    pub fn is_live(&self, r: TaskRef) -> bool {
        lock(&self.state).task(r).is_some()
    }

    /// Looks a task up by identity.
    pub fn find(&self, id: &TaskId) -> Option<TaskRef> {
        let state = lock(&self.state);
        state
            .order
            .iter()
            .copied()
            .find(|&i| state.slots[i].task.as_ref().is_some_and(|t| &t.id == id))
            .map(|i| state.task_ref(i))
    }

    /// First queued task in queue order. Ignores the paused flag.
    pub fn next_queued(&self) -> Option<TaskRef> {
        let state = lock(&self.state);
        state
            .order
            .iter()
            .copied()
            .find(|&i| {
                state.slots[i]
                    .task
                    .as_ref()
                    .is_some_and(|t| t.status() == TaskStatus::Queued)
            })
            .map(|i| state.task_ref(i))
    }

    /// Applies a status transition, rejecting what the state machine forbids.
    pub fn set_status(&self, r: TaskRef, status: TaskStatus) -> Result<()> {
        let change = {
            let mut state = lock(&self.state);
            let task = state.task_mut(r).ok_or_else(|| stale(r))?;
            let from = task.status();
            if !task.transition(status) {
                return Err(Error::IllegalTransition { from, to: status });
            }
            info!(task_id = %task.id, %from, to = %status, "Task status changed");
            (task.id.clone(), from, status)
        };
        self.notify(Some(change));
        Ok(())
    }

    /// Remembers the runner root a task last ran under.
    pub fn set_runner_id(&self, r: TaskRef, runner_id: RunnerTaskId) -> bool {
        let mut state = lock(&self.state);
        match state.task_mut(r) {
            Some(task) => {
                task.runner_id = Some(runner_id);
                true
            }
            None => false,
        }
    }

    /// Appends to the task's conversation log.
    pub fn append_message(&self, r: TaskRef, message: TaskMessage) -> bool {
        let mut state = lock(&self.state);
        match state.task_mut(r) {
            Some(task) => {
                task.log.push(message);
                true
            }
            None => false,
        }
    }

    /// Copies every task in queue order.
    pub fn snapshot(&self) -> Vec<Task> {
        let state = lock(&self.state);
        state
            .order
            .iter()
            .filter_map(|&i| state.slots[i].task.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emits events and wakes the automated loop. Called with the state
    /// lock released, since waiter predicates read the queue.
    fn notify(&self, change: Option<(TaskId, TaskStatus, TaskStatus)>) {
        if let Some((task_id, from, to)) = change {
            let _ = self.events.send(QueueEvent::StatusChanged { task_id, from, to });
        }
        let _ = self.events.send(QueueEvent::Updated);
        self.waiters.wake();
    }
}
