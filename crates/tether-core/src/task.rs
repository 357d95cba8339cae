//! Logical tasks and their status history.

use crate::hooks::TaskHooks;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_proto::{RunnerTaskId, TaskId, TaskMessage, TaskStatus};

/// What a caller supplies to create a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Explicit identity. Generated when omitted.
    #[serde(default)]
    pub id: Option<TaskId>,

    pub prompt: String,

    #[serde(default)]
    pub images: Vec<String>,

    /// Free-form mode/configuration tag passed through to hosts.
    #[serde(default)]
    pub mode: Option<String>,

    #[serde(default)]
    pub hooks: TaskHooks,
}

impl TaskSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: TaskHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Conversation of a previous run, kept when a task is resubmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub status: TaskStatus,
    pub runner_id: Option<RunnerTaskId>,
    pub log: Vec<TaskMessage>,
}

/// A logical unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub prompt: String,
    pub images: Vec<String>,
    pub mode: Option<String>,
    pub hooks: TaskHooks,
    status: TaskStatus,
    /// Statuses held before each submission, most recent last.
    previous: Vec<TaskStatus>,
    transitions: Vec<StatusChange>,
    /// Root identity of the last run, used to resume instead of restart.
    pub runner_id: Option<RunnerTaskId>,
    pub log: Vec<TaskMessage>,
    pub attempts: Vec<Attempt>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a task in `status` from a spec, assigning `fallback_id` if
    /// the spec carries none.
    pub fn new(spec: TaskSpec, fallback_id: TaskId, status: TaskStatus) -> Self {
        Self {
            id: spec.id.unwrap_or(fallback_id),
            prompt: spec.prompt,
            images: spec.images,
            mode: spec.mode,
            hooks: spec.hooks,
            status,
            previous: Vec::new(),
            transitions: Vec::new(),
            runner_id: None,
            log: Vec::new(),
            attempts: Vec::new(),
            archived: false,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn transitions(&self) -> &[StatusChange] {
        &self.transitions
    }

    /// Statuses in the order the task went through them, current last.
    pub fn status_path(&self) -> Vec<TaskStatus> {
        let mut path: Vec<TaskStatus> = self.transitions.iter().map(|c| c.from).collect();
        path.push(self.status);
        path
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns false and leaves the task untouched otherwise. Leaving a
    /// terminal status for `queued` shelves the current conversation as an
    /// [`Attempt`].
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        let from = self.status;
        if !from.can_transition_to(next) {
            return false;
        }
        if next == TaskStatus::Queued {
            self.previous.push(from);
            if from.is_terminal() {
                self.attempts.push(Attempt {
                    status: from,
                    runner_id: self.runner_id.clone(),
                    log: std::mem::take(&mut self.log),
                });
            }
        }
        self.record(from, next);
        true
    }

    /// Takes a queued task back out of the queue.
    ///
    /// Restores the status held before it was submitted, or `prepared`.
    /// Any other status makes this a no-op returning false.
    pub fn cancel(&mut self) -> bool {
        if self.status != TaskStatus::Queued {
            return false;
        }
        let restored = self.previous.pop().unwrap_or(TaskStatus::Prepared);
        if restored.is_terminal() {
            if let Some(attempt) = self.attempts.pop() {
                self.log = attempt.log;
            }
        }
        self.record(TaskStatus::Queued, restored);
        true
    }

    fn record(&mut self, from: TaskStatus, to: TaskStatus) {
        self.status = to;
        self.transitions.push(StatusChange {
            from,
            to,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_proto::RunnerMessage;

    fn task(status: TaskStatus) -> Task {
        Task::new(TaskSpec::new("test"), TaskId::new("t1"), status)
    }

    #[test]
    fn test_happy_path() {
        let mut t = task(TaskStatus::Queued);
        assert!(t.transition(TaskStatus::Running));
        assert!(t.transition(TaskStatus::Completed));
        assert_eq!(
            t.status_path(),
            vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Completed]
        );
    }

    #[test]
    fn test_illegal_transition_is_noop() {
        let mut t = task(TaskStatus::Prepared);
        assert!(!t.transition(TaskStatus::Running));
        assert!(!t.transition(TaskStatus::Completed));
        assert_eq!(t.status(), TaskStatus::Prepared);
        assert!(t.transitions().is_empty());
    }

    #[test]
    fn test_cancel_running_is_noop() {
        let mut t = task(TaskStatus::Queued);
        t.transition(TaskStatus::Running);
        assert!(!t.cancel());
        assert_eq!(t.status(), TaskStatus::Running);
    }

    #[test]
    fn test_cancel_without_history_goes_to_prepared() {
        let mut t = task(TaskStatus::Queued);
        assert!(t.cancel());
        assert_eq!(t.status(), TaskStatus::Prepared);
    }

    #[test]
    fn test_resubmit_keeps_attempt_and_cancel_restores_it() {
        let mut t = task(TaskStatus::Queued);
        t.transition(TaskStatus::Running);
        t.runner_id = Some(RunnerTaskId::new("rt-1"));
        t.log.push(TaskMessage::from_runner(
            RunnerTaskId::new("rt-1"),
            RunnerMessage::say("text", "Hello"),
        ));
        t.transition(TaskStatus::Error);

        assert!(t.transition(TaskStatus::Queued));
        assert!(t.log.is_empty());
        assert_eq!(t.attempts.len(), 1);
        assert_eq!(t.attempts[0].status, TaskStatus::Error);

        assert!(t.cancel());
        assert_eq!(t.status(), TaskStatus::Error);
        assert_eq!(t.log.len(), 1);
        assert!(t.attempts.is_empty());
    }

    #[test]
    fn test_spec_id_wins_over_fallback() {
        let t = Task::new(
            TaskSpec::new("x").with_id("explicit"),
            TaskId::new("generated"),
            TaskStatus::Prepared,
        );
        assert_eq!(t.id.as_str(), "explicit");
    }
}
