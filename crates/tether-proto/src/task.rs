//! Task identity and the status state machine.

use serde::{Deserialize, Serialize};

/// Unique identifier for a logical task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a new task ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a logical task.
///
/// ```text
/// prepared ──► queued ──► running ──► completed | asking | aborted | error
///    ▲           │                          │
///    └─ cancel ──┘        ◄── resubmit ─────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Authored but not yet submitted to the queue.
    Prepared,
    /// Waiting for the automated loop to pick it up.
    Queued,
    /// Currently owns the runner.
    Running,
    /// The root task finished on its own.
    Completed,
    /// Stalled; presumably waiting on human input.
    Asking,
    /// The runner stack was aborted.
    Aborted,
    /// A hook or runner command failed.
    Error,
}

impl TaskStatus {
    /// Returns the lowercase name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Prepared => "prepared",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Asking => "asking",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Error => "error",
        }
    }

    /// Returns true for statuses a running task can end in.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Asking | TaskStatus::Aborted | TaskStatus::Error
        )
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    ///
    /// Cancellation (`queued -> prepared` or back to a prior status) is not a
    /// plain transition and is handled by the task itself.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Queued, TaskStatus::Running) => true,
            (TaskStatus::Running, n) => n.is_terminal(),
            (TaskStatus::Prepared, TaskStatus::Queued) => true,
            (s, TaskStatus::Queued) => s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
