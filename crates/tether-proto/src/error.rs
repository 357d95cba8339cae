//! Error types shared across Tether crates.

use crate::{RunnerTaskId, TaskStatus};

/// Result alias used throughout Tether.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the scheduling core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `send` or `finish` was called on a channel that already finished.
    #[error("channel already finished")]
    ChannelFinished,

    /// The runner reported an abort for an identity nobody owns.
    ///
    /// This means busy tracking has desynchronized from the runner.
    #[error("abort reported for untracked runner task {0}")]
    UntrackedAbort(RunnerTaskId),

    /// The runner rejected or failed a command.
    #[error("runner error: {0}")]
    Runner(String),

    /// A task hook command failed to spawn or exited non-zero.
    #[error("hook `{command}` failed: {reason}")]
    Hook { command: String, reason: String },

    /// A task reference no longer points at a live task.
    #[error("unknown task {0}")]
    UnknownTask(String),

    /// A status change that the task state machine forbids.
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },
}

impl Error {
    /// Convenience constructor for runner failures.
    pub fn runner(reason: impl Into<String>) -> Self {
        Self::Runner(reason.into())
    }

    /// Returns true if this error signals a broken internal invariant
    /// rather than a task-level failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::UntrackedAbort(_))
    }
}
