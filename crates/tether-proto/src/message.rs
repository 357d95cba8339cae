//! Messages routed from the coordinator to a task's message stream.

use crate::{MessageKind, RunnerMessage, RunnerTaskId, TaskStatus};
use serde::{Deserialize, Serialize};

/// One entry on a task's message stream.
///
/// Say and ask messages are conversation; `Status` ends the task;
/// `Exit` tears the consumer down without touching the task's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskMessage {
    Say {
        runner_id: RunnerTaskId,
        message: RunnerMessage,
    },
    Ask {
        runner_id: RunnerTaskId,
        message: RunnerMessage,
    },
    Status {
        status: TaskStatus,
    },
    Exit,
}

impl TaskMessage {
    /// Wraps a finalized runner message, picking the variant from its kind.
    pub fn from_runner(runner_id: RunnerTaskId, message: RunnerMessage) -> Self {
        match message.kind {
            MessageKind::Say => TaskMessage::Say { runner_id, message },
            MessageKind::Ask => TaskMessage::Ask { runner_id, message },
        }
    }

    /// Returns the terminal status carried by this message, if any.
    pub fn status(&self) -> Option<TaskStatus> {
        match self {
            TaskMessage::Status { status } => Some(*status),
            _ => None,
        }
    }

    /// Returns the runner payload for say/ask messages.
    pub fn runner_message(&self) -> Option<&RunnerMessage> {
        match self {
            TaskMessage::Say { message, .. } | TaskMessage::Ask { message, .. } => Some(message),
            _ => None,
        }
    }
}
