//! The external task runner: identities, lifecycle events and commands.
//!
//! The runner is only partially observable. It reports coarse lifecycle
//! events and chat-style messages, but never tells us when it is idle.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identity the runner assigns to one node of its task stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerTaskId(String);

impl RunnerTaskId {
    /// Creates a new runner task ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunnerTaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RunnerTaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for RunnerTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether the runner is telling us something or asking for something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Say,
    Ask,
}

/// A chat-style message emitted by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerMessage {
    /// Say or ask.
    pub kind: MessageKind,

    /// Runner-specific subtype, e.g. `text`, `new_task`, `completion_result`.
    pub subtype: String,

    /// Text payload, if any.
    #[serde(default)]
    pub text: Option<String>,

    /// Image payloads (opaque, usually data URLs).
    #[serde(default)]
    pub images: Vec<String>,

    /// True while the runner is still streaming this message.
    #[serde(default)]
    pub partial: bool,
}

impl RunnerMessage {
    /// Creates a finalized `say` message.
    pub fn say(subtype: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Say,
            subtype: subtype.into(),
            text: Some(text.into()),
            images: Vec::new(),
            partial: false,
        }
    }

    /// Creates a finalized `ask` message.
    pub fn ask(subtype: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Ask,
            subtype: subtype.into(),
            text: Some(text.into()),
            images: Vec::new(),
            partial: false,
        }
    }

    /// Marks this message as a streaming fragment.
    #[must_use]
    pub fn partial(mut self) -> Self {
        self.partial = true;
        self
    }

    /// Attaches images to this message.
    #[must_use]
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Returns true if the message carries the given subtype.
    pub fn is_subtype(&self, subtype: &str) -> bool {
        self.subtype == subtype
    }
}

/// Lifecycle events reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    TaskCreated { id: RunnerTaskId },
    TaskStarted { id: RunnerTaskId },
    TaskPaused { id: RunnerTaskId },
    TaskUnpaused { id: RunnerTaskId },
    TaskSpawned { parent: RunnerTaskId, child: RunnerTaskId },
    Message { id: RunnerTaskId, message: RunnerMessage },
    TaskAskResponded { id: RunnerTaskId },
    TaskAborted { id: RunnerTaskId },
}

impl RunnerEvent {
    /// The runner identity this event is about.
    pub fn task_id(&self) -> &RunnerTaskId {
        match self {
            RunnerEvent::TaskCreated { id }
            | RunnerEvent::TaskStarted { id }
            | RunnerEvent::TaskPaused { id }
            | RunnerEvent::TaskUnpaused { id }
            | RunnerEvent::Message { id, .. }
            | RunnerEvent::TaskAskResponded { id }
            | RunnerEvent::TaskAborted { id } => id,
            RunnerEvent::TaskSpawned { child, .. } => child,
        }
    }
}

/// Commands and event subscription exposed by the external runner.
///
/// Stack and subscription accessors are synchronous so that event handlers
/// can consult them without suspending.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Subscribes to the runner's lifecycle events, in emission order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RunnerEvent>;

    /// Returns the current task stack, root first.
    fn current_task_stack(&self) -> Vec<RunnerTaskId>;

    /// Starts a fresh root task and returns its identity.
    async fn start_new_task(&self, prompt: &str, images: &[String]) -> Result<RunnerTaskId>;

    /// Resumes a task from the runner's history as the new root.
    async fn resume_task(&self, id: &RunnerTaskId) -> Result<()>;

    /// Returns true if the runner still has this task in its history.
    async fn is_task_in_history(&self, id: &RunnerTaskId) -> bool;

    /// Pops the top of the task stack, aborting it.
    async fn clear_current_task(&self) -> Result<()>;

    /// Returns the recorded messages of a task.
    async fn messages(&self, id: &RunnerTaskId) -> Result<Vec<RunnerMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_task_id() {
        let event = RunnerEvent::TaskSpawned {
            parent: RunnerTaskId::new("root"),
            child: RunnerTaskId::new("child"),
        };
        assert_eq!(event.task_id().as_str(), "child");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RunnerEvent::Message {
            id: RunnerTaskId::new("t1"),
            message: RunnerMessage::say("text", "Hello").partial(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "message");
        assert_eq!(json["message"]["kind"], "say");
        assert_eq!(json["message"]["partial"], true);
    }
}
