//! Per-task consumer of the routed message stream.
//!
//! Non-terminal messages are appended to the task's conversation. The first
//! `Status` message runs the one-shot status hook, which may run further
//! side effects and decides the final status written back to the task.

use crate::channel::{Next, Receiver};
use crate::queue::{TaskQueue, TaskRef};
use futures::future::BoxFuture;
use std::sync::Arc;
use tether_proto::{TaskMessage, TaskStatus};
use tracing::{debug, warn};

/// Maps the reported terminal status to the one stored on the task.
pub type StatusHook = Box<dyn FnOnce(TaskStatus) -> BoxFuture<'static, TaskStatus> + Send>;

/// How a lifecycle consumer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// A status message arrived and the task now holds this status.
    Resolved(TaskStatus),
    /// An `Exit` message tore the consumer down. Status untouched.
    Exited,
    /// The task was removed from the queue while the consumer ran.
    Released,
    /// The producer finished without sending a status.
    Closed,
}

pub struct TaskLifecycle {
    queue: Arc<TaskQueue>,
    task: TaskRef,
    receiver: Receiver<TaskMessage, ()>,
    on_status: Option<StatusHook>,
}

impl TaskLifecycle {
    pub fn new(queue: Arc<TaskQueue>, task: TaskRef, receiver: Receiver<TaskMessage, ()>) -> Self {
        Self {
            queue,
            task,
            receiver,
            on_status: None,
        }
    }

    /// Installs the hook run on the status message.
    #[must_use]
    pub fn on_status(mut self, hook: StatusHook) -> Self {
        self.on_status = Some(hook);
        self
    }

    /// Drains the stream until a status, an exit, the end, or the task's
    /// removal from the queue, whichever comes first.
    pub async fn run(mut self) -> LifecycleOutcome {
        loop {
            let next = tokio::select! {
                biased;
                () = self.queue.wait_removed(self.task) => {
                    debug!(task = %self.task, "Task no longer tracked; stopping lifecycle");
                    return LifecycleOutcome::Released;
                }
                next = self.receiver.next() => next,
            };

            let message = match next {
                Next::Value(message) => message,
                Next::Return(()) | Next::End => return LifecycleOutcome::Closed,
            };

            match message {
                TaskMessage::Exit => return LifecycleOutcome::Exited,
                TaskMessage::Status { status } => {
                    if !self.queue.append_message(self.task, TaskMessage::Status { status }) {
                        return LifecycleOutcome::Released;
                    }
                    let resolved = match self.on_status.take() {
                        Some(hook) => hook(status).await,
                        None => status,
                    };
                    if let Err(e) = self.queue.set_status(self.task, resolved) {
                        warn!(task = %self.task, error = %e, "Could not record final status");
                        return match self.queue.status(self.task) {
                            Some(current) => LifecycleOutcome::Resolved(current),
                            None => LifecycleOutcome::Released,
                        };
                    }
                    return LifecycleOutcome::Resolved(resolved);
                }
                other => {
                    self.queue.append_message(self.task, other);
                }
            }
        }
    }
}
