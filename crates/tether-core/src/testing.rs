//! In-memory doubles for driving the scheduler without a real runner.
//!
//! [`MockRunner`] keeps a task stack and a history, emits the same lifecycle
//! events a real runner would, and can replay a scripted conversation when
//! a prompt starts. [`RecordingCommandRunner`] records hook commands instead
//! of executing them.

use crate::hooks::{CommandOutput, CommandRunner};
use crate::utils::lock;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tether_proto::{Error, Result, Runner, RunnerEvent, RunnerMessage, RunnerTaskId};
use tokio::sync::mpsc;

/// Subtype the mock treats as "this task is done" unless told otherwise.
pub const COMPLETION_SUBTYPE: &str = "completion_result";

#[derive(Default)]
struct MockState {
    stack: Vec<RunnerTaskId>,
    history: Vec<RunnerTaskId>,
    messages: HashMap<RunnerTaskId, Vec<RunnerMessage>>,
    subscribers: Vec<mpsc::UnboundedSender<RunnerEvent>>,
    next_id: u64,
    started: Vec<String>,
    resumed: Vec<RunnerTaskId>,
    scripts: HashMap<String, Vec<RunnerMessage>>,
    fail_next_start: bool,
    completion_tag: String,
}

impl MockState {
    fn emit(&mut self, event: &RunnerEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn mint(&mut self) -> RunnerTaskId {
        self.next_id += 1;
        let id = RunnerTaskId::new(format!("rt-{}", self.next_id));
        self.history.push(id.clone());
        id
    }

    /// Pops the whole stack top-first, reporting each abort.
    fn abort_stack(&mut self) {
        while let Some(id) = self.stack.pop() {
            self.emit(&RunnerEvent::TaskAborted { id });
        }
    }

    fn open_root(&mut self, id: RunnerTaskId) {
        self.stack.push(id.clone());
        self.emit(&RunnerEvent::TaskCreated { id: id.clone() });
        self.emit(&RunnerEvent::TaskStarted { id });
    }

    fn message(&mut self, id: RunnerTaskId, message: RunnerMessage) {
        let completes = !message.partial && message.is_subtype(&self.completion_tag);
        self.messages
            .entry(id.clone())
            .or_default()
            .push(message.clone());
        self.emit(&RunnerEvent::Message {
            id: id.clone(),
            message,
        });
        if completes && self.stack.last() == Some(&id) {
            self.stack.pop();
        }
    }
}

/// Scripted in-memory runner.
pub struct MockRunner {
    state: Mutex<MockState>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::with_completion_tag(COMPLETION_SUBTYPE)
    }
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats messages with `tag` as the end of a task.
    pub fn with_completion_tag(tag: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MockState {
                completion_tag: tag.into(),
                ..MockState::default()
            }),
        }
    }

    /// Replays `messages` right after a task with `prompt` starts.
    ///
    /// A message with the completion subtype also pops the task, the way a
    /// real runner finishes a root.
    pub fn set_script(&self, prompt: impl Into<String>, messages: Vec<RunnerMessage>) {
        lock(&self.state).scripts.insert(prompt.into(), messages);
    }

    /// Makes the next `start_new_task` fail.
    pub fn fail_next_start(&self) {
        lock(&self.state).fail_next_start = true;
    }

    /// Pushes an identity onto the stack without emitting anything.
    pub fn push_stack(&self, id: RunnerTaskId) {
        let mut state = lock(&self.state);
        state.history.push(id.clone());
        state.stack.push(id);
    }

    /// Pops the stack without emitting anything.
    pub fn pop_stack(&self) -> Option<RunnerTaskId> {
        lock(&self.state).stack.pop()
    }

    pub fn stack(&self) -> Vec<RunnerTaskId> {
        lock(&self.state).stack.clone()
    }

    pub fn top(&self) -> Option<RunnerTaskId> {
        lock(&self.state).stack.last().cloned()
    }

    /// Prompts passed to `start_new_task`, in order.
    pub fn started_prompts(&self) -> Vec<String> {
        lock(&self.state).started.clone()
    }

    /// Identities passed to `resume_task`, in order.
    pub fn resumed(&self) -> Vec<RunnerTaskId> {
        lock(&self.state).resumed.clone()
    }

    /// Emits a finalized `say` from `id`.
    pub fn say(&self, id: &RunnerTaskId, subtype: &str, text: &str) {
        lock(&self.state).message(id.clone(), RunnerMessage::say(subtype, text));
    }

    /// Emits an `ask` from `id`.
    pub fn ask(&self, id: &RunnerTaskId, subtype: &str, text: &str) {
        lock(&self.state).message(id.clone(), RunnerMessage::ask(subtype, text));
    }

    /// Emits a streaming fragment from `id`.
    pub fn say_partial(&self, id: &RunnerTaskId, text: &str) {
        lock(&self.state).message(id.clone(), RunnerMessage::say("text", text).partial());
    }

    /// Reports that the user answered an ask.
    pub fn respond_to_ask(&self, id: &RunnerTaskId) {
        lock(&self.state).emit(&RunnerEvent::TaskAskResponded { id: id.clone() });
    }

    /// Spawns a sub-task under the current top of the stack.
    pub fn spawn_subtask(&self) -> RunnerTaskId {
        let mut state = lock(&self.state);
        let parent = state.stack.last().cloned();
        let child = state.mint();
        state.stack.push(child.clone());
        state.emit(&RunnerEvent::TaskCreated { id: child.clone() });
        if let Some(parent) = parent {
            state.emit(&RunnerEvent::TaskSpawned {
                parent,
                child: child.clone(),
            });
        }
        state.emit(&RunnerEvent::TaskStarted { id: child.clone() });
        child
    }

    /// Finishes the top task with a completion message.
    pub fn complete_top(&self, text: &str) -> Option<RunnerTaskId> {
        let mut state = lock(&self.state);
        let top = state.stack.last().cloned()?;
        let tag = state.completion_tag.clone();
        state.message(top.clone(), RunnerMessage::say(tag, text));
        Some(top)
    }

    /// Starts a task the way a human typing into the runner would.
    pub fn start_human_task(&self, prompt: &str) -> RunnerTaskId {
        let mut state = lock(&self.state);
        state.abort_stack();
        let id = state.mint();
        state
            .messages
            .insert(id.clone(), vec![RunnerMessage::say("text", prompt)]);
        state.open_root(id.clone());
        id
    }

    /// Resumes a task from history the way a human clicking it would.
    pub fn human_resume(&self, id: &RunnerTaskId) {
        let mut state = lock(&self.state);
        state.abort_stack();
        state.open_root(id.clone());
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RunnerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).subscribers.push(tx);
        rx
    }

    fn current_task_stack(&self) -> Vec<RunnerTaskId> {
        self.stack()
    }

    async fn start_new_task(&self, prompt: &str, images: &[String]) -> Result<RunnerTaskId> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next_start) {
            return Err(Error::runner("scripted start failure"));
        }
        state.abort_stack();
        let id = state.mint();
        state.started.push(prompt.to_string());
        state.open_root(id.clone());
        if !images.is_empty() {
            let greeting = RunnerMessage::say("user_feedback", prompt).with_images(images.to_vec());
            state.messages.entry(id.clone()).or_default().push(greeting);
        }
        let script = state.scripts.get(prompt).cloned().unwrap_or_default();
        for message in script {
            state.message(id.clone(), message);
        }
        Ok(id)
    }

    async fn resume_task(&self, id: &RunnerTaskId) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.history.contains(id) {
            return Err(Error::runner(format!("task {id} not in history")));
        }
        state.abort_stack();
        state.resumed.push(id.clone());
        state.open_root(id.clone());
        Ok(())
    }

    async fn is_task_in_history(&self, id: &RunnerTaskId) -> bool {
        lock(&self.state).history.contains(id)
    }

    async fn clear_current_task(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(id) = state.stack.pop() {
            state.emit(&RunnerEvent::TaskAborted { id });
        }
        Ok(())
    }

    async fn messages(&self, id: &RunnerTaskId) -> Result<Vec<RunnerMessage>> {
        Ok(lock(&self.state)
            .messages
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records hook commands instead of running them.
#[derive(Default)]
pub struct RecordingCommandRunner {
    commands: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `command` exit with status 1.
    pub fn fail_on(&self, command: impl Into<String>) {
        lock(&self.failing).insert(command.into());
    }

    /// Commands run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingCommandRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        lock(&self.commands).push(command.to_string());
        if lock(&self.failing).contains(command) {
            return Ok(CommandOutput {
                status: Some(1),
                stdout: String::new(),
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(CommandOutput {
            status: Some(0),
            ..CommandOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<RunnerEvent>) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_replays_script_and_pops_on_completion() {
        let runner = MockRunner::new();
        let mut rx = runner.subscribe();
        runner.set_script(
            "test",
            vec![
                RunnerMessage::say("text", "Hello"),
                RunnerMessage::say(COMPLETION_SUBTYPE, "Hello"),
            ],
        );

        let id = runner.start_new_task("test", &[]).await.unwrap();
        assert!(runner.stack().is_empty());
        assert_eq!(runner.started_prompts(), vec!["test"]);
        assert_eq!(runner.messages(&id).await.unwrap().len(), 2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], RunnerEvent::TaskCreated { id: id.clone() });
        assert_eq!(events[1], RunnerEvent::TaskStarted { id });
    }

    #[tokio::test]
    async fn test_starting_aborts_previous_stack_top_first() {
        let runner = MockRunner::new();
        let root = runner.start_new_task("a", &[]).await.unwrap();
        let child = runner.spawn_subtask();
        let mut rx = runner.subscribe();

        runner.start_new_task("b", &[]).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0], RunnerEvent::TaskAborted { id: child });
        assert_eq!(events[1], RunnerEvent::TaskAborted { id: root });
    }

    #[tokio::test]
    async fn test_resume_requires_history() {
        let runner = MockRunner::new();
        assert!(runner.resume_task(&"unknown".into()).await.is_err());

        let id = runner.start_new_task("a", &[]).await.unwrap();
        runner.clear_current_task().await.unwrap();
        assert!(runner.is_task_in_history(&id).await);
        runner.resume_task(&id).await.unwrap();
        assert_eq!(runner.stack(), vec![id.clone()]);
        assert_eq!(runner.resumed(), vec![id]);
    }

    #[tokio::test]
    async fn test_recording_runner_fails_on_demand() {
        let commands = RecordingCommandRunner::new();
        commands.fail_on("bad");
        assert!(commands.run("good").await.unwrap().success());
        assert!(!commands.run("bad").await.unwrap().success());
        assert_eq!(commands.commands(), vec!["good", "bad"]);
    }
}
