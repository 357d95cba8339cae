//! Side-effect commands attached to a task's lifecycle.
//!
//! Each hook is an optional shell command. The scheduler runs `start` (or
//! `resume`) before handing a task to the runner, `complete` once the root
//! finishes, and `pause` when the task is aborted or stalls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tether_proto::{Error, Result, TaskId};
use tracing::{debug, info, warn};

/// Which lifecycle point a hook belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Start,
    Resume,
    Complete,
    Pause,
}

impl HookKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HookKind::Start => "start",
            HookKind::Resume => "resume",
            HookKind::Complete => "complete",
            HookKind::Pause => "pause",
        }
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional shell commands for each lifecycle point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskHooks {
    pub start: Option<String>,
    pub resume: Option<String>,
    pub complete: Option<String>,
    pub pause: Option<String>,
}

impl TaskHooks {
    /// Returns the command configured for `kind`, ignoring blank strings.
    pub fn command(&self, kind: HookKind) -> Option<&str> {
        let cmd = match kind {
            HookKind::Start => self.start.as_deref(),
            HookKind::Resume => self.resume.as_deref(),
            HookKind::Complete => self.complete.as_deref(),
            HookKind::Pause => self.pause.as_deref(),
        };
        cmd.filter(|c| !c.trim().is_empty())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Executes hook commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion. Spawn failures are errors; a non-zero
    /// exit is reported through [`CommandOutput::status`].
    async fn run(&self, command: &str) -> Result<CommandOutput>;
}

/// Runs hooks through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellCommandRunner {
    working_dir: Option<PathBuf>,
}

impl ShellCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every command from `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| Error::Hook {
            command: command.to_string(),
            reason: format!("failed to spawn: {e}"),
        })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs the hook of `kind` for a task, if one is configured.
///
/// A non-zero exit is turned into [`Error::Hook`] carrying stderr.
pub async fn run_hook(
    runner: &dyn CommandRunner,
    hooks: &TaskHooks,
    kind: HookKind,
    task_id: &TaskId,
) -> Result<()> {
    let Some(command) = hooks.command(kind) else {
        debug!(task_id = %task_id, hook = %kind, "No hook configured");
        return Ok(());
    };

    info!(task_id = %task_id, hook = %kind, command, "Running task hook");
    let output = runner.run(command).await?;
    if output.success() {
        return Ok(());
    }

    let reason = match output.status {
        Some(code) => format!("exited with status {code}: {}", output.stderr.trim()),
        None => "terminated by signal".to_string(),
    };
    warn!(task_id = %task_id, hook = %kind, %reason, "Task hook failed");
    Err(Error::Hook {
        command: command.to_string(),
        reason,
    })
}
