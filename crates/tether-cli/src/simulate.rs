//! `tether simulate`: run a scripted scenario against the in-memory runner.
//!
//! ```yaml
//! config:
//!   automated_timeout_secs: 5
//! human:
//!   prompt: reviewing yesterday's diff
//!   duration_secs: 3
//! tasks:
//!   - id: greet
//!     prompt: say hello
//!     hooks:
//!       complete: echo greeted
//!     script:
//!       - say: Hello
//!       - complete: Said hello
//!   - prompt: needs a human
//!     script:
//!       - ask: Which branch?
//! ```
//!
//! A task whose script has no `complete` step stalls and ends up `asking`
//! once its lease times out.

use anyhow::{Context, Result, bail};
use clap::Parser;
use colored::Colorize;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_core::testing::{MockRunner, RecordingCommandRunner};
use tether_core::{CommandRunner, Scheduler, ShellCommandRunner, Task, TaskSpec, TetherConfig};
use tether_proto::{RunnerMessage, TaskStatus};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Scenario file
    pub scenario: PathBuf,

    /// Execute hooks with `sh -c` instead of only recording them
    #[arg(long)]
    pub run_hooks: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Scenario {
    /// Overrides the config file when present.
    #[serde(default)]
    config: Option<TetherConfig>,

    #[serde(default)]
    human: Option<HumanSession>,

    tasks: Vec<ScenarioTask>,

    /// Wall-clock budget for the whole run.
    #[serde(default = "default_budget_secs")]
    budget_secs: u64,
}

fn default_budget_secs() -> u64 {
    120
}

/// A human session open when the scenario starts.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HumanSession {
    prompt: String,
    duration_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ScenarioTask {
    #[serde(flatten)]
    spec: TaskSpec,

    #[serde(default)]
    script: Vec<ScriptStep>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScriptStep {
    Say(String),
    Ask(String),
    Complete(String),
}

impl ScriptStep {
    fn to_message(&self, completion_tag: &str) -> RunnerMessage {
        match self {
            ScriptStep::Say(text) => RunnerMessage::say("text", text.as_str()),
            ScriptStep::Ask(text) => RunnerMessage::ask("followup", text.as_str()),
            ScriptStep::Complete(text) => RunnerMessage::say(completion_tag, text.as_str()),
        }
    }
}

/// Final state of a simulation.
struct Report {
    tasks: Vec<Task>,
    hooks: Vec<String>,
    settled: bool,
}

pub async fn execute(args: SimulateArgs, config_path: Option<&Path>) -> Result<()> {
    let text = std::fs::read_to_string(&args.scenario)
        .with_context(|| format!("Failed to read scenario {}", args.scenario.display()))?;
    let mut scenario: Scenario = serde_yaml::from_str(&text)
        .with_context(|| format!("Invalid scenario {}", args.scenario.display()))?;

    let config = match scenario.config.take() {
        Some(config) => {
            config.validate().context("Invalid scenario config")?;
            config
        }
        None => {
            let root = std::env::current_dir().context("Failed to read current directory")?;
            crate::load_config(config_path, &root)?
        }
    };

    println!("Scenario: {}", args.scenario.display().to_string().bold());
    let report = run(scenario, config, args.run_hooks).await?;
    print_report(&report);

    if !report.settled {
        bail!("scenario did not settle within its budget");
    }
    Ok(())
}

async fn run(scenario: Scenario, config: TetherConfig, run_hooks: bool) -> Result<Report> {
    let runner = Arc::new(MockRunner::with_completion_tag(config.completion_tag.clone()));
    let recorder = Arc::new(RecordingCommandRunner::new());
    let commands: Arc<dyn CommandRunner> = if run_hooks {
        Arc::new(ShellCommandRunner::new())
    } else {
        recorder.clone()
    };

    let mut seen = std::collections::HashSet::new();
    for task in &scenario.tasks {
        if !seen.insert(task.spec.prompt.as_str()) {
            warn!(prompt = %task.spec.prompt, "Duplicate prompt; the last script wins");
        }
        let script = task
            .script
            .iter()
            .map(|step| step.to_message(&config.completion_tag))
            .collect();
        runner.set_script(task.spec.prompt.clone(), script);
    }

    let budget = Duration::from_secs(scenario.budget_secs);
    let scheduler = Scheduler::new(runner.clone(), commands, config);

    // Opened before the loops start so the scheduler adopts it on startup.
    if let Some(human) = scenario.human {
        let root = runner.start_human_task(&human.prompt);
        info!(runner_id = %root, "Human session opened");
        let runner = Arc::clone(&runner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(human.duration_secs)).await;
            runner.complete_top("human session finished");
        });
    }
    let handle = scheduler.spawn();

    let queue = Arc::clone(scheduler.queue());
    let mut events = queue.subscribe();
    let refs: Vec<_> = scenario
        .tasks
        .into_iter()
        .map(|task| queue.enqueue(task.spec))
        .collect();

    let all_settled = || {
        refs.iter()
            .all(|r| queue.status(*r).is_none_or(TaskStatus::is_terminal))
    };
    let settled = tokio::time::timeout(budget, async {
        while !all_settled() {
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await
    .is_ok();

    handle.shutdown().await;

    Ok(Report {
        tasks: refs.iter().filter_map(|r| queue.get(*r)).collect(),
        hooks: if run_hooks { Vec::new() } else { recorder.commands() },
        settled,
    })
}

fn print_report(report: &Report) {
    for task in &report.tasks {
        let status = task.status();
        let marker = match status {
            TaskStatus::Completed => "✓".green().bold(),
            TaskStatus::Asking => "?".yellow().bold(),
            TaskStatus::Aborted | TaskStatus::Error => "✗".red().bold(),
            _ => "•".dimmed(),
        };
        let label = match status {
            TaskStatus::Completed => status.as_str().green(),
            TaskStatus::Asking => status.as_str().yellow(),
            TaskStatus::Aborted | TaskStatus::Error => status.as_str().red(),
            _ => status.as_str().normal(),
        };
        let messages = task.log.iter().filter(|m| m.runner_message().is_some()).count();
        println!("  {marker} {:<16} {:<10} {messages} message(s)", task.id.as_str(), label);
    }

    if !report.hooks.is_empty() {
        println!("Hooks (recorded, not executed):");
        for command in &report.hooks {
            println!("  {}", command.dimmed());
        }
    }

    if !report.settled {
        println!("{}", "Some tasks were still pending when the budget ran out".yellow());
    }
}
