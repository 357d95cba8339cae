//! # tether-core
//!
//! Scheduling core for Tether.
//!
//! This crate provides:
//! - A lease-based busy tracker for a runner that never reports idleness
//! - The coordinator that maps runner identities to logical tasks
//! - The dual-loop scheduler shared by automated tasks and a human operator
//! - The task queue, per-task message lifecycle and side-effect hooks
//! - Configuration loading and in-memory test doubles

pub mod channel;
mod config;
pub mod coordinator;
pub mod hooks;
pub mod lease;
pub mod lifecycle;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod testing;
mod utils;
pub mod waiter;

pub use channel::{Next, Receiver, Sender, channel};
pub use config::{CONFIG_CANDIDATES, ConfigError, TetherConfig};
pub use coordinator::{CoordinatorEvent, OwnerKind, RunnerCoordinator};
pub use hooks::{CommandOutput, CommandRunner, HookKind, ShellCommandRunner, TaskHooks, run_hook};
pub use lease::{ExpiryHandler, LeaseToken, LeaseTracker, Preemption};
pub use lifecycle::{LifecycleOutcome, StatusHook, TaskLifecycle};
pub use queue::{QueueEvent, TaskQueue, TaskRef};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use task::{Attempt, StatusChange, Task, TaskSpec};
pub use waiter::{Waiter, Waiters};
