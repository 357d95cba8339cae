//! # tether-proto
//!
//! Shared types, error definitions, and traits for the Tether scheduler.
//!
//! This crate provides the foundational abstractions used across all Tether crates,
//! including:
//! - Task identity and the task status state machine
//! - Runner task identities, runner lifecycle events and the `Runner` trait
//! - Messages routed from the runner to a task's message stream
//! - Common error types

mod error;
mod message;
mod runner;
mod task;

pub use error::{Error, Result};
pub use message::TaskMessage;
pub use runner::{MessageKind, Runner, RunnerEvent, RunnerMessage, RunnerTaskId};
pub use task::{TaskId, TaskStatus};
