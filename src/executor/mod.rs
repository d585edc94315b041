// Executor module - task building and execution over SSH

use crate::output::errors::DsshError;
use async_trait::async_trait;

pub mod agent;
pub mod auth;
pub mod orchestrator;
pub mod sftp;
pub mod shell;
pub mod ssh;
pub mod task;

pub use auth::{Authenticator, Prompter, TerminalPrompter};
pub use orchestrator::{FailurePolicy, Orchestrator, RunSummary, TaskFailure};
pub use ssh::{SessionChain, SshRunner};
pub use task::{Action, ActionSpec, Task, TaskBuilder};

/// How a task that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Shell sessions and transfers
    Done,
    /// Remote exit status of a command, script or module
    Exited(i32),
}

/// Executes one task against its target
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &Task) -> Result<TaskOutcome, DsshError>;
}
