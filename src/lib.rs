// dssh - SSH to many hosts through jump chains
//
// Resolves host aliases against the tool config and the system SSH client
// config, then runs a command, script, module, transfer or interactive shell
// on each target in order.

pub mod executor;
pub mod inventory;
pub mod logging;
pub mod output;

pub use executor::{
    Action, ActionSpec, FailurePolicy, Orchestrator, RunSummary, SshRunner, Task, TaskBuilder,
    TaskOutcome, TaskRunner,
};
pub use inventory::{AliasTable, Host, Overlay, Resolver, SshConfig};
pub use output::{DsshError, TerminalOutput};

/// Version of the dssh tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{ActionSpec, FailurePolicy, Orchestrator, Task, TaskBuilder};
    pub use crate::inventory::{AliasTable, Host, Overlay, Resolver, SshConfig};
    pub use crate::output::{DsshError, TerminalOutput};
}
