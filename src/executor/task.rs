// Task construction: one resolved target plus exactly one action

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::inventory::Host;
use crate::output::errors::DsshError;

/// The single thing a task does on its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Inline command text
    Command(String),
    /// Local script file, read when the task was built
    Script { path: PathBuf, content: String },
    /// Named module resolved to `<modules dir>/<name>.sh`
    Module {
        name: String,
        path: PathBuf,
        content: String,
    },
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
    Shell,
}

impl Action {
    /// Text to execute remotely, for the command-like actions
    pub fn remote_command(&self) -> Option<&str> {
        match self {
            Action::Command(command) => Some(command),
            Action::Script { content, .. } | Action::Module { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Command(_) => "command",
            Action::Script { .. } => "script",
            Action::Module { .. } => "module",
            Action::Upload { .. } => "upload",
            Action::Download { .. } => "download",
            Action::Shell => "shell",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command(command) => write!(f, "command: {}", command),
            Action::Script { path, .. } | Action::Module { path, .. } => {
                write!(f, "script: {}", path.display())
            }
            Action::Upload { local, remote } => write!(f, "put: {} => {}", local.display(), remote),
            Action::Download { remote, local } => {
                write!(f, "get: {} => {}", remote, local.display())
            }
            Action::Shell => f.write_str("shell"),
        }
    }
}

/// What the operator asked for, before any file is read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSpec {
    pub command: Option<String>,
    pub script: Option<PathBuf>,
    pub module: Option<String>,
    /// (local source, remote destination)
    pub upload: Option<(PathBuf, String)>,
    /// (remote source, local destination)
    pub download: Option<(String, PathBuf)>,
}

impl ActionSpec {
    pub fn shell() -> Self {
        ActionSpec::default()
    }

    pub fn command(command: impl Into<String>) -> Self {
        ActionSpec {
            command: Some(command.into()),
            ..Default::default()
        }
    }
}

/// One (target, action) pair scheduled for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Zero-based position in the run
    pub index: usize,
    pub target: Host,
    pub action: Action,
    /// Annotation for the progress banner
    pub message: String,
}

/// Builds tasks for a run, reading scripts and modules eagerly
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    modules_dir: PathBuf,
    spec: ActionSpec,
}

impl TaskBuilder {
    pub fn new(modules_dir: impl Into<PathBuf>, spec: ActionSpec) -> Self {
        TaskBuilder {
            modules_dir: modules_dir.into(),
            spec,
        }
    }

    /// Build one task per target, in order, stopping at the first failure
    pub fn build_all(&self, targets: Vec<Host>) -> Result<Vec<Task>, DsshError> {
        targets
            .into_iter()
            .enumerate()
            .map(|(index, target)| self.build(index, target))
            .collect()
    }

    pub fn build(&self, index: usize, target: Host) -> Result<Task, DsshError> {
        let action = self.resolve_action(&target)?;
        let message = message_for(&target, &action);
        debug!(index, target = %target.summary(), action = action.kind(), "built task");

        Ok(Task {
            index,
            target,
            action,
            message,
        })
    }

    fn resolve_action(&self, target: &Host) -> Result<Action, DsshError> {
        let spec = &self.spec;

        if let Some(command) = spec.command.as_deref().filter(|c| !c.is_empty()) {
            return Ok(Action::Command(command.to_string()));
        }

        if let Some(path) = spec.script.as_deref().filter(|p| !p.as_os_str().is_empty()) {
            let content = read_script(path, target)?;
            return Ok(Action::Script {
                path: path.to_path_buf(),
                content,
            });
        }

        if let Some(name) = spec.module.as_deref().filter(|m| !m.is_empty()) {
            let path = self.modules_dir.join(format!("{}.sh", name));
            let content = read_script(&path, target)?;
            return Ok(Action::Module {
                name: name.to_string(),
                path,
                content,
            });
        }

        if let Some((remote, local)) = &spec.download {
            return Ok(Action::Download {
                remote: remote.clone(),
                local: local.clone(),
            });
        }

        if let Some((local, remote)) = &spec.upload {
            return Ok(Action::Upload {
                local: local.clone(),
                remote: remote.clone(),
            });
        }

        Ok(Action::Shell)
    }
}

fn read_script(path: &Path, target: &Host) -> Result<String, DsshError> {
    std::fs::read_to_string(path).map_err(|e| {
        DsshError::io(
            format!("Failed to read script for {}: {}", target.summary(), e),
            path,
        )
    })
}

/// `jump: <hops>` then `command: ...` or `script: ...`
fn message_for(target: &Host, action: &Action) -> String {
    let mut parts = Vec::new();
    if !target.jump_chain().is_empty() {
        parts.push(format!("jump: {}", target.jump_string()));
    }
    match action {
        Action::Command(_) | Action::Script { .. } | Action::Module { .. } => {
            parts.push(action.to_string())
        }
        _ => {}
    }
    parts.join(" ")
}
