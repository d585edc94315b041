// Sequential task orchestration with a continue-on-failure policy

use tracing::{debug, error, warn};

use super::{Task, TaskOutcome, TaskRunner};
use crate::output::errors::DsshError;
use crate::output::TerminalOutput;

/// What to do when a task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the run and return the failing task's error
    #[default]
    Abort,
    /// Report the error and move on to the next task
    Continue,
}

impl FailurePolicy {
    /// The operator's force flag selects [`FailurePolicy::Continue`]
    pub fn from_force(force: bool) -> Self {
        if force {
            FailurePolicy::Continue
        } else {
            FailurePolicy::Abort
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub index: usize,
    pub target: String,
    pub message: String,
}

/// Outcome of a run that was not aborted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<TaskFailure>,
    /// (task index, remote exit status) for non-zero statuses
    pub nonzero_exits: Vec<(usize, i32)>,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

pub struct Orchestrator<R> {
    runner: R,
    policy: FailurePolicy,
    parallel: usize,
    output: TerminalOutput,
}

impl<R: TaskRunner> Orchestrator<R> {
    pub fn new(runner: R, policy: FailurePolicy) -> Self {
        Orchestrator {
            runner,
            policy,
            parallel: 1,
            output: TerminalOutput::new(),
        }
    }

    pub fn with_output(mut self, output: TerminalOutput) -> Self {
        self.output = output;
        self
    }

    /// Accepted for compatibility; execution stays sequential
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run every task in index order, one at a time
    pub async fn run(&self, tasks: &[Task]) -> Result<RunSummary, DsshError> {
        if tasks.is_empty() {
            return Err(DsshError::NoTargets);
        }
        if self.parallel > 1 {
            warn!(
                parallel = self.parallel,
                "parallel execution is advisory, running tasks sequentially"
            );
        }

        let mut ordered: Vec<&Task> = tasks.iter().collect();
        ordered.sort_by_key(|task| task.index);

        let total = ordered.len();
        let mut summary = RunSummary {
            total,
            ..Default::default()
        };

        for task in ordered {
            self.output.print_banner(task, total);
            debug!(index = task.index, target = %task.target.summary(), "starting task");

            match self.runner.run(task).await {
                Ok(TaskOutcome::Exited(code)) if code != 0 => {
                    warn!(target = %task.target.summary(), code, "remote command exited non-zero");
                    self.output.print_exit_status(task, code);
                    summary.nonzero_exits.push((task.index, code));
                    summary.completed += 1;
                }
                Ok(_) => summary.completed += 1,
                Err(err) => match self.policy {
                    FailurePolicy::Continue => {
                        warn!(index = task.index, target = %task.target.summary(), "task failed, continuing");
                        self.output.print_task_error(task, total, &err);
                        summary.failed.push(TaskFailure {
                            index: task.index,
                            target: task.target.summary(),
                            message: console::strip_ansi_codes(&err.to_string())
                                .trim_end()
                                .to_string(),
                        });
                    }
                    FailurePolicy::Abort => {
                        error!(index = task.index, target = %task.target.summary(), "task failed, aborting run");
                        return Err(err);
                    }
                },
            }
        }

        self.output.print_recap(&summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Action, ActionSpec, TaskBuilder};
    use crate::inventory::Host;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn text(&self) -> String {
            let raw = String::from_utf8_lossy(&self.0.lock()).to_string();
            console::strip_ansi_codes(&raw).to_string()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Records attempts and plays back a scripted result per address
    #[derive(Default)]
    struct ScriptedRunner {
        results: HashMap<String, Result<TaskOutcome, String>>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn failing(address: &str) -> Self {
            let mut runner = ScriptedRunner::default();
            runner
                .results
                .insert(address.to_string(), Err("connection refused".to_string()));
            runner
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().clone()
        }
    }

    #[async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(&self, task: &Task) -> Result<TaskOutcome, DsshError> {
            self.attempts.lock().push(task.target.address.clone());
            match self.results.get(&task.target.address) {
                Some(Ok(outcome)) => Ok(*outcome),
                Some(Err(message)) => Err(DsshError::ssh(task.target.summary(), message.clone())),
                None => Ok(TaskOutcome::Exited(0)),
            }
        }
    }

    fn tasks(addresses: &[&str]) -> Vec<Task> {
        let hosts = addresses
            .iter()
            .map(|a| Host::new(*a).with_user("ops").with_port(22))
            .collect();
        TaskBuilder::new("/tmp", ActionSpec::command("uptime"))
            .build_all(hosts)
            .unwrap()
    }

    fn orchestrator(runner: ScriptedRunner, policy: FailurePolicy) -> (Orchestrator<ScriptedRunner>, SharedBuf) {
        let buf = SharedBuf::default();
        let output = TerminalOutput::with_writer(Box::new(buf.clone()), 80);
        (Orchestrator::new(runner, policy).with_output(output), buf)
    }

    #[tokio::test]
    async fn test_continue_past_failure() {
        let (orch, buf) = orchestrator(ScriptedRunner::failing("a"), FailurePolicy::from_force(true));

        let summary = orch.run(&tasks(&["a", "b"])).await.unwrap();

        assert_eq!(orch.runner().attempts(), vec!["a", "b"]);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].index, 0);
        assert_eq!(summary.failed[0].target, "ops@a:22");
        assert!(summary.failed[0].message.contains("connection refused"));

        let out = buf.text();
        let first = out.find("[1 / 2] ops@a:22").unwrap();
        let error = out.find("[ERROR] [1 / 2] ops@a:22").unwrap();
        let second = out.find("[2 / 2] ops@b:22").unwrap();
        assert!(first < error && error < second);
        assert!(out.contains("1 of 2 tasks failed"));
    }

    #[tokio::test]
    async fn test_abort_on_failure() {
        let (orch, buf) = orchestrator(ScriptedRunner::failing("a"), FailurePolicy::from_force(false));

        let err = orch.run(&tasks(&["a", "b"])).await.unwrap_err();

        assert!(matches!(err, DsshError::Ssh { ref message, .. } if message == "connection refused"));
        assert_eq!(orch.runner().attempts(), vec!["a"]);
        assert!(!buf.text().contains("[2 / 2]"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let mut runner = ScriptedRunner::default();
        runner.results.insert("a".into(), Ok(TaskOutcome::Exited(3)));
        let (orch, buf) = orchestrator(runner, FailurePolicy::Abort);

        let summary = orch.run(&tasks(&["a", "b"])).await.unwrap();

        assert_eq!(summary.completed, 2);
        assert!(!summary.has_failures());
        assert_eq!(summary.nonzero_exits, vec![(0, 3)]);
        assert!(buf.text().contains("exited with status 3"));
    }

    #[tokio::test]
    async fn test_runs_in_index_order() {
        let (orch, _) = orchestrator(ScriptedRunner::default(), FailurePolicy::Abort);
        let mut shuffled = tasks(&["a", "b", "c"]);
        shuffled.reverse();

        orch.run(&shuffled).await.unwrap();
        assert_eq!(orch.runner().attempts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_no_tasks() {
        let (orch, _) = orchestrator(ScriptedRunner::default(), FailurePolicy::Continue);
        assert!(matches!(orch.run(&[]).await, Err(DsshError::NoTargets)));
    }

    #[tokio::test]
    async fn test_banner_carries_message() {
        let (orch, buf) = orchestrator(ScriptedRunner::default(), FailurePolicy::Abort);
        let tasks = tasks(&["a"]);
        assert_eq!(tasks[0].action, Action::Command("uptime".into()));

        orch.with_parallel(4).run(&tasks).await.unwrap();
        assert!(buf.text().contains("-----> [1 / 1] ops@a:22 command: uptime <-----"));
    }
}
