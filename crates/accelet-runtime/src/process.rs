//! Process-backed task
//!
//! Runs the program configured for a workload as a child process. Exit
//! status 0 means success; anything else is a failure whose stderr becomes
//! the task's diagnostics.

use accelet_core::{Task, TaskId, TaskState, WorkloadConfig};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, error, info};

/// Environment variable carrying the task id
pub const TASK_ID_ENV: &str = "ACCELET_TASK_ID";
/// Environment variable carrying the workload
pub const WORKLOAD_ENV: &str = "ACCELET_WORKLOAD";

/// A task that runs an external program
pub struct ProcessTask {
    id: TaskId,
    config: WorkloadConfig,
    diagnostics: Mutex<String>,
}

impl ProcessTask {
    pub fn new(id: TaskId, config: WorkloadConfig) -> Self {
        Self {
            id,
            config,
            diagnostics: Mutex::new(String::new()),
        }
    }

    /// Build the command for this task
    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        cmd.env(TASK_ID_ENV, self.id.to_string());
        cmd.env(WORKLOAD_ENV, &self.id.workload);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        cmd
    }

    fn set_diagnostics(&self, message: String) {
        if let Ok(mut diagnostics) = self.diagnostics.lock() {
            *diagnostics = message;
        }
    }
}

impl Task for ProcessTask {
    fn task_id(&self) -> &TaskId {
        &self.id
    }

    fn workload(&self) -> &str {
        &self.id.workload
    }

    fn run(&self) -> TaskState {
        info!(
            task_id = %self.id,
            command = %self.config.command.display(),
            "Starting task process"
        );

        match self.build_command().output() {
            Ok(output) if output.status.success() => {
                debug!(task_id = %self.id, "Task process exited cleanly");
                TaskState::ExitedWithSuccess
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                self.set_diagnostics(format!("{}: {}", output.status, stderr.trim()));
                TaskState::ExitedWithFailure
            }
            Err(e) => {
                error!(
                    task_id = %self.id,
                    error = %e,
                    "Failed to spawn task process"
                );
                self.set_diagnostics(format!(
                    "Failed to spawn {}: {}",
                    self.config.command.display(),
                    e
                ));
                TaskState::ExitedWithFailure
            }
        }
    }

    fn diagnostics(&self) -> String {
        self.diagnostics
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}
