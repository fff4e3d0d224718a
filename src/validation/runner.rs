use std::process::Stdio;
use std::time::Duration;

use anvil_common::{Diagnostic, FailingCase, TestResult, ValidationResult, Validator, WorkspaceSnapshot};
use async_trait::async_trait;
use tokio::process::Command;

use super::parser;
use crate::config::CommandProfile;
use crate::workspace::WorkspaceStore;

/// Raw result of one validator process.
#[derive(Debug)]
pub enum CommandRun {
    Finished {
        success: bool,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        secs: u64,
    },
    /// The process could not be started or the checkout failed.
    Failed(String),
}

/// Runs the configured lint and test commands in a fresh checkout of the
/// snapshot under test. The live workspace tree is never touched.
#[derive(Clone)]
pub struct CommandValidator {
    store: WorkspaceStore,
    lint: CommandProfile,
    test: CommandProfile,
}

impl CommandValidator {
    pub fn new(store: WorkspaceStore, lint: CommandProfile, test: CommandProfile) -> Self {
        Self { store, lint, test }
    }

    /// Check out `snapshot` into a temporary directory and run `profile` there.
    pub async fn run_profile(&self, profile: &CommandProfile, snapshot: &WorkspaceSnapshot) -> CommandRun {
        let dir = match tempfile::Builder::new().prefix("anvil-check-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return CommandRun::Failed(format!("failed to create checkout dir: {}", e)),
        };
        if let Err(e) = self.store.checkout(snapshot, dir.path()) {
            return CommandRun::Failed(format!("failed to check out snapshot: {}", e));
        }

        tracing::debug!(
            command = %profile.display(),
            snapshot = snapshot.id().short(),
            "running validator command"
        );

        let child = Command::new(&profile.program)
            .args(&profile.args)
            .current_dir(dir.path())
            .env("ANVIL_SNAPSHOT_ID", snapshot.id().as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return CommandRun::Failed(format!(
                    "failed to spawn '{}': {}",
                    profile.display(),
                    e
                ));
            }
        };

        let deadline = Duration::from_secs(profile.timeout_secs);
        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandRun::Finished {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Ok(Err(e)) => CommandRun::Failed(format!("failed to wait for '{}': {}", profile.display(), e)),
            // Dropping the future drops the child, and kill_on_drop reaps it.
            Err(_) => CommandRun::TimedOut {
                secs: profile.timeout_secs,
            },
        }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate_static(&self, snapshot: &WorkspaceSnapshot) -> ValidationResult {
        match self.run_profile(&self.lint, snapshot).await {
            CommandRun::Finished {
                success,
                exit_code,
                stdout,
                stderr,
            } => parser::static_result(success, exit_code, &stdout, &stderr),
            CommandRun::TimedOut { secs } => ValidationResult::timed_out("static check", secs),
            CommandRun::Failed(reason) => {
                tracing::warn!(%reason, "static check could not run");
                ValidationResult::fail(vec![Diagnostic::synthetic("runner", &reason)])
            }
        }
    }

    async fn run_tests(&self, snapshot: &WorkspaceSnapshot) -> TestResult {
        match self.run_profile(&self.test, snapshot).await {
            CommandRun::Finished {
                success,
                exit_code,
                stdout,
                stderr,
            } => parser::test_result(success, exit_code, &stdout, &stderr),
            CommandRun::TimedOut { secs } => TestResult::timed_out(secs),
            CommandRun::Failed(reason) => {
                tracing::warn!(%reason, "test suite could not run");
                TestResult::fail(vec![FailingCase {
                    name: "runner".to_string(),
                    message: reason,
                    stack: None,
                }])
            }
        }
    }
}
