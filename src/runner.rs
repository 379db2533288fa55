use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use reactor_agent::prebuilt::{CommandResult, CommandRunner};
use reactor_core::NodeError;

/// Runs plan commands through `sh -c` in the current directory.
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        command: &'a str,
    ) -> BoxFuture<'a, std::result::Result<CommandResult, NodeError>> {
        Box::pin(async move {
            debug!(command, "Running shell command");
            let result = tokio::time::timeout(self.timeout, async {
                tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .kill_on_drop(true)
                    .output()
                    .await
            })
            .await;

            match result {
                Ok(Ok(output)) => Ok(CommandResult {
                    command: command.to_string(),
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                }),
                Ok(Err(e)) => Err(NodeError::new(format!("failed to start `{}`: {}", command, e))),
                Err(_) => Err(NodeError::retryable(format!(
                    "`{}` timed out after {}s",
                    command,
                    self.timeout.as_secs()
                ))),
            }
        })
    }
}
