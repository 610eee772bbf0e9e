use crate::error::Result;
use crate::provider::{CommandResult, CommandSpec, Environment};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Runs shell commands inside a leased environment.
///
/// A non-zero exit is reported in the [`CommandResult`], not raised; deciding
/// what an exit code means is the caller's job.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    blocking_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(blocking_timeout: Duration) -> Self {
        Self { blocking_timeout }
    }

    /// Run to completion or until the hard timeout, whichever comes first
    pub async fn run_blocking(
        &self,
        env: &dyn Environment,
        command: &CommandSpec,
    ) -> Result<CommandResult> {
        info!(sandbox_id = %env.id(), command = %command.display(), "Running command");

        match tokio::time::timeout(self.blocking_timeout, env.run(command)).await {
            Ok(result) => {
                let result = result?;
                info!(
                    sandbox_id = %env.id(),
                    exit_code = ?result.exit_code,
                    "Command finished"
                );
                Ok(result)
            }
            Err(_) => {
                warn!(
                    sandbox_id = %env.id(),
                    timeout_secs = self.blocking_timeout.as_secs(),
                    "Command exceeded hard timeout"
                );
                Ok(CommandResult::timed_out())
            }
        }
    }

    /// Submit a command on a background task and return immediately.
    ///
    /// The process is expected to outlive the pipeline; its exit is never
    /// observed here. Submission failures are logged and otherwise dropped.
    pub fn run_detached(&self, env: Arc<dyn Environment>, command: CommandSpec) -> CommandResult {
        tokio::spawn(async move {
            match env.spawn(&command).await {
                Ok(detached) => info!(
                    sandbox_id = %env.id(),
                    command_id = %detached.command_id,
                    command = %command.display(),
                    "Detached command started"
                ),
                Err(e) => warn!(
                    sandbox_id = %env.id(),
                    command = %command.display(),
                    "Failed to start detached command: {}",
                    e
                ),
            }
        });

        CommandResult::detached()
    }
}
