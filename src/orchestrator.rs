//! Drives one project from raw files to a live preview URL.
//!
//! `Provisioning -> Staging -> Installing -> Starting -> Verifying -> Succeeded`,
//! with a transition to `Failed(kind)` possible from every stage. Each run
//! owns its environment exclusively and shares nothing with other runs.

use crate::error::{ErrorKind, Result, SandboxError};
use crate::project::{normalize, ManifestTransformer, NormalizedFileSet, ProjectFileSet};
use crate::provider::{
    CommandResult, CommandSpec, Completion, Environment, EnvironmentSpec, ProviderError,
    SandboxProvider,
};
use crate::readiness::{Readiness, ReadinessVerifier};
use crate::release::ReleaseKey;
use crate::runner::ProcessRunner;
use crate::staging::stage_files;
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Provisioning,
    Staging,
    Installing,
    Starting,
    Verifying,
    Succeeded,
    Failed(ErrorKind),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Provisioning => f.write_str("provisioning"),
            Stage::Staging => f.write_str("staging"),
            Stage::Installing => f.write_str("installing"),
            Stage::Starting => f.write_str("starting"),
            Stage::Verifying => f.write_str("verifying"),
            Stage::Succeeded => f.write_str("succeeded"),
            Stage::Failed(kind) => write!(f, "failed({})", kind),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub environment: EnvironmentSpec,
    pub install_command: String,
    pub start_command: String,
    /// Hard ceiling on the blocking install
    pub install_timeout: Duration,
    pub manifest: ManifestTransformer,
    /// Release the environment when a run is dropped before finishing
    pub teardown_on_abort: bool,
    /// Release the environment when a run fails after provisioning
    pub teardown_on_failure: bool,
    /// Signs the release tokens handed out with each launch
    pub release_key: ReleaseKey,
}

#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub environment_id: String,
    pub readiness: Readiness,
    pub install_output: String,
    /// Must be presented to [`Orchestrator::release`] for this environment
    pub release_token: String,
}

impl LaunchOutcome {
    pub fn preview_url(&self) -> &Url {
        self.readiness.url()
    }
}

pub struct Orchestrator {
    provider: Arc<dyn SandboxProvider>,
    settings: OrchestratorSettings,
    runner: ProcessRunner,
    verifier: ReadinessVerifier,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        settings: OrchestratorSettings,
        verifier: ReadinessVerifier,
    ) -> Self {
        let runner = ProcessRunner::new(settings.install_timeout);
        Self {
            provider,
            settings,
            runner,
            verifier,
        }
    }

    /// Run the whole pipeline against a freshly provisioned environment
    pub async fn launch(&self, files: ProjectFileSet) -> Result<LaunchOutcome> {
        // Pure transforms first: a bad file set never costs a remote call
        let prepared = self.prepare(&files)?;

        enter(Stage::Provisioning, None);
        let lease = match self.provision().await {
            Ok(lease) => lease,
            Err(err) => {
                fail(None, &err);
                return Err(err);
            }
        };

        let env = lease.env.clone();
        let result = self.drive(env.clone(), &prepared).await;

        match &result {
            Ok(outcome) => {
                enter(Stage::Succeeded, Some(env.id()));
                info!(
                    sandbox_id = %outcome.environment_id,
                    preview_url = %outcome.preview_url(),
                    verified = outcome.readiness.is_verified(),
                    "Sandbox ready"
                );
            }
            Err(err) => {
                fail(Some(env.id()), err);
                if self.settings.teardown_on_failure {
                    if let Err(e) = env.release().await {
                        warn!(sandbox_id = %env.id(), "Failed to release environment: {}", e);
                    }
                }
            }
        }

        lease.disarm();
        result
    }

    /// Explicitly release an environment before its TTL runs out.
    ///
    /// `token` must be the release token issued when the environment was
    /// launched; ids this service never handed out are refused.
    pub async fn release(&self, environment_id: &str, token: &str) -> Result<()> {
        if !self.settings.release_key.verify(environment_id, token) {
            warn!(sandbox_id = %environment_id, "Release refused, token does not match");
            return Err(SandboxError::SecurityViolation(format!(
                "release token does not match sandbox {}",
                environment_id
            )));
        }

        self.provider
            .release(environment_id)
            .await
            .map_err(SandboxError::Provider)?;
        info!(
            sandbox_id = %environment_id,
            provider = self.provider.name(),
            "Environment released"
        );
        Ok(())
    }

    /// Create on a separate task so a finished create is always leased, even
    /// when the caller goes away while it is in flight.
    async fn provision(&self) -> Result<EnvironmentLease> {
        let provider = self.provider.clone();
        let spec = self.settings.environment.clone();
        let armed = self.settings.teardown_on_abort;

        let task = tokio::spawn(async move {
            let env = provider.create(&spec).await?;
            Ok::<_, ProviderError>(EnvironmentLease::new(env, armed))
        });

        match task.await {
            Ok(created) => created.map_err(SandboxError::Provider),
            Err(e) => Err(SandboxError::Other(anyhow::anyhow!(
                "provisioning task failed: {}",
                e
            ))),
        }
    }

    fn prepare(&self, files: &ProjectFileSet) -> Result<NormalizedFileSet> {
        let mut normalized = normalize(files)?;
        let rewritten = self.settings.manifest.apply(&mut normalized);
        info!(
            files = normalized.len(),
            bytes = files.total_bytes(),
            rewritten,
            "Project files prepared"
        );
        Ok(normalized)
    }

    async fn drive(
        &self,
        env: Arc<dyn Environment>,
        files: &NormalizedFileSet,
    ) -> Result<LaunchOutcome> {
        enter(Stage::Staging, Some(env.id()));
        stage_files(env.as_ref(), files).await?;

        enter(Stage::Installing, Some(env.id()));
        let install = self
            .runner
            .run_blocking(
                env.as_ref(),
                &CommandSpec::shell(self.settings.install_command.as_str()),
            )
            .await?;
        if !install.success() {
            return Err(self.build_failure(install));
        }

        enter(Stage::Starting, Some(env.id()));
        let started = self.runner.run_detached(
            env.clone(),
            CommandSpec::shell(self.settings.start_command.as_str()),
        );
        debug!(sandbox_id = %env.id(), completion = ?started.completion, "Dev server submitted");

        enter(Stage::Verifying, Some(env.id()));
        let readiness = self.verifier.verify(env.as_ref()).await?;

        Ok(LaunchOutcome {
            environment_id: env.id().to_string(),
            readiness,
            install_output: install.stdout,
            release_token: self.settings.release_key.issue(env.id()),
        })
    }

    fn build_failure(&self, result: CommandResult) -> SandboxError {
        let message = match result.completion {
            Completion::TimedOut => format!(
                "install did not finish within {}s",
                self.settings.install_timeout.as_secs()
            ),
            _ if !result.stderr.trim().is_empty() => result.stderr.trim().to_string(),
            _ if !result.stdout.trim().is_empty() => result.stdout.trim().to_string(),
            _ => format!(
                "install exited with code {}",
                result
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        };

        SandboxError::BuildFailed {
            message,
            exit_code: result.exit_code,
            stdout: result.stdout,
        }
    }
}

fn enter(stage: Stage, sandbox_id: Option<&str>) {
    info!(stage = %stage, sandbox_id = sandbox_id.unwrap_or("-"), "Pipeline stage");
}

fn fail(sandbox_id: Option<&str>, err: &SandboxError) {
    error!(
        stage = %Stage::Failed(err.kind()),
        sandbox_id = sandbox_id.unwrap_or("-"),
        "Pipeline failed: {}",
        err
    );
}

/// Releases the environment if the owning run is dropped mid-flight, which
/// is what happens when the inbound request is aborted.
struct EnvironmentLease {
    env: Arc<dyn Environment>,
    armed: bool,
}

impl EnvironmentLease {
    fn new(env: Arc<dyn Environment>, armed: bool) -> Self {
        Self { env, armed }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let env = self.env.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(sandbox_id = %env.id(), "Run abandoned, releasing environment");
                handle.spawn(async move {
                    if let Err(e) = env.release().await {
                        warn!(sandbox_id = %env.id(), "Failed to release environment: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                sandbox_id = %env.id(),
                "Run abandoned outside a runtime, environment left to its TTL"
            ),
        }
    }
}
