#![allow(dead_code)]

use async_trait::async_trait;
use reqwest::Url;
use sandbox_preview::error::BackoffConfig;
use sandbox_preview::orchestrator::{Orchestrator, OrchestratorSettings};
use sandbox_preview::project::{FileLimits, ManifestTransformer, ProjectFileSet};
use sandbox_preview::provider::{
    CommandResult, CommandSpec, DetachedCommand, Environment, EnvironmentSpec, FileEntry,
    ProviderError, SandboxProvider,
};
use sandbox_preview::readiness::{LivenessProbe, ReadinessConfig, ReadinessVerifier};
use sandbox_preview::release::ReleaseKey;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Write(usize),
    Run(CommandSpec),
    Spawn(CommandSpec),
    Release,
}

/// Scripted environment that records every call made against it
pub struct FakeEnvironment {
    id: String,
    install: CommandResult,
    install_delay: Duration,
    fail_writes: bool,
    domains: HashMap<u16, String>,
    domains_visible_at: Mutex<Option<Instant>>,
    domain_delay: Duration,
    lookup_error: Option<ProviderError>,
    calls: Mutex<Vec<Call>>,
    written: Mutex<Vec<FileEntry>>,
}

impl FakeEnvironment {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            install: CommandResult::finished(0, "added 42 packages", ""),
            install_delay: Duration::ZERO,
            fail_writes: false,
            domains: HashMap::new(),
            domains_visible_at: Mutex::new(None),
            domain_delay: Duration::ZERO,
            lookup_error: None,
            calls: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
        }
    }

    pub fn with_install(mut self, result: CommandResult) -> Self {
        self.install = result;
        self
    }

    pub fn with_install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = delay;
        self
    }

    pub fn with_domain(mut self, port: u16, domain: &str) -> Self {
        self.domains.insert(port, domain.to_string());
        self
    }

    /// Domains only resolve once this long has passed since the dev server started
    pub fn with_domain_delay(mut self, delay: Duration) -> Self {
        self.domain_delay = delay;
        self
    }

    /// Every domain lookup fails with this status and message
    pub fn failing_lookups(mut self, status: u16, message: &str) -> Self {
        self.lookup_error = Some(ProviderError::Api {
            status,
            message: message.to_string(),
        });
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<FileEntry> {
        self.written.lock().unwrap().clone()
    }

    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Spawn(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn released(&self) -> bool {
        self.calls().contains(&Call::Release)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn working_dir(&self) -> &str {
        "/workspace"
    }

    async fn write_files(&self, entries: &[FileEntry]) -> Result<(), ProviderError> {
        self.record(Call::Write(entries.len()));
        if self.fail_writes {
            return Err(ProviderError::Api {
                status: 507,
                message: "disk quota exceeded".to_string(),
            });
        }
        self.written.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandResult, ProviderError> {
        self.record(Call::Run(command.clone()));
        tokio::time::sleep(self.install_delay).await;
        Ok(self.install.clone())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<DetachedCommand, ProviderError> {
        self.record(Call::Spawn(command.clone()));
        *self.domains_visible_at.lock().unwrap() = Some(Instant::now() + self.domain_delay);
        Ok(DetachedCommand {
            command_id: "cmd_dev".to_string(),
        })
    }

    async fn resolve_domain(&self, port: u16) -> Result<Option<String>, ProviderError> {
        if let Some(ProviderError::Api { status, message }) = &self.lookup_error {
            return Err(ProviderError::Api {
                status: *status,
                message: message.clone(),
            });
        }
        let visible = self
            .domains_visible_at
            .lock()
            .unwrap()
            .map(|at| Instant::now() >= at)
            .unwrap_or(false);
        if !visible {
            return Ok(None);
        }
        Ok(self.domains.get(&port).cloned())
    }

    async fn release(&self) -> Result<(), ProviderError> {
        self.record(Call::Release);
        Ok(())
    }
}

pub struct FakeProvider {
    env: Arc<FakeEnvironment>,
    fail_create: bool,
    create_delay: Duration,
    created: AtomicUsize,
    released_ids: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(env: Arc<FakeEnvironment>) -> Self {
        Self {
            env,
            fail_create: false,
            create_delay: Duration::ZERO,
            created: AtomicUsize::new(0),
            released_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(env: Arc<FakeEnvironment>) -> Self {
        Self {
            fail_create: true,
            ..Self::new(env)
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released_ids(&self) -> Vec<String> {
        self.released_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(
        &self,
        _spec: &EnvironmentSpec,
    ) -> Result<Arc<dyn Environment>, ProviderError> {
        tokio::time::sleep(self.create_delay).await;
        if self.fail_create {
            return Err(ProviderError::Api {
                status: 401,
                message: "invalid token".to_string(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.env.clone())
    }

    async fn release(&self, environment_id: &str) -> Result<(), ProviderError> {
        self.released_ids
            .lock()
            .unwrap()
            .push(environment_id.to_string());
        Ok(())
    }
}

/// Probe with a fixed answer
pub struct FakeProbe {
    answer: Result<(), String>,
    probed: Mutex<Vec<Url>>,
}

impl FakeProbe {
    pub fn live() -> Self {
        Self {
            answer: Ok(()),
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn down(reason: &str) -> Self {
        Self {
            answer: Err(reason.to_string()),
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn probed(&self) -> Vec<Url> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LivenessProbe for FakeProbe {
    async fn probe(&self, url: &Url) -> Result<(), String> {
        self.probed.lock().unwrap().push(url.clone());
        self.answer.clone()
    }
}

pub fn fast_readiness(ports: &[u16]) -> ReadinessConfig {
    ReadinessConfig {
        ports: ports.to_vec(),
        initial_delay: Duration::from_millis(10),
        ceiling: Duration::from_millis(300),
        backoff: BackoffConfig {
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            backoff_multiplier: 2.0,
        },
    }
}

pub fn fast_settings(ports: &[u16]) -> OrchestratorSettings {
    OrchestratorSettings {
        environment: EnvironmentSpec {
            ports: ports.to_vec(),
            runtime: "node22".to_string(),
            vcpus: 2,
            ttl: Duration::from_secs(300),
        },
        install_command: "npm install".to_string(),
        start_command: "npm run dev".to_string(),
        install_timeout: Duration::from_secs(5),
        manifest: ManifestTransformer::default(),
        teardown_on_abort: true,
        teardown_on_failure: false,
        release_key: ReleaseKey::from_secret(b"test-release-secret"),
    }
}

pub fn orchestrator(
    provider: Arc<FakeProvider>,
    settings: OrchestratorSettings,
    probe: Arc<FakeProbe>,
) -> Orchestrator {
    let verifier = ReadinessVerifier::new(fast_readiness(&settings.environment.ports), probe);
    Orchestrator::new(provider, settings, verifier)
}

pub fn project(entries: &[(&str, &str)]) -> ProjectFileSet {
    let files: BTreeMap<String, String> = entries
        .iter()
        .map(|(p, c)| (p.to_string(), c.to_string()))
        .collect();
    ProjectFileSet::validate(files, &FileLimits::default()).expect("valid project")
}
