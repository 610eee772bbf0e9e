//! Startup configuration.
//!
//! Parsed once from flags and environment variables, validated, then split
//! into the smaller settings structs each component takes in its constructor.

use crate::error::BackoffConfig;
use crate::orchestrator::OrchestratorSettings;
use crate::project::{FileLimits, ManifestTransformer};
use crate::provider::vercel::DEFAULT_API_URL;
use crate::provider::{EnvironmentSpec, VercelCredentials};
use crate::readiness::ReadinessConfig;
use crate::release::ReleaseKey;
use clap::{ArgAction, Parser, ValueEnum};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one candidate port is required")]
    NoPorts,
    #[error("port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid allowed origin: {0}")]
    InvalidOrigin(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sandbox-preview", version)]
#[command(about = "Boots a project's dev server in a cloud sandbox and returns a preview URL")]
pub struct ServiceConfig {
    /// HTTP port to listen on
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Production mode redacts unexpected error messages
    #[arg(long, env = "APP_ENV", value_enum, default_value_t = RunMode::Development)]
    pub mode: RunMode,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[arg(long, env = "SANDBOX_VERCEL_TOKEN", hide_env_values = true)]
    pub vercel_token: String,

    #[arg(long, env = "SANDBOX_VERCEL_TEAM_ID")]
    pub vercel_team_id: String,

    #[arg(long, env = "SANDBOX_VERCEL_PROJECT_ID")]
    pub vercel_project_id: String,

    #[arg(long, env = "SANDBOX_VERCEL_API_URL", default_value = DEFAULT_API_URL)]
    pub vercel_api_url: String,

    /// Candidate dev-server ports, in preference order
    #[arg(long, env = "SANDBOX_PORTS", value_delimiter = ',', default_values_t = [5173u16, 3000])]
    pub ports: Vec<u16>,

    #[arg(long, env = "SANDBOX_RUNTIME", default_value = "node22")]
    pub runtime: String,

    #[arg(long, env = "SANDBOX_VCPUS", default_value_t = 4)]
    pub vcpus: u32,

    /// Sandbox time-to-live in milliseconds
    #[arg(long, env = "SANDBOX_TIMEOUT_MS", default_value_t = 300_000)]
    pub sandbox_timeout_ms: u64,

    #[arg(long, env = "SANDBOX_INSTALL_COMMAND", default_value = "npm install")]
    pub install_command: String,

    #[arg(long, env = "SANDBOX_START_COMMAND", default_value = "npm run dev")]
    pub start_command: String,

    #[arg(long, env = "SANDBOX_INSTALL_TIMEOUT_SECS", default_value_t = 240)]
    pub install_timeout_secs: u64,

    /// Wait after starting the dev server before resolving a domain
    #[arg(long, env = "SANDBOX_READY_DELAY_MS", default_value_t = 5_000)]
    pub ready_delay_ms: u64,

    /// Ceiling on the whole readiness window
    #[arg(long, env = "SANDBOX_READY_TIMEOUT_MS", default_value_t = 60_000)]
    pub ready_timeout_ms: u64,

    #[arg(long, env = "SANDBOX_PROBE_TIMEOUT_MS", default_value_t = 3_000)]
    pub probe_timeout_ms: u64,

    #[arg(long, env = "SANDBOX_MAX_FILE_COUNT", default_value_t = 100)]
    pub max_file_count: usize,

    #[arg(long, env = "SANDBOX_MAX_TOTAL_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_total_bytes: usize,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value_t = 900)]
    pub rate_limit_window_secs: u64,

    /// Sandbox creations allowed per client IP per window
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 30)]
    pub rate_limit_max: u32,

    /// Comma-separated CORS origins; any origin when empty
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    #[arg(long, env = "SANDBOX_TEARDOWN_ON_ABORT", default_value_t = true, action = ArgAction::Set)]
    pub teardown_on_abort: bool,

    #[arg(
        long,
        env = "SANDBOX_TEARDOWN_ON_FAILURE",
        default_value_t = false,
        action = ArgAction::Set
    )]
    pub teardown_on_failure: bool,

    /// Key for release tokens; a random per-process key when unset
    #[arg(long, env = "SANDBOX_RELEASE_SECRET", hide_env_values = true)]
    pub release_secret: Option<String>,
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::PortOutOfRange(self.port));
        }
        if self.ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        if let Some(&port) = self.ports.iter().find(|&&p| p == 0) {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let positive = [
            ("SANDBOX_VCPUS", self.vcpus as u64),
            ("SANDBOX_TIMEOUT_MS", self.sandbox_timeout_ms),
            ("SANDBOX_INSTALL_TIMEOUT_SECS", self.install_timeout_secs),
            ("SANDBOX_READY_TIMEOUT_MS", self.ready_timeout_ms),
            ("SANDBOX_PROBE_TIMEOUT_MS", self.probe_timeout_ms),
            ("SANDBOX_MAX_FILE_COUNT", self.max_file_count as u64),
            ("SANDBOX_MAX_TOTAL_BYTES", self.max_total_bytes as u64),
            ("RATE_LIMIT_WINDOW_SECS", self.rate_limit_window_secs),
            ("RATE_LIMIT_MAX", self.rate_limit_max as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }

        for origin in self.origins() {
            if origin != "*" && !(origin.starts_with("http://") || origin.starts_with("https://")) {
                return Err(ConfigError::InvalidOrigin(origin.to_string()));
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn redact_errors(&self) -> bool {
        self.mode == RunMode::Production
    }

    /// Trimmed, non-empty origins
    pub fn origins(&self) -> impl Iterator<Item = &str> {
        self.allowed_origins
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
    }

    /// Request body ceiling: file content plus headroom for JSON overhead
    pub fn payload_limit(&self) -> usize {
        self.max_total_bytes + 1024 * 1024
    }

    pub fn credentials(&self) -> VercelCredentials {
        VercelCredentials {
            token: self.vercel_token.clone(),
            team_id: self.vercel_team_id.clone(),
            project_id: self.vercel_project_id.clone(),
        }
    }

    pub fn file_limits(&self) -> FileLimits {
        FileLimits {
            max_file_count: self.max_file_count,
            max_total_bytes: self.max_total_bytes,
        }
    }

    pub fn rate_limit(&self) -> RateLimitSettings {
        RateLimitSettings {
            window: Duration::from_secs(self.rate_limit_window_secs),
            max_requests: self.rate_limit_max,
        }
    }

    pub fn readiness(&self) -> ReadinessConfig {
        ReadinessConfig {
            ports: self.ports.clone(),
            initial_delay: Duration::from_millis(self.ready_delay_ms),
            ceiling: Duration::from_millis(self.ready_timeout_ms),
            backoff: BackoffConfig::default(),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn release_key(&self) -> ReleaseKey {
        match self.release_secret.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => ReleaseKey::from_secret(secret.as_bytes()),
            _ => ReleaseKey::random(),
        }
    }

    pub fn orchestrator(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            environment: EnvironmentSpec {
                ports: self.ports.clone(),
                runtime: self.runtime.clone(),
                vcpus: self.vcpus,
                ttl: Duration::from_millis(self.sandbox_timeout_ms),
            },
            install_command: self.install_command.clone(),
            start_command: self.start_command.clone(),
            install_timeout: Duration::from_secs(self.install_timeout_secs),
            manifest: ManifestTransformer::default(),
            teardown_on_abort: self.teardown_on_abort,
            teardown_on_failure: self.teardown_on_failure,
            release_key: self.release_key(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: u32,
}
