//! Waiting for a detached dev server to become reachable.
//!
//! Domain assignment and the server's own bind-up both happen after the start
//! call returns, so the verifier waits, resolves a domain for the first
//! candidate port that has one, then probes it once. Only the resolution is
//! required; the probe result is reported but never fails the pipeline.

use crate::error::{calculate_backoff, BackoffConfig, Result, SandboxError};
use crate::provider::{Environment, ProviderError};
use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Checks whether something is answering at a URL
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// `Err` carries a short human-readable reason
    async fn probe(&self, url: &Url) -> std::result::Result<(), String>;
}

/// Single GET with a short timeout. Any response below 500 counts as live;
/// platform gateways answer 502/503 until the server has bound its port.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, url: &Url) -> std::result::Result<(), String> {
        match self.client.get(url.clone()).send().await {
            Ok(response) if response.status().is_server_error() => {
                Err(format!("server answered {}", response.status()))
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => Err("probe timed out".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Outcome of readiness verification once a domain has been resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The probe got an answer
    Verified { url: Url, port: u16 },
    /// Resolved, but the probe failed or timed out
    Unverified { url: Url, port: u16, reason: String },
}

impl Readiness {
    pub fn url(&self) -> &Url {
        match self {
            Readiness::Verified { url, .. } | Readiness::Unverified { url, .. } => url,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Readiness::Verified { port, .. } | Readiness::Unverified { port, .. } => *port,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Readiness::Verified { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    /// Candidate ports in preference order
    pub ports: Vec<u16>,
    /// Wait before the first resolution attempt
    pub initial_delay: Duration,
    /// Total budget for resolution, measured from the start of verification
    pub ceiling: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            ports: vec![5173, 3000],
            initial_delay: Duration::from_secs(5),
            ceiling: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }
}

pub struct ReadinessVerifier {
    config: ReadinessConfig,
    probe: Arc<dyn LivenessProbe>,
}

impl ReadinessVerifier {
    pub fn new(config: ReadinessConfig, probe: Arc<dyn LivenessProbe>) -> Self {
        Self { config, probe }
    }

    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    pub async fn verify(&self, env: &dyn Environment) -> Result<Readiness> {
        let started = Instant::now();
        tokio::time::sleep(self.config.initial_delay).await;

        let mut attempt = 0;
        // Set once any lookup gets a real answer from the provider
        let mut answered = false;
        let mut last_error = None;
        let (port, url) = loop {
            match self.resolve_first(env).await {
                Lookup::Found(port, url) => break (port, url),
                Lookup::Pending => answered = true,
                Lookup::Failed(e) => last_error = Some(e),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.ceiling {
                if let (false, Some(e)) = (answered, last_error) {
                    return Err(SandboxError::Provider(e));
                }
                return Err(SandboxError::ServerTimeout(format!(
                    "no public domain for ports {:?} after {}s",
                    self.config.ports,
                    elapsed.as_secs()
                )));
            }

            let pause = calculate_backoff(attempt, &self.config.backoff)
                .min(self.config.ceiling - elapsed);
            debug!(attempt, pause_ms = pause.as_millis() as u64, "No domain yet, backing off");
            tokio::time::sleep(pause).await;
            attempt += 1;
        };

        match self.probe.probe(&url).await {
            Ok(()) => {
                info!(sandbox_id = %env.id(), url = %url, port, "Dev server is live");
                Ok(Readiness::Verified { url, port })
            }
            Err(reason) => {
                warn!(
                    sandbox_id = %env.id(),
                    url = %url,
                    port,
                    reason = %reason,
                    "Liveness probe failed, returning URL anyway"
                );
                Ok(Readiness::Unverified { url, port, reason })
            }
        }
    }

    /// First candidate port with a resolvable domain, in preference order
    async fn resolve_first(&self, env: &dyn Environment) -> Lookup {
        let mut answered = false;
        let mut last_error = None;

        for &port in &self.config.ports {
            match env.resolve_domain(port).await {
                Ok(Some(domain)) => match domain_url(&domain) {
                    Ok(url) => return Lookup::Found(port, url),
                    Err(e) => {
                        answered = true;
                        warn!(port, domain = %domain, "Ignoring malformed domain: {}", e);
                    }
                },
                Ok(None) => {
                    answered = true;
                    debug!(port, "No domain assigned yet");
                }
                Err(e) => {
                    warn!(port, "Domain lookup failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !answered => Lookup::Failed(e),
            _ => Lookup::Pending,
        }
    }
}

/// One pass over the candidate ports
enum Lookup {
    Found(u16, Url),
    /// The provider answered, but no port has a domain yet
    Pending,
    /// Every lookup in the pass failed
    Failed(ProviderError),
}

/// Providers hand back either a bare host or a full URL
fn domain_url(domain: &str) -> std::result::Result<Url, String> {
    let parsed = if domain.contains("://") {
        Url::parse(domain)
    } else {
        Url::parse(&format!("https://{}", domain))
    };
    parsed.map_err(|e| e.to_string())
}
