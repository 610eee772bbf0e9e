//! Vercel Sandbox REST client.

use super::{
    CommandResult, CommandSpec, DetachedCommand, Environment, EnvironmentSpec, FileEntry,
    ProviderError, Result, SandboxProvider,
};
use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use reqwest::{Method, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://api.vercel.com";
const WORKING_DIR: &str = "/vercel/sandbox";
const ROUTE_DOMAIN_SUFFIX: &str = "vercel.run";

#[derive(Debug, Clone)]
pub struct VercelCredentials {
    pub token: String,
    pub team_id: String,
    pub project_id: String,
}

/// Shared HTTP plumbing for the provider and every sandbox it hands out
struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: VercelCredentials,
}

impl ApiClient {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.credentials.token)
            .query(&[("teamId", self.credentials.team_id.as_str())])
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message: api_error_message(&body),
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Pull `error.message` out of an API error body, falling back to the raw text
fn api_error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) if body.trim().is_empty() => "empty response body".to_string(),
        Err(_) => body.trim().chars().take(512).collect(),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    project_id: &'a str,
    ports: &'a [u16],
    runtime: &'a str,
    timeout: u64,
    resources: Resources,
}

#[derive(Serialize)]
struct Resources {
    vcpus: u32,
}

#[derive(Deserialize)]
struct SandboxEnvelope {
    sandbox: SandboxBody,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Deserialize)]
struct SandboxBody {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Route {
    port: u16,
    subdomain: String,
}

#[derive(Serialize)]
struct RunCommandRequest<'a> {
    command: &'a str,
    args: &'a [String],
    cwd: &'a str,
}

#[derive(Deserialize)]
struct CommandEnvelope {
    command: CommandBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandBody {
    id: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

#[derive(Deserialize)]
struct LogLine {
    stream: String,
    data: String,
}

/// Leases sandboxes from the Vercel Sandbox API
pub struct VercelProvider {
    api: Arc<ApiClient>,
}

impl VercelProvider {
    pub fn new(base_url: impl Into<String>, credentials: VercelCredentials) -> Result<Self> {
        if credentials.token.is_empty()
            || credentials.team_id.is_empty()
            || credentials.project_id.is_empty()
        {
            return Err(ProviderError::Config(
                "Vercel token, team id and project id are required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        Ok(Self {
            api: Arc::new(ApiClient {
                http,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                credentials,
            }),
        })
    }
}

#[async_trait]
impl SandboxProvider for VercelProvider {
    fn name(&self) -> &'static str {
        "vercel"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<Arc<dyn Environment>> {
        let body = CreateSandboxRequest {
            project_id: &self.api.credentials.project_id,
            ports: &spec.ports,
            runtime: &spec.runtime,
            timeout: spec.ttl.as_millis() as u64,
            resources: Resources { vcpus: spec.vcpus },
        };

        let envelope: SandboxEnvelope = self
            .api
            .send_json(self.api.request(Method::POST, "/v1/sandboxes").json(&body))
            .await?;

        info!(
            sandbox_id = %envelope.sandbox.id,
            routes = envelope.routes.len(),
            "Vercel sandbox created"
        );

        Ok(Arc::new(VercelSandbox {
            api: self.api.clone(),
            id: envelope.sandbox.id,
        }))
    }

    async fn release(&self, environment_id: &str) -> Result<()> {
        stop_sandbox(&self.api, environment_id).await
    }
}

async fn stop_sandbox(api: &ApiClient, id: &str) -> Result<()> {
    let path = format!("/v1/sandboxes/{}/stop", id);
    api.send(api.request(Method::POST, &path)).await?;
    info!(sandbox_id = %id, "Vercel sandbox stopped");
    Ok(())
}

/// One running Vercel sandbox
pub struct VercelSandbox {
    api: Arc<ApiClient>,
    id: String,
}

impl VercelSandbox {
    async fn submit(&self, command: &CommandSpec) -> Result<CommandBody> {
        let path = format!("/v1/sandboxes/{}/cmd", self.id);
        let body = RunCommandRequest {
            command: &command.cmd,
            args: &command.args,
            cwd: WORKING_DIR,
        };
        let envelope: CommandEnvelope = self
            .api
            .send_json(self.api.request(Method::POST, &path).json(&body))
            .await?;
        Ok(envelope.command)
    }

    async fn logs(&self, command_id: &str) -> Result<(String, String)> {
        let path = format!("/v1/sandboxes/{}/cmd/{}/logs", self.id, command_id);
        let text = self
            .api
            .send(self.api.request(Method::GET, &path))
            .await?
            .text()
            .await?;
        Ok(split_log_stream(&text))
    }
}

/// Split an NDJSON log stream into stdout and stderr text
fn split_log_stream(text: &str) -> (String, String) {
    let mut stdout = String::new();
    let mut stderr = String::new();

    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<LogLine>(line) {
            Ok(entry) if entry.stream == "stderr" => stderr.push_str(&entry.data),
            Ok(entry) => stdout.push_str(&entry.data),
            Err(e) => debug!("Skipping unparsable log line: {}", e),
        }
    }

    (stdout, stderr)
}

/// Gzip-compressed tar archive of every entry
fn pack_archive(entries: &[FileEntry]) -> std::io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.content.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, &entry.path, entry.content.as_slice())?;
    }

    builder.into_inner()?.finish()
}

#[async_trait]
impl Environment for VercelSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn working_dir(&self) -> &str {
        WORKING_DIR
    }

    async fn write_files(&self, entries: &[FileEntry]) -> Result<()> {
        let archive = pack_archive(entries)
            .map_err(|e| ProviderError::Transport(format!("failed to encode archive: {}", e)))?;
        debug!(
            sandbox_id = %self.id,
            files = entries.len(),
            archive_bytes = archive.len(),
            "Uploading file archive"
        );

        let path = format!("/v1/sandboxes/{}/fs/write", self.id);
        self.api
            .send(
                self.api
                    .request(Method::POST, &path)
                    .header("content-type", "application/gzip")
                    .header("x-cwd", WORKING_DIR)
                    .body(archive),
            )
            .await?;
        Ok(())
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandResult> {
        let submitted = self.submit(command).await?;

        let path = format!("/v1/sandboxes/{}/cmd/{}", self.id, submitted.id);
        let finished: CommandEnvelope = self
            .api
            .send_json(
                self.api
                    .request(Method::GET, &path)
                    .query(&[("wait", "true")]),
            )
            .await?;

        let exit_code = finished.command.exit_code.ok_or_else(|| {
            ProviderError::Decode(format!("command {} finished without exit code", submitted.id))
        })?;
        let (stdout, stderr) = self.logs(&submitted.id).await?;

        Ok(CommandResult::finished(exit_code, stdout, stderr))
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<DetachedCommand> {
        let submitted = self.submit(command).await?;
        Ok(DetachedCommand {
            command_id: submitted.id,
        })
    }

    async fn resolve_domain(&self, port: u16) -> Result<Option<String>> {
        let path = format!("/v1/sandboxes/{}", self.id);
        let envelope: SandboxEnvelope = self
            .api
            .send_json(self.api.request(Method::GET, &path))
            .await?;

        Ok(envelope
            .routes
            .into_iter()
            .find(|route| route.port == port)
            .map(|route| format!("https://{}.{}", route.subdomain, ROUTE_DOMAIN_SUFFIX)))
    }

    async fn release(&self) -> Result<()> {
        stop_sandbox(&self.api, &self.id).await
    }
}
