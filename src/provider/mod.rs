//! Sandbox Runtime Provider interface.
//!
//! The orchestration core only talks to remote compute through these traits.
//! Every call is fallible and possibly slow; nothing here assumes the
//! provider retries or that a call is idempotent.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod vercel;

pub use vercel::{VercelCredentials, VercelProvider};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// What to ask the provider for when leasing an environment
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub ports: Vec<u16>,
    pub runtime: String,
    pub vcpus: u32,
    pub ttl: Duration,
}

/// One file to be written, path relative to the environment's working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub content: Vec<u8>,
}

/// A shell invocation inside the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cmd: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Wraps a command line in `sh -c`
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            cmd: "sh".to_string(),
            args: vec!["-c".to_string(), line.into()],
        }
    }

    pub fn display(&self) -> String {
        let mut out = self.cmd.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Exited within the allotted window
    Finished,
    /// Hard ceiling hit before the command exited
    TimedOut,
    /// Submitted and deliberately not awaited
    Detached,
}

/// Outcome of a command submitted to the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub completion: Completion,
}

impl CommandResult {
    pub fn finished(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            completion: Completion::Finished,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            completion: Completion::TimedOut,
        }
    }

    pub fn detached() -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            completion: Completion::Detached,
        }
    }

    pub fn success(&self) -> bool {
        self.completion == Completion::Finished && self.exit_code == Some(0)
    }
}

/// Handle to a command that was submitted without waiting for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedCommand {
    pub command_id: String,
}

/// One leased compute instance
#[async_trait]
pub trait Environment: Send + Sync {
    /// Provider-assigned identifier
    fn id(&self) -> &str;

    /// Directory that relative file paths and commands are rooted at
    fn working_dir(&self) -> &str;

    /// Write every entry in a single batched call
    async fn write_files(&self, entries: &[FileEntry]) -> Result<()>;

    /// Run a command and wait for it to exit
    async fn run(&self, command: &CommandSpec) -> Result<CommandResult>;

    /// Submit a command without waiting for it to exit
    async fn spawn(&self, command: &CommandSpec) -> Result<DetachedCommand>;

    /// Public domain routed to `port`, if one is assigned yet
    async fn resolve_domain(&self, port: u16) -> Result<Option<String>>;

    /// Stop the environment ahead of its TTL
    async fn release(&self) -> Result<()>;
}

/// Leases environments from a remote platform
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, spec: &EnvironmentSpec) -> Result<Arc<dyn Environment>>;

    /// Stop an environment known only by id
    async fn release(&self, environment_id: &str) -> Result<()>;
}
