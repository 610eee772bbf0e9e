pub mod config;
pub mod error;
pub mod orchestrator;
pub mod project;
pub mod provider;
pub mod readiness;
pub mod release;
pub mod runner;
pub mod staging;

#[cfg(feature = "server")]
pub mod server;

pub use error::{ErrorKind, SandboxError};
pub use orchestrator::{LaunchOutcome, Orchestrator, OrchestratorSettings};
