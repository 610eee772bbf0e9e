//! In-memory project file sets and the transforms applied before staging.

use crate::error::{Result, SandboxError};
use std::collections::BTreeMap;

pub mod manifest;
pub mod normalize;

pub use manifest::{ManifestRule, ManifestTransformer};
pub use normalize::normalize;

/// Ceilings applied to an inbound file set
#[derive(Debug, Clone)]
pub struct FileLimits {
    pub max_file_count: usize,
    pub max_total_bytes: usize,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_file_count: 100,
            max_total_bytes: 10 * 1024 * 1024,
        }
    }
}

/// A validated, non-empty set of relative paths and their text content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFileSet {
    files: BTreeMap<String, String>,
}

impl ProjectFileSet {
    /// Validate raw request input. Runs before any remote call is made.
    pub fn validate(files: BTreeMap<String, String>, limits: &FileLimits) -> Result<Self> {
        if files.is_empty() {
            return Err(SandboxError::InvalidInput(
                "at least one file is required".to_string(),
            ));
        }

        if files.len() > limits.max_file_count {
            return Err(SandboxError::InvalidInput(format!(
                "too many files: {} (limit {})",
                files.len(),
                limits.max_file_count
            )));
        }

        let total_bytes: usize = files.values().map(String::len).sum();
        if total_bytes > limits.max_total_bytes {
            return Err(SandboxError::InvalidInput(format!(
                "project is {} bytes (limit {})",
                total_bytes, limits.max_total_bytes
            )));
        }

        for path in files.keys() {
            check_path(path)?;
        }

        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.files.values().map(String::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }
}

/// Reject anything that could escape the project root
fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SandboxError::InvalidInput("empty file path".to_string()));
    }
    if path.contains('\0') {
        return Err(SandboxError::InvalidInput(format!(
            "path contains NUL byte: {:?}",
            path
        )));
    }
    if path.starts_with('/') || has_drive_prefix(path) {
        return Err(SandboxError::SecurityViolation(format!(
            "absolute path not allowed: {}",
            path
        )));
    }
    if path.contains('\\') {
        return Err(SandboxError::SecurityViolation(format!(
            "backslash in path not allowed: {}",
            path
        )));
    }

    for segment in path.split('/') {
        match segment {
            ".." => {
                return Err(SandboxError::SecurityViolation(format!(
                    "path traversal detected: {}",
                    path
                )))
            }
            "" | "." => {
                return Err(SandboxError::InvalidInput(format!(
                    "malformed path: {}",
                    path
                )))
            }
            _ => {}
        }
    }

    Ok(())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// File set after root stripping and config rewrites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFileSet {
    files: BTreeMap<String, String>,
}

impl NormalizedFileSet {
    /// Build from rewritten entries. Two inputs landing on the same path is a
    /// failed normalization, not something to resolve silently.
    pub(crate) fn from_entries(
        expected: usize,
        entries: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self> {
        let files: BTreeMap<String, String> = entries.into_iter().collect();
        if files.len() != expected {
            return Err(SandboxError::InvalidInput(format!(
                "normalizing paths collapsed {} files into {}",
                expected,
                files.len()
            )));
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut String)> {
        self.files.iter_mut()
    }
}
