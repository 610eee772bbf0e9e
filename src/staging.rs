use crate::error::{Result, SandboxError};
use crate::project::NormalizedFileSet;
use crate::provider::{Environment, FileEntry};
use tracing::info;

/// Encode the file set as UTF-8 bytes, one entry per path
pub fn encode_entries(files: &NormalizedFileSet) -> Vec<FileEntry> {
    files
        .iter()
        .map(|(path, content)| FileEntry {
            path: path.to_string(),
            content: content.as_bytes().to_vec(),
        })
        .collect()
}

/// Upload every file in one batched write.
///
/// There is no partial-write recovery: the environment is disposable and a
/// failed upload fails the whole pipeline.
pub async fn stage_files(env: &dyn Environment, files: &NormalizedFileSet) -> Result<usize> {
    let entries = encode_entries(files);
    let bytes: usize = entries.iter().map(|e| e.content.len()).sum();

    env.write_files(&entries)
        .await
        .map_err(SandboxError::StagingFailed)?;

    info!(
        sandbox_id = %env.id(),
        files = entries.len(),
        bytes,
        working_dir = %env.working_dir(),
        "Project files staged"
    );
    Ok(entries.len())
}
