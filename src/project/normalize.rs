use super::{NormalizedFileSet, ProjectFileSet};
use crate::error::Result;
use tracing::debug;

/// Strip a directory that every path shares as its first segment.
///
/// The decision is made over the whole set: if any path lacks the shared
/// segment, or is itself a top-level file, nothing is stripped. Only one
/// level is removed.
pub fn normalize(files: &ProjectFileSet) -> Result<NormalizedFileSet> {
    let root = common_root(files.iter().map(|(path, _)| path));

    let entries = files.iter().map(|(path, content)| {
        let path = match root {
            Some(root) => path[root.len() + 1..].to_string(),
            None => path.to_string(),
        };
        (path, content.to_string())
    });

    let normalized = NormalizedFileSet::from_entries(files.len(), entries)?;
    if let Some(root) = root {
        debug!(root = %root, files = normalized.len(), "Stripped shared project root");
    }
    Ok(normalized)
}

/// First segment shared by every path, provided each path continues past it
fn common_root<'a>(mut paths: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let first = paths.next()?;
    let (root, _) = first.split_once('/')?;

    for path in paths {
        match path.split_once('/') {
            Some((segment, _)) if segment == root => {}
            _ => return None,
        }
    }

    Some(root)
}
