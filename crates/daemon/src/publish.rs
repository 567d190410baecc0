//! Publisher module for making streaming assets visible atomically.
//!
//! The encoder writes into a hidden staging directory inside the media root.
//! Once the manifest is verified the staging directory is renamed onto
//! `<key>_stream`, so readers either see no asset or a complete one.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::catalog::{MANIFEST_FILE_NAME, STREAM_DIR_SUFFIX};

/// Errors that can occur while staging or publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Failed to create the staging directory.
    #[error("Failed to create staging directory {0}: {1}")]
    StagingFailed(PathBuf, std::io::Error),

    /// Failed to move a stale target directory out of the way.
    #[error("Failed to move stale directory {0} aside: {1}")]
    SetAsideFailed(PathBuf, std::io::Error),

    /// Failed to rename the staging directory onto the target.
    #[error("Failed to publish {0}: {1}")]
    RenameFailed(PathBuf, std::io::Error),
}

/// Staging directory for a job: `.<key>_stream.partial-<job id>`.
///
/// Hidden and lacking the `_stream` suffix, so neither the catalog nor the
/// media server ever treats it as an asset.
pub fn staging_dir(root: &Path, key: &str, job_id: &str) -> PathBuf {
    root.join(format!(".{}{}.partial-{}", key, STREAM_DIR_SUFFIX, job_id))
}

/// Where a stale, manifest-less target directory is moved before publishing.
pub fn stale_dir(root: &Path, key: &str, job_id: &str) -> PathBuf {
    root.join(format!(".{}{}.stale-{}", key, STREAM_DIR_SUFFIX, job_id))
}

/// Create a fresh staging directory.
pub fn create_staging(root: &Path, key: &str, job_id: &str) -> Result<PathBuf, PublishError> {
    let dir = staging_dir(root, key, job_id);
    fs::create_dir_all(&dir).map_err(|e| PublishError::StagingFailed(dir.clone(), e))?;
    Ok(dir)
}

/// Atomically publishes a staged asset as `target`.
///
/// Steps:
/// 1. If `target` exists without a manifest (left over from a crash or made
///    by hand) it is renamed to the stale path, never deleted
/// 2. Rename `staging` onto `target`
///
/// Both directories live in the media root, so the rename never crosses a
/// filesystem boundary. On failure the staging directory is left in place
/// for inspection.
pub fn publish(
    staging: &Path,
    target: &Path,
    stale: &Path,
) -> Result<(), PublishError> {
    if target.exists() && !target.join(MANIFEST_FILE_NAME).is_file() {
        fs::rename(target, stale).map_err(|e| PublishError::SetAsideFailed(target.to_path_buf(), e))?;
        tracing::warn!(target = ?target, moved_to = ?stale, "Moved stale streaming directory aside");
    }

    fs::rename(staging, target).map_err(|e| PublishError::RenameFailed(target.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staging_dir_format() {
        let dir = staging_dir(Path::new("/media"), "clip", "abc");
        assert_eq!(dir, PathBuf::from("/media/.clip_stream.partial-abc"));
    }

    #[test]
    fn test_staging_dir_is_hidden_and_not_an_asset() {
        let dir = staging_dir(Path::new("/media"), "My Movie", "1");
        let name = dir.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with('.'));
        assert!(!name.ends_with(STREAM_DIR_SUFFIX));
    }

    #[test]
    fn test_publish_moves_staging_onto_target() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let staging = create_staging(root, "clip", "job1").unwrap();
        fs::write(staging.join("segment_000.ts"), b"seg").unwrap();
        fs::write(staging.join(MANIFEST_FILE_NAME), "#EXTM3U\n").unwrap();

        let target = root.join("clip_stream");
        publish(&staging, &target, &stale_dir(root, "clip", "job1")).unwrap();

        assert!(!staging.exists());
        assert!(target.join(MANIFEST_FILE_NAME).is_file());
        assert!(target.join("segment_000.ts").is_file());
    }

    #[test]
    fn test_publish_sets_stale_target_aside() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let target = root.join("clip_stream");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("segment_000.ts"), b"old").unwrap();

        let staging = create_staging(root, "clip", "job2").unwrap();
        fs::write(staging.join(MANIFEST_FILE_NAME), "#EXTM3U\n").unwrap();

        let stale = stale_dir(root, "clip", "job2");
        publish(&staging, &target, &stale).unwrap();

        assert!(target.join(MANIFEST_FILE_NAME).is_file());
        // Old content preserved, not deleted
        assert_eq!(fs::read(stale.join("segment_000.ts")).unwrap(), b"old");
    }

    #[test]
    fn test_publish_missing_staging_fails_and_leaves_target_absent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let staging = staging_dir(root, "clip", "missing");
        let target = root.join("clip_stream");

        let result = publish(&staging, &target, &stale_dir(root, "clip", "missing"));
        assert!(matches!(result, Err(PublishError::RenameFailed(_, _))));
        assert!(!target.exists());
    }
}
