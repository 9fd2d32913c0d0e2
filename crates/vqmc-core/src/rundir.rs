//! On-disk layout of experiments: one experiment directory holding one
//! directory per job, plus discovery of finished runs below a root.

use crate::config::FULL_CONFIG_FILE;
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Compressed results artifact written by the training loop at the end of a run.
pub const RESULTS_FILE: &str = "results.bz2";

const CHECKPOINT_MARKER: &str = "chkpt";

/// Creates a fresh, empty experiment directory.
///
/// An existing `path` is an error unless `force` is set, in which case the
/// whole tree is removed first. The removal cannot be undone.
pub fn create_experiment_directory(path: &Path, force: bool) -> Result<PathBuf> {
    if path.exists() {
        if !force {
            return Err(Error::DirectoryExists {
                path: path.to_path_buf(),
            });
        }
        warn!(path = %path.display(), "removing existing experiment directory");
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
    }
    fs::create_dir_all(path)?;
    Ok(path.to_path_buf())
}

/// Creates `parent/name`. An existing directory is reused with a warning.
pub fn create_job_directory(parent: &Path, name: &str) -> Result<PathBuf> {
    let job_dir = parent.join(name);
    if job_dir.exists() {
        warn!(
            path = %job_dir.display(),
            "directory already exists, results might be overwritten"
        );
    } else {
        fs::create_dir_all(&job_dir)?;
    }
    Ok(job_dir)
}

pub fn job_index_name(index: usize) -> String {
    format!("{:04}", index)
}

pub fn is_checkpoint(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase().contains(CHECKPOINT_MARKER))
        .unwrap_or(false)
}

/// True iff `dir` holds both the config snapshot and the results artifact.
pub fn contains_run(dir: &Path) -> bool {
    dir.join(FULL_CONFIG_FILE).exists() && dir.join(RESULTS_FILE).exists()
}

/// Lists directories under `root` (inclusive) that contain a finished run,
/// relative to `root`. The root itself is reported as `.`.
///
/// Entries are visited in file-name order so the result is stable across
/// filesystems. Entries that cannot be read are skipped, so a missing root
/// yields no runs.
pub fn find_runs(root: &Path, include_checkpoints: bool) -> Result<Vec<PathBuf>> {
    let mut runs = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        if !contains_run(path) || (!include_checkpoints && is_checkpoint(path)) {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            runs.push(PathBuf::from("."));
        } else {
            runs.push(rel.to_path_buf());
        }
    }
    Ok(runs)
}
