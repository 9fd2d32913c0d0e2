//! Translation of local paths into the shared-storage namespace that the
//! DGX compute nodes see.

use std::path::{Path, PathBuf};

/// Mount point of the shared filesystem on the compute nodes.
pub const NFS_PREFIX: &str = "/nfs";
const HOME_ROOT: &str = "/home";

/// Prefixes every command token that is an absolute path to something that
/// exists locally. Relative or dangling tokens pass through unchanged.
pub fn rewrite_shared_paths(command: &[String], prefix: &str) -> Vec<String> {
    command
        .iter()
        .map(|token| {
            if token.starts_with('/') && Path::new(token).exists() {
                format!("{}{}", prefix, token)
            } else {
                token.clone()
            }
        })
        .collect()
}

/// Resolves `path` and moves it under the NFS mount if it lives in `/home`.
///
/// Paths that cannot be resolved are used as given.
pub fn map_shared_path(path: &Path) -> PathBuf {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if resolved.starts_with(HOME_ROOT) {
        let mut mapped = PathBuf::from(NFS_PREFIX);
        mapped.push(resolved.strip_prefix("/").unwrap_or(&resolved));
        mapped
    } else {
        resolved
    }
}
