//! Repository root discovery.

use std::path::{Path, PathBuf};

/// Directory holding the cluster manifest and the state file.
pub const DX_DIR: &str = ".dx";
pub const SETTINGS_FILE: &str = "dx.config.yml";
pub const CLUSTER_MANIFEST: &str = ".dx/config.yaml";

/// `DX_ROOT` if set, else the nearest marked ancestor of the working directory.
pub fn repo_root() -> PathBuf {
    if let Some(root) = std::env::var_os("DX_ROOT") {
        return PathBuf::from(root);
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_repo_root(&cwd)
}

/// Walk up from `start`: a `.dx/` dir or `dx.config.yml` marks the root; `.git` is the fallback marker.
pub fn find_repo_root(start: &Path) -> PathBuf {
    let mut git_root: Option<PathBuf> = None;
    for dir in start.ancestors() {
        if dir.join(DX_DIR).is_dir() || dir.join(SETTINGS_FILE).is_file() {
            return dir.to_path_buf();
        }
        if git_root.is_none() && dir.join(".git").exists() {
            git_root = Some(dir.to_path_buf());
        }
    }
    git_root.unwrap_or_else(|| start.to_path_buf())
}

/// `path` relative to `root`, `.` when they are the same directory.
pub fn relative_to(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => path.to_string_lossy().to_string(),
    }
}
