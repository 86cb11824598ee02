use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use dx_manifest::{StateBackend, StateConfig, DEFAULT_STATE_FILE};
use tracing::{debug, info};

use crate::StateError;

/// Process-level override of the active environment.
pub const ENV_OVERRIDE: &str = "DX_ENV";

/// What a write or clear actually did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOutcome {
    Written { path: PathBuf },
    Cleared { path: PathBuf },
    /// The env backend cannot change the parent shell; the user has to run this.
    ExportRequired { command: String },
}

/// Active-environment pointer. Concurrent writers race; the last rename wins.
#[derive(Debug, Clone)]
pub struct StateStore {
    backend: StateBackend,
    path: PathBuf,
    override_value: Option<String>,
}

impl StateStore {
    /// Store for a repository, honoring `DX_ENV` from the process environment.
    pub fn from_config(root: &Path, config: &StateConfig) -> Self {
        let rel = config.file_path.as_deref().unwrap_or(DEFAULT_STATE_FILE);
        Self {
            backend: config.backend,
            path: root.join(rel),
            override_value: std::env::var(ENV_OVERRIDE).ok(),
        }
    }

    /// File-backed store at an explicit path, without any override.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { backend: StateBackend::File, path: path.into(), override_value: None }
    }

    /// Replace the override value captured at construction.
    pub fn with_override(mut self, value: Option<String>) -> Self {
        self.override_value = value;
        self
    }

    pub fn backend(&self) -> StateBackend {
        self.backend
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Override first, then the file. No file, or an empty one, means nothing is active.
    pub fn read_active(&self) -> Result<Option<String>, StateError> {
        if let Some(v) = self.override_value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            debug!(env = %v, "active environment from {}", ENV_OVERRIDE);
            return Ok(Some(v.to_string()));
        }
        if self.backend == StateBackend::Env {
            return Ok(None);
        }
        match std::fs::read_to_string(&self.path) {
            Ok(s) => {
                let name = s.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io { path: self.path.clone(), source: e }),
        }
    }

    /// Persist `name` via a temp file in the same directory and a rename.
    pub fn write_active(&self, name: &str) -> Result<StateOutcome, StateError> {
        if self.backend == StateBackend::Env {
            let command = format!("export {}={}", ENV_OVERRIDE, name);
            info!("state backend is 'env'; run `{}` to persist this choice", command);
            return Ok(StateOutcome::ExportRequired { command });
        }
        let io_err = |source| StateError::Io { path: self.path.clone(), source };
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let tmp = dir.join(format!(".state.{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = std::fs::write(&tmp, format!("{}\n", name)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        debug!(env = %name, path = %self.path.display(), "active environment written");
        Ok(StateOutcome::Written { path: self.path.clone() })
    }

    pub fn clear_active(&self) -> Result<StateOutcome, StateError> {
        if self.backend == StateBackend::Env {
            let command = format!("unset {}", ENV_OVERRIDE);
            info!("state backend is 'env'; run `{}` to clear it", command);
            return Ok(StateOutcome::ExportRequired { command });
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::Io { path: self.path.clone(), source: e }),
        }
        Ok(StateOutcome::Cleared { path: self.path.clone() })
    }
}
