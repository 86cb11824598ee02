//! dx manifest loader: parses and schema-validates service manifests, the
//! cluster-environment manifest and the tool settings file.
//!
//! Structural violations are rejected on first error with a field-level message.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

pub mod cluster;
pub mod service;
pub mod settings;

pub use cluster::{
    ClusterManifest, EnvironmentConfig, HpaConfig, ImageRegistry, ResourceProfileConfig, StateBackend, StateConfig,
    DEFAULT_STATE_FILE,
};
pub use service::{load_service_manifest, parse_service_manifest};
pub use settings::{DiscoverySettings, ExecutionSettings, MiseSettings, Settings};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: manifest too large (>{limit} bytes)")]
    TooLarge { path: PathBuf, limit: usize },
    #[error("{path}:{line}:{column}: {message}")]
    Parse { path: PathBuf, line: usize, column: usize, message: String },
    #[error("{path}: field '{field}': {message}")]
    Invalid { path: PathBuf, field: String, message: String },
    #[error("cluster configuration not found at {path}\nCreate .dx/config.yaml with environment definitions.")]
    MissingClusterConfig { path: PathBuf },
    #[error("environment '{name}' not found in .dx/config.yaml\nAvailable environments: {available}")]
    UnknownEnvironment { name: String, available: String },
    #[error("resource profile '{name}' not configured")]
    UnknownProfile { name: String },
}

impl ManifestError {
    fn invalid(path: &Path, field: impl Into<String>, message: impl Into<String>) -> Self {
        ManifestError::Invalid { path: path.to_path_buf(), field: field.into(), message: message.into() }
    }
}

fn max_manifest_bytes() -> usize {
    std::env::var("DX_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

/// Read a manifest file, enforcing the size budget.
pub(crate) fn read_manifest(path: &Path) -> Result<String, ManifestError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io { path: path.to_path_buf(), source })?;
    let limit = max_manifest_bytes();
    if raw.len() > limit {
        return Err(ManifestError::TooLarge { path: path.to_path_buf(), limit });
    }
    Ok(raw)
}

/// Deserialize YAML, keeping the error location.
pub(crate) fn from_yaml<T: serde::de::DeserializeOwned>(path: &Path, raw: &str) -> Result<T, ManifestError> {
    serde_yaml::from_str(raw).map_err(|e| {
        let (line, column) = e.location().map(|l| (l.line(), l.column())).unwrap_or((0, 0));
        ManifestError::Parse { path: path.to_path_buf(), line, column, message: e.to_string() }
    })
}
