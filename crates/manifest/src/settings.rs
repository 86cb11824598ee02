use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use dx_core::paths;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{from_yaml, read_manifest, ManifestError};

/// `dx.config.yml`: discovery, execution and tool-wrapping settings. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub version: Option<String>,
    pub title: Option<String>,
    pub service_discovery: DiscoverySettings,
    pub execution: ExecutionSettings,
    pub mise: MiseSettings,
    pub service_groups: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySettings {
    /// Scan root, relative to the repository root.
    pub root: String,
    /// Manifest file name to look for.
    pub manifest: String,
    /// Directory names never descended into.
    pub exclude: Vec<String>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            root: ".".to_string(),
            manifest: "service.yaml".to_string(),
            exclude: ["node_modules", "dist", ".git", "target"].iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSettings {
    pub parallel_limit: usize,
    /// 0 disables the per-command timeout.
    pub timeout_ms: u64,
    pub exit_on_error: bool,
    pub stream_logs: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self { parallel_limit: 4, timeout_ms: 0, exit_on_error: true, stream_logs: true }
    }
}

impl ExecutionSettings {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MiseSettings {
    pub enabled: bool,
}

impl Settings {
    /// Load `<root>/dx.config.yml` (defaults when absent), then apply `DX_*` overrides.
    pub fn load(root: &Path) -> Result<Self, ManifestError> {
        let path = root.join(paths::SETTINGS_FILE);
        let mut settings = if path.is_file() {
            let raw = read_manifest(&path)?;
            let s: Settings = from_yaml(&path, &raw)?;
            debug!(path = %path.display(), "settings loaded");
            s
        } else {
            debug!(path = %path.display(), "no settings file; using defaults");
            Settings::default()
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(n) = std::env::var("DX_PARALLEL_LIMIT").ok().and_then(|s| s.parse::<usize>().ok()) {
            self.execution.parallel_limit = n;
        }
        if let Some(ms) = std::env::var("DX_TIMEOUT_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            self.execution.timeout_ms = ms;
        }
        if self.execution.parallel_limit == 0 {
            warn!("parallel_limit of 0 is not usable; falling back to 1");
            self.execution.parallel_limit = 1;
        }
    }

    pub fn service_group(&self, name: &str) -> Option<&[String]> {
        self.service_groups.get(name).map(|v| v.as_slice())
    }
}
