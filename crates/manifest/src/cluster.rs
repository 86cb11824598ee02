use std::collections::BTreeMap;
use std::path::Path;

use dx_core::{paths, KindCluster, NamespaceStrategy, ResourceProfile};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{from_yaml, read_manifest, ManifestError};

pub const DEFAULT_STATE_FILE: &str = ".dx/.state";

/// `.dx/config.yaml`: named environments, resource profiles and state backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClusterManifest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub resource_profiles: BTreeMap<String, ResourceProfileConfig>,
    #[serde(default)]
    pub state: Option<StateConfig>,
    #[serde(default)]
    pub image_registry: Option<ImageRegistry>,
    // Accepted for compatibility, not interpreted.
    #[serde(default)]
    pub namespace_strategies: Option<serde_yaml::Value>,
    #[serde(default)]
    pub ingress: Option<serde_yaml::Value>,
    #[serde(default)]
    pub storage: Option<serde_yaml::Value>,
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Read as free text; the resolver rejects anything but `kubernetes`.
    pub kind: String,
    pub kube_context: String,
    pub namespace_strategy: NamespaceStrategy,
    #[serde(default)]
    pub default_namespace: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    pub resources_profile: ResourceProfile,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind_cluster: Option<KindCluster>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceProfileConfig {
    pub cpu: String,
    pub memory: String,
    pub replicas: i32,
    #[serde(default)]
    pub hpa: HpaConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HpaConfig {
    pub enabled: bool,
    #[serde(default)]
    pub min_replicas: Option<i32>,
    #[serde(default)]
    pub max_replicas: Option<i32>,
    #[serde(default, rename = "targetCPUUtilization")]
    pub target_cpu_utilization: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    File,
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StateConfig {
    pub backend: StateBackend,
    #[serde(default)]
    pub file_path: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { backend: StateBackend::File, file_path: Some(DEFAULT_STATE_FILE.to_string()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageRegistry {
    pub name: String,
}

impl ClusterManifest {
    /// Load `<root>/.dx/config.yaml`.
    pub fn load(root: &Path) -> Result<Self, ManifestError> {
        let path = root.join(paths::CLUSTER_MANIFEST);
        if !path.is_file() {
            return Err(ManifestError::MissingClusterConfig { path });
        }
        let raw = read_manifest(&path)?;
        let manifest = Self::parse(&path, &raw)?;
        debug!(path = %path.display(), environments = manifest.environments.len(), "cluster manifest loaded");
        Ok(manifest)
    }

    pub fn parse(origin: &Path, raw: &str) -> Result<Self, ManifestError> {
        let manifest: ClusterManifest = from_yaml(origin, raw)?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    fn validate(&self, origin: &Path) -> Result<(), ManifestError> {
        if let Some(kind) = self.kind.as_deref() {
            if kind != "k8s-environments" {
                return Err(ManifestError::invalid(origin, "kind", format!("expected 'k8s-environments', got '{}'", kind)));
            }
        }
        for (name, env) in &self.environments {
            if env.kube_context.trim().is_empty() {
                return Err(ManifestError::invalid(origin, format!("environments.{}.kubeContext", name), "must not be empty"));
            }
        }
        for (name, profile) in &self.resource_profiles {
            if profile.replicas < 0 {
                return Err(ManifestError::invalid(
                    origin,
                    format!("resourceProfiles.{}.replicas", name),
                    "must not be negative",
                ));
            }
        }
        if let Some(StateConfig { backend: StateBackend::File, file_path: Some(p) }) = &self.state {
            if p.trim().is_empty() {
                return Err(ManifestError::invalid(origin, "state.filePath", "must not be empty"));
            }
        }
        Ok(())
    }

    pub fn environment_names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    pub fn environment_exists(&self, name: &str) -> bool {
        self.environments.contains_key(name)
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig, ManifestError> {
        self.environments.get(name).ok_or_else(|| ManifestError::UnknownEnvironment {
            name: name.to_string(),
            available: self.environment_names().join(", "),
        })
    }

    pub fn resource_profile(&self, name: &str) -> Result<&ResourceProfileConfig, ManifestError> {
        self.resource_profiles.get(name).ok_or_else(|| ManifestError::UnknownProfile { name: name.to_string() })
    }

    /// Configured state backend, defaulting to the `.dx/.state` file.
    pub fn state_config(&self) -> StateConfig {
        self.state.clone().unwrap_or_default()
    }
}
