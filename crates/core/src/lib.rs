//! dx core types: service definitions, lifecycles and resolved Kubernetes environments.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod paths;

/// A named phase of a service's workflow. Each has its own command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Dev,
    Build,
    Test,
    Lint,
    Migrate,
    Seed,
    Deploy,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 7] = [
        Lifecycle::Dev,
        Lifecycle::Build,
        Lifecycle::Test,
        Lifecycle::Lint,
        Lifecycle::Migrate,
        Lifecycle::Seed,
        Lifecycle::Deploy,
    ];

    /// Lifecycles that carry dependency edges, in the order edges are unioned.
    pub const WITH_EDGES: [Lifecycle; 4] = [Lifecycle::Dev, Lifecycle::Test, Lifecycle::Build, Lifecycle::Deploy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Dev => "dev",
            Lifecycle::Build => "build",
            Lifecycle::Test => "test",
            Lifecycle::Lint => "lint",
            Lifecycle::Migrate => "migrate",
            Lifecycle::Seed => "seed",
            Lifecycle::Deploy => "deploy",
        }
    }

    pub fn has_edges(&self) -> bool {
        Self::WITH_EDGES.contains(self)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lifecycle::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown lifecycle: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Api,
    Service,
    Worker,
    Engine,
    App,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Api => "api",
            ServiceKind::Service => "service",
            ServiceKind::Worker => "worker",
            ServiceKind::Engine => "engine",
            ServiceKind::App => "app",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(ServiceKind::Api),
            "service" => Ok(ServiceKind::Service),
            "worker" => Ok(ServiceKind::Worker),
            "engine" => Ok(ServiceKind::Engine),
            "app" => Ok(ServiceKind::App),
            other => Err(format!("unknown service kind: {}", other)),
        }
    }
}

/// Lifecycle command strings. Any of them may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Commands {
    pub dev: Option<String>,
    pub build: Option<String>,
    pub test: Option<String>,
    pub lint: Option<String>,
    pub migrate: Option<String>,
    pub seed: Option<String>,
    pub deploy: Option<String>,
}

impl Commands {
    pub fn get(&self, lifecycle: Lifecycle) -> Option<&str> {
        let cmd = match lifecycle {
            Lifecycle::Dev => &self.dev,
            Lifecycle::Build => &self.build,
            Lifecycle::Test => &self.test,
            Lifecycle::Lint => &self.lint,
            Lifecycle::Migrate => &self.migrate,
            Lifecycle::Seed => &self.seed,
            Lifecycle::Deploy => &self.deploy,
        };
        cmd.as_deref()
    }

    /// `(lifecycle, command)` pairs for every declared command.
    pub fn iter(&self) -> impl Iterator<Item = (Lifecycle, &str)> + '_ {
        Lifecycle::ALL.into_iter().filter_map(move |l| self.get(l).map(|c| (l, c)))
    }
}

pub type DepList = SmallVec<[String; 4]>;

/// Lifecycle-scoped dependency edges. Only dev/test/build/deploy carry edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Dependencies {
    #[serde(default)]
    pub dev: DepList,
    #[serde(default)]
    pub test: DepList,
    #[serde(default)]
    pub build: DepList,
    #[serde(default)]
    pub deploy: DepList,
}

impl Dependencies {
    pub fn for_lifecycle(&self, lifecycle: Lifecycle) -> &[String] {
        match lifecycle {
            Lifecycle::Dev => &self.dev,
            Lifecycle::Test => &self.test,
            Lifecycle::Build => &self.build,
            Lifecycle::Deploy => &self.deploy,
            Lifecycle::Lint | Lifecycle::Migrate | Lifecycle::Seed => &[],
        }
    }

    /// Union of all four edge lists, first occurrence wins.
    pub fn union(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for lc in Lifecycle::WITH_EDGES {
            for dep in self.for_lifecycle(lc) {
                if !out.contains(&dep.as_str()) {
                    out.push(dep.as_str());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.dev.is_empty() && self.test.is_empty() && self.build.is_empty() && self.deploy.is_empty()
    }
}

/// Capability tags a service may require. Anything else is a validation error.
pub const KNOWN_INFRA: &[&str] = &["docker", "kubernetes", "database", "cache", "queue"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Infra {
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

/// Identity and behavior contract for one service, one per `service.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    pub name: String,
    /// Directory relative to the repository root. Set by the loader.
    #[serde(default)]
    pub path: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Container port used by the rendered deployment.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub commands: Commands,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub infra: Infra,
}

impl ServiceDefinition {
    /// Minimal definition; handy for building catalogs in code.
    pub fn new(name: impl Into<String>, kind: ServiceKind) -> Self {
        let name = name.into();
        Self {
            path: name.clone(),
            name,
            kind,
            language: None,
            runtime: None,
            description: None,
            tags: Vec::new(),
            port: None,
            image: None,
            commands: Commands::default(),
            dependencies: Dependencies::default(),
            infra: Infra::default(),
        }
    }

    pub fn command(&self, lifecycle: Lifecycle) -> Option<&str> {
        self.commands.get(lifecycle)
    }

    pub fn deps(&self, lifecycle: Lifecycle) -> &[String] {
        self.dependencies.for_lifecycle(lifecycle)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NamespaceStrategy {
    Fixed,
    PerUser,
    PerTeam,
}

impl fmt::Display for NamespaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NamespaceStrategy::Fixed => "fixed",
            NamespaceStrategy::PerUser => "per-user",
            NamespaceStrategy::PerTeam => "per-team",
        })
    }
}

/// Named bundle of CPU/memory/replica defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceProfile {
    Local,
    Dev,
    Prod,
}

impl ResourceProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceProfile::Local => "local",
            ResourceProfile::Dev => "dev",
            ResourceProfile::Prod => "prod",
        }
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KindCluster {
    pub name: String,
    #[serde(default)]
    pub config: Option<String>,
}

/// Environment name designated as the local bootstrap cluster.
pub const LOCAL_ENV: &str = "local";

/// Resolved runtime description of a deployment target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct K8sEnvironment {
    pub name: String,
    pub kube_context: String,
    pub namespace_strategy: NamespaceStrategy,
    pub default_namespace: Option<String>,
    pub domain: Option<String>,
    pub resources_profile: ResourceProfile,
    pub description: Option<String>,
    pub kind_cluster: Option<KindCluster>,
    /// Derived at resolution time.
    pub namespace: String,
    pub is_local: bool,
}

pub const MAX_NAMESPACE_LEN: usize = 253;

static NAMESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap());

/// Lowercase `[a-z0-9-]`, no leading or trailing `-`, at most 253 chars.
pub fn is_valid_namespace(ns: &str) -> bool {
    ns.len() <= MAX_NAMESPACE_LEN && NAMESPACE_RE.is_match(ns)
}

pub mod prelude {
    pub use super::{
        Commands, Dependencies, Infra, K8sEnvironment, KindCluster, Lifecycle, NamespaceStrategy, ResourceProfile,
        ServiceDefinition, ServiceKind,
    };
}
