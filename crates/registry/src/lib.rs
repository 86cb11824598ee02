//! dx service registry: discovers `service.yaml` manifests into an in-memory catalog.
//!
//! The catalog is built once per discovery pass and published as an immutable
//! snapshot; readers share it without locking. `reset()` drops the snapshot so
//! the next `discover()` rescans.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dx_core::{ServiceDefinition, ServiceKind, KNOWN_INFRA};
use dx_manifest::{load_service_manifest, DiscoverySettings};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

/// Immutable snapshot of discovered services keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: BTreeMap<String, ServiceDefinition>,
}

impl Catalog {
    /// Build from definitions; a repeated name keeps the first occurrence.
    pub fn from_services<I: IntoIterator<Item = ServiceDefinition>>(services: I) -> Self {
        let mut map = BTreeMap::new();
        for svc in services {
            if map.contains_key(&svc.name) {
                warn!(service = %svc.name, path = %svc.path, "duplicate service name; keeping first definition");
                continue;
            }
            map.insert(svc.name.clone(), svc);
        }
        Self { services: map }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// All services in name order.
    pub fn all(&self) -> impl Iterator<Item = &ServiceDefinition> + '_ {
        self.services.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.services.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn by_kind(&self, kind: ServiceKind) -> Vec<&ServiceDefinition> {
        self.all().filter(|s| s.kind == kind).collect()
    }

    pub fn by_tag(&self, tag: &str) -> Vec<&ServiceDefinition> {
        self.all().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// Per-service reference and infra errors. Empty map means clean.
    pub fn validate(&self) -> BTreeMap<String, Vec<String>> {
        let mut errors = BTreeMap::new();
        for (name, svc) in &self.services {
            let mut svc_errors = Vec::new();
            for dep in svc.dependencies.union() {
                if !self.services.contains_key(dep) {
                    svc_errors.push(format!("Dependency '{}' not found", dep));
                }
            }
            for req in &svc.infra.requires {
                if !KNOWN_INFRA.contains(&req.as_str()) {
                    svc_errors.push(format!("Unknown infra requirement: {}", req));
                }
            }
            for opt in &svc.infra.optional {
                if !KNOWN_INFRA.contains(&opt.as_str()) {
                    svc_errors.push(format!("Unknown optional infra: {}", opt));
                }
            }
            if !svc_errors.is_empty() {
                errors.insert(name.clone(), svc_errors);
            }
        }
        errors
    }

    /// Closest known names to `name`, best first.
    pub fn suggest(&self, name: &str, limit: usize) -> Vec<String> {
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<(i64, &str)> = self
            .names()
            .filter_map(|candidate| {
                let forward = matcher.fuzzy_match(candidate, name);
                let backward = matcher.fuzzy_match(name, candidate);
                forward.max(backward).map(|score| (score, candidate))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(b.1)));
        scored.into_iter().take(limit).map(|(_, n)| n.to_string()).collect()
    }
}

/// Registry over a repository. Construct one per invocation and pass it to consumers.
pub struct ServiceRegistry {
    root: PathBuf,
    discovery: DiscoverySettings,
    catalog: ArcSwapOption<Catalog>,
}

impl ServiceRegistry {
    pub fn new(root: impl Into<PathBuf>, discovery: DiscoverySettings) -> Self {
        Self { root: root.into(), discovery, catalog: ArcSwapOption::empty() }
    }

    /// Registry pre-populated with an explicit catalog; `discover()` returns it without scanning.
    pub fn from_services<I: IntoIterator<Item = ServiceDefinition>>(services: I) -> Self {
        let me = Self::new(PathBuf::from("."), DiscoverySettings::default());
        me.catalog.store(Some(Arc::new(Catalog::from_services(services))));
        me
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan for manifests once; later calls return the cached catalog until `reset()`.
    pub fn discover(&self) -> Arc<Catalog> {
        if let Some(cat) = self.catalog.load_full() {
            return cat;
        }
        let started = std::time::Instant::now();
        let manifests = find_manifests(&self.root, &self.discovery);
        info!(count = manifests.len(), "found service manifest(s)");

        let mut services = Vec::with_capacity(manifests.len());
        for path in &manifests {
            match load_service_manifest(path, &self.root) {
                Ok(svc) => {
                    debug!(service = %svc.name, path = %svc.path, "loaded service");
                    services.push(svc);
                }
                Err(e) => {
                    counter!("registry_manifests_rejected_total", 1u64);
                    warn!(path = %path.display(), error = %e, "failed to load service manifest; skipping");
                }
            }
        }
        let cat = Arc::new(Catalog::from_services(services));
        info!(count = cat.len(), "discovered service(s)");
        histogram!("registry_discover_ms", started.elapsed().as_secs_f64() * 1000.0);
        self.catalog.store(Some(cat.clone()));
        cat
    }

    /// Current catalog, discovering first if needed.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.discover()
    }

    pub fn get_service(&self, name: &str) -> Option<ServiceDefinition> {
        self.discover().get(name).cloned()
    }

    pub fn validate(&self) -> BTreeMap<String, Vec<String>> {
        self.discover().validate()
    }

    pub fn reset(&self) {
        self.catalog.store(None);
    }
}

/// Manifest paths under the discovery root in sorted order, skipping excluded directories.
pub fn find_manifests(repo_root: &Path, discovery: &DiscoverySettings) -> Vec<PathBuf> {
    let scan_root = repo_root.join(&discovery.root);
    let walker = walkdir::WalkDir::new(&scan_root).sort_by_file_name().into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        !discovery.exclude.iter().any(|x| name == x.as_str())
    });
    let mut out = Vec::new();
    for entry in walker {
        match entry {
            Ok(e) if e.file_type().is_file() && e.file_name() == discovery.manifest.as_str() => {
                out.push(e.into_path());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "skipping unreadable path during discovery"),
        }
    }
    out
}
