use dx_core::{K8sEnvironment, LOCAL_ENV};
use dx_manifest::ClusterManifest;
use tracing::{debug, warn};

use crate::namespace::{derive_namespace, UserIdentity};
use crate::EnvError;

/// Resolves environment names against one loaded cluster manifest.
pub struct EnvironmentResolver<'a> {
    manifest: &'a ClusterManifest,
    identity: &'a dyn UserIdentity,
}

impl<'a> EnvironmentResolver<'a> {
    pub fn new(manifest: &'a ClusterManifest, identity: &'a dyn UserIdentity) -> Self {
        Self { manifest, identity }
    }

    pub fn manifest(&self) -> &ClusterManifest {
        self.manifest
    }

    pub fn resolve(&self, name: &str) -> Result<K8sEnvironment, EnvError> {
        let cfg = self.manifest.environment(name)?;
        if cfg.kind != "kubernetes" {
            return Err(EnvError::NotKubernetes { name: name.to_string(), kind: cfg.kind.clone() });
        }
        let namespace = derive_namespace(cfg.namespace_strategy, cfg.default_namespace.as_deref(), self.identity)?;
        let is_local = name == LOCAL_ENV;
        let kind_cluster = match (&cfg.kind_cluster, is_local) {
            (Some(k), true) => Some(k.clone()),
            (Some(k), false) => {
                warn!(env = %name, cluster = %k.name, "kindCluster is only used by the '{}' environment; ignoring", LOCAL_ENV);
                None
            }
            (None, _) => None,
        };
        debug!(env = %name, context = %cfg.kube_context, ns = %namespace, "resolved environment");
        Ok(K8sEnvironment {
            name: name.to_string(),
            kube_context: cfg.kube_context.clone(),
            namespace_strategy: cfg.namespace_strategy,
            default_namespace: cfg.default_namespace.clone(),
            domain: cfg.domain.clone(),
            resources_profile: cfg.resources_profile,
            description: cfg.description.clone(),
            kind_cluster,
            namespace,
            is_local,
        })
    }
}

/// Multi-line summary for `env use` / `env current`.
pub fn format_environment(env: &K8sEnvironment) -> String {
    let mut lines = vec![
        format!("Environment: {}", env.name),
        "  Kind: kubernetes".to_string(),
        format!("  Kube Context: {}", env.kube_context),
        format!("  Namespace: {}", env.namespace),
        format!("  Namespace Strategy: {}", env.namespace_strategy),
        format!("  Resources Profile: {}", env.resources_profile),
    ];
    if let Some(domain) = &env.domain {
        lines.push(format!("  Domain: {}", domain));
    }
    if let Some(desc) = &env.description {
        lines.push(format!("  Description: {}", desc));
    }
    if let (Some(k), true) = (&env.kind_cluster, env.is_local) {
        lines.push(format!("  Kind Cluster: {}", k.name));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_core::{NamespaceStrategy, ResourceProfile};
    use std::path::Path;

    struct Fixed(&'static str);

    impl UserIdentity for Fixed {
        fn vcs_user(&self) -> Option<String> {
            Some(self.0.to_string())
        }
        fn os_user(&self) -> Option<String> {
            None
        }
    }

    const CLUSTER: &str = r#"
environments:
  local:
    kind: kubernetes
    kubeContext: kind-monocto
    namespaceStrategy: fixed
    defaultNamespace: monocto-local
    resourcesProfile: local
    kindCluster:
      name: monocto
  dev:
    kind: kubernetes
    kubeContext: gke-dev
    namespaceStrategy: per-user
    resourcesProfile: dev
    domain: dev.example.com
    kindCluster:
      name: stray
  legacy:
    kind: nomad
    kubeContext: none
    namespaceStrategy: fixed
    defaultNamespace: legacy
    resourcesProfile: prod
"#;

    fn manifest() -> ClusterManifest {
        ClusterManifest::parse(Path::new(".dx/config.yaml"), CLUSTER).unwrap()
    }

    #[test]
    fn resolves_local_with_kind_cluster() {
        let m = manifest();
        let id = Fixed("ignored");
        let env = EnvironmentResolver::new(&m, &id).resolve("local").unwrap();
        assert!(env.is_local);
        assert_eq!(env.namespace, "monocto-local");
        assert_eq!(env.kube_context, "kind-monocto");
        assert_eq!(env.resources_profile, ResourceProfile::Local);
        assert_eq!(env.kind_cluster.map(|k| k.name), Some("monocto".to_string()));
    }

    #[test]
    fn per_user_env_derives_namespace_and_drops_stray_kind_cluster() {
        let m = manifest();
        let id = Fixed("Alice.Smith");
        let env = EnvironmentResolver::new(&m, &id).resolve("dev").unwrap();
        assert!(!env.is_local);
        assert_eq!(env.namespace_strategy, NamespaceStrategy::PerUser);
        assert_eq!(env.namespace, "dev-alice-smith");
        assert!(env.kind_cluster.is_none());

        let text = format_environment(&env);
        assert!(text.starts_with("Environment: dev\n"));
        assert!(text.contains("  Namespace: dev-alice-smith"));
        assert!(text.contains("  Namespace Strategy: per-user"));
        assert!(text.contains("  Domain: dev.example.com"));
        assert!(!text.contains("Kind Cluster"));
    }

    #[test]
    fn rejects_unknown_and_non_kubernetes() {
        let m = manifest();
        let id = Fixed("x");
        let r = EnvironmentResolver::new(&m, &id);
        let unknown = r.resolve("staging").unwrap_err();
        assert!(matches!(unknown, EnvError::Manifest(_)));
        assert!(unknown.to_string().contains("Available environments: dev, legacy, local"));
        let nomad = r.resolve("legacy").unwrap_err();
        assert!(matches!(nomad, EnvError::NotKubernetes { .. }));
    }
}
