//! dx kubehub: kube clients bound to a named kubeconfig context, plus
//! context listing, reachability and API resource discovery.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dx_core::K8sEnvironment;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use tracing::{debug, info, warn};

/// Remediation shown whenever a cluster for `env` cannot be used.
pub fn remediation(env: &K8sEnvironment) -> String {
    if env.is_local {
        "run `dx k8s init-local` to create and configure the local cluster".to_string()
    } else {
        format!("check that kube context '{}' exists (`dx env list`) and that the cluster is reachable", env.kube_context)
    }
}

/// Client for an explicit kubeconfig context, independent of the current-context.
pub async fn client_for_context(context: &str) -> Result<Client> {
    let opts = KubeConfigOptions { context: Some(context.to_string()), ..Default::default() };
    let config = Config::from_kubeconfig(&opts)
        .await
        .with_context(|| format!("loading kubeconfig for context '{}'", context))?;
    let client = Client::try_from(config).with_context(|| format!("building client for context '{}'", context))?;
    debug!(context = %context, "kube client ready");
    Ok(client)
}

/// Client for a resolved environment, with remediation text on failure.
pub async fn client_for(env: &K8sEnvironment) -> Result<Client> {
    client_for_context(&env.kube_context).await.with_context(|| remediation(env))
}

/// Context names from the user's kubeconfig (`$KUBECONFIG` or `~/.kube/config`).
pub fn list_contexts() -> Result<Vec<String>> {
    let kc = Kubeconfig::read().context("reading kubeconfig")?;
    Ok(context_names(&kc))
}

pub fn context_names(kc: &Kubeconfig) -> Vec<String> {
    let mut names: Vec<String> = kc.contexts.iter().map(|c| c.name.clone()).collect();
    names.sort();
    names.dedup();
    names
}

/// False when the kubeconfig is missing or unreadable.
pub fn context_exists(context: &str) -> bool {
    match list_contexts() {
        Ok(names) => names.iter().any(|n| n == context),
        Err(e) => {
            warn!(error = %e, "cannot read kubeconfig");
            false
        }
    }
}

fn probe_timeout() -> Duration {
    let ms = std::env::var("DX_KUBE_PROBE_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(5000);
    Duration::from_millis(ms)
}

/// API server version probe, bounded by `DX_KUBE_PROBE_MS`.
pub async fn is_reachable(client: &Client) -> bool {
    match tokio::time::timeout(probe_timeout(), client.apiserver_version()).await {
        Ok(Ok(info)) => {
            info!(version = %info.git_version, "cluster reachable");
            true
        }
        Ok(Err(e)) => {
            warn!(error = %e, "cluster not reachable");
            false
        }
        Err(_) => {
            warn!("cluster probe timed out");
            false
        }
    }
}

/// Split `apiVersion` into group and version (`v1` is the core group).
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Served resource for a GVK and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_core::{NamespaceStrategy, ResourceProfile};

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: kind-monocto
clusters:
  - name: kind-monocto
    cluster:
      server: https://127.0.0.1:6443
contexts:
  - name: kind-monocto
    context:
      cluster: kind-monocto
      user: kind-monocto
  - name: gke-dev
    context:
      cluster: kind-monocto
      user: kind-monocto
users:
  - name: kind-monocto
    user:
      token: abc
"#;

    fn env(is_local: bool) -> K8sEnvironment {
        K8sEnvironment {
            name: if is_local { "local".into() } else { "prod".into() },
            kube_context: "ctx".into(),
            namespace_strategy: NamespaceStrategy::Fixed,
            default_namespace: Some("ns".into()),
            domain: None,
            resources_profile: ResourceProfile::Local,
            description: None,
            kind_cluster: None,
            namespace: "ns".into(),
            is_local,
        }
    }

    #[test]
    fn context_names_are_sorted() {
        let kc = Kubeconfig::from_yaml(KUBECONFIG).expect("kubeconfig");
        assert_eq!(context_names(&kc), vec!["gke-dev".to_string(), "kind-monocto".into()]);
    }

    #[test]
    fn splits_core_and_grouped_api_versions() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".to_string()));
        assert_eq!(split_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
    }

    #[test]
    fn remediation_points_local_users_at_init_local() {
        assert!(remediation(&env(true)).contains("dx k8s init-local"));
        assert!(remediation(&env(false)).contains("'ctx'"));
    }
}
