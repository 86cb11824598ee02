use dx_core::{K8sEnvironment, ServiceDefinition};
use dx_manifest::{ImageRegistry, ResourceProfileConfig};
use serde_json::json;

use crate::ApplyTarget;

pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

const FALLBACK_CPU: &str = "100m";
const FALLBACK_MEMORY: &str = "128Mi";

/// `image` from the manifest, else `<registry>/<name>:latest`, else `<name>:latest`.
pub fn image_for(svc: &ServiceDefinition, registry: Option<&ImageRegistry>) -> String {
    if let Some(image) = svc.image.as_deref().filter(|s| !s.is_empty()) {
        return image.to_string();
    }
    match registry.map(|r| r.name.trim_end_matches('/')).filter(|r| !r.is_empty()) {
        Some(reg) => format!("{}/{}:latest", reg, svc.name),
        None => format!("{}:latest", svc.name),
    }
}

/// Deployment and Service for a service without its own deploy command.
/// Both select on `app=<service>`, which is also what pod lookup uses.
pub fn render_service_pair(
    svc: &ServiceDefinition,
    env: &K8sEnvironment,
    profile: Option<&ResourceProfileConfig>,
    image: &str,
) -> anyhow::Result<Vec<ApplyTarget>> {
    let port = svc.port.unwrap_or(DEFAULT_CONTAINER_PORT);
    let (cpu, memory, replicas) = match profile {
        Some(p) => {
            let replicas = if p.hpa.enabled { p.hpa.min_replicas.unwrap_or(p.replicas) } else { p.replicas };
            (p.cpu.as_str(), p.memory.as_str(), replicas)
        }
        None => (FALLBACK_CPU, FALLBACK_MEMORY, 1),
    };
    let labels = json!({
        "app": svc.name,
        "app.kubernetes.io/managed-by": "dx",
        "dx.dev/environment": env.name,
    });

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": svc.name, "namespace": env.namespace, "labels": labels },
        "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": { "app": svc.name } },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [{
                        "name": svc.name,
                        "image": image,
                        "ports": [{ "containerPort": port }],
                        "env": [
                            { "name": "DX_ENV", "value": env.name },
                            { "name": "DX_NAMESPACE", "value": env.namespace },
                        ],
                        "resources": {
                            "requests": { "cpu": cpu, "memory": memory },
                            "limits": { "cpu": cpu, "memory": memory },
                        },
                    }],
                },
            },
        },
    });

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": svc.name, "namespace": env.namespace, "labels": labels },
        "spec": {
            "selector": { "app": svc.name },
            "ports": [{ "name": "http", "port": port, "targetPort": port }],
        },
    });

    Ok(vec![crate::target_from_json(deployment)?, crate::target_from_json(service)?])
}

/// Targets as a multi-document YAML string.
pub fn to_yaml(targets: &[ApplyTarget]) -> anyhow::Result<String> {
    let mut out = String::new();
    for t in targets {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&t.json)?);
    }
    Ok(out)
}
