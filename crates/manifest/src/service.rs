use std::path::Path;

use dx_core::{is_valid_namespace, paths, ServiceDefinition};

use crate::{from_yaml, read_manifest, ManifestError};

/// Load one `service.yaml`; `path` is rewritten to the manifest's directory relative to `root`.
pub fn load_service_manifest(yaml_path: &Path, root: &Path) -> Result<ServiceDefinition, ManifestError> {
    let raw = read_manifest(yaml_path)?;
    let dir = yaml_path.parent().unwrap_or(root);
    parse_service_manifest(yaml_path, &raw, &paths::relative_to(root, dir))
}

pub fn parse_service_manifest(origin: &Path, raw: &str, rel_dir: &str) -> Result<ServiceDefinition, ManifestError> {
    let mut svc: ServiceDefinition = from_yaml(origin, raw)?;
    validate_service(origin, &svc)?;
    svc.path = rel_dir.to_string();
    Ok(svc)
}

// Names double as Kubernetes object names and label values.
fn validate_service(origin: &Path, svc: &ServiceDefinition) -> Result<(), ManifestError> {
    if svc.name.is_empty() {
        return Err(ManifestError::invalid(origin, "name", "must not be empty"));
    }
    if !is_valid_namespace(&svc.name) || svc.name.len() > 63 {
        return Err(ManifestError::invalid(
            origin,
            "name",
            format!("'{}' must be lowercase [a-z0-9-], at most 63 chars, not starting or ending with '-'", svc.name),
        ));
    }
    for (lifecycle, cmd) in svc.commands.iter() {
        if cmd.trim().is_empty() {
            return Err(ManifestError::invalid(origin, format!("commands.{}", lifecycle), "must not be empty"));
        }
    }
    for lifecycle in dx_core::Lifecycle::WITH_EDGES {
        for dep in svc.deps(lifecycle) {
            if dep.is_empty() {
                return Err(ManifestError::invalid(
                    origin,
                    format!("dependencies.{}", lifecycle),
                    "dependency names must not be empty",
                ));
            }
        }
    }
    if svc.port == Some(0) {
        return Err(ManifestError::invalid(origin, "port", "must be between 1 and 65535"));
    }
    Ok(())
}
