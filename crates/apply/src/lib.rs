//! dx apply: server-side apply of YAML manifests, plus the Deployment/Service
//! pair rendered for services that have no deploy command of their own.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

mod render;

pub use render::{image_for, render_service_pair, to_yaml, DEFAULT_CONTAINER_PORT};

pub const FIELD_MANAGER: &str = "dx";

fn max_yaml_bytes() -> usize {
    std::env::var("DX_MAX_YAML_BYTES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1_000_000)
}

fn max_yaml_nodes() -> usize {
    std::env::var("DX_MAX_YAML_NODES").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// One object ready to apply.
#[derive(Debug, Clone)]
pub struct ApplyTarget {
    pub json: Json,
    pub gvk: GroupVersionKind,
    pub name: String,
    /// From the document; the apply namespace wins for namespaced kinds.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedObject {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub created: bool,
    pub summary: DiffSummary,
}

/// Split a multi-document YAML string into apply targets. Empty documents are skipped.
pub fn parse_documents(yaml: &str) -> Result<Vec<ApplyTarget>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", idx + 1))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        out.push(target_from_json(json).with_context(|| format!("document {}", idx + 1))?);
    }
    Ok(out)
}

pub fn target_from_json(json: Json) -> Result<ApplyTarget> {
    if json_node_budget_exceeded(&json, max_yaml_nodes()) {
        return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
    }
    let api_version = json.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing apiVersion"))?;
    let kind = json.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("YAML missing kind"))?.to_string();
    let (group, version) = dx_kubehub::split_api_version(api_version);
    let meta = json.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("YAML missing metadata.name"))?
        .to_string();
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).map(|s| s.to_string());
    Ok(ApplyTarget { json, gvk: GroupVersionKind { group, version, kind }, name, namespace })
}

/// Server-side apply every target in order into `namespace`.
pub async fn apply_targets(client: &Client, targets: &[ApplyTarget], namespace: &str) -> Result<Vec<AppliedObject>> {
    let mut applied = Vec::with_capacity(targets.len());
    for t in targets {
        applied.push(apply_one(client, t, namespace).await?);
    }
    Ok(applied)
}

/// Directory under a service's path holding hand-written manifests.
pub const MANIFEST_DIR: &str = "k8s";

/// `*.yaml`/`*.yml` files directly under `dir`, sorted by name. A missing directory is empty.
pub fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Parse every manifest file in order into apply targets.
pub fn load_targets(files: &[PathBuf]) -> Result<Vec<ApplyTarget>> {
    let mut targets = Vec::new();
    for path in files {
        let yaml = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        targets.extend(parse_documents(&yaml).with_context(|| format!("parsing {}", path.display()))?);
    }
    Ok(targets)
}

async fn apply_one(client: &Client, target: &ApplyTarget, namespace: &str) -> Result<AppliedObject> {
    let t0 = std::time::Instant::now();
    let (ar, namespaced) = dx_kubehub::find_api_resource(client.clone(), &target.gvk).await?;
    let ns = namespaced.then(|| namespace.to_string());
    let api: Api<DynamicObject> = match ns.as_deref() {
        Some(n) => Api::namespaced_with(client.clone(), n, &ar),
        None => Api::all_with(client.clone(), &ar),
    };

    let mut body = target.json.clone();
    ensure_metadata(&mut body, &target.name, ns.as_deref())?;

    let live = match api.get_opt(&target.name).await? {
        Some(obj) => Some(strip_noisy(serde_json::to_value(&obj)?)),
        None => None,
    };
    let summary = diff_summary(&strip_noisy(body.clone()), live.as_ref().unwrap_or(&Json::Null));

    let pp = PatchParams::apply(FIELD_MANAGER).force();
    if let Err(e) = api.patch(&target.name, &pp, &Patch::Apply(&body)).await {
        counter!("apply_err", 1u64);
        return Err(anyhow!("server-side apply of {} '{}' failed: {}", target.gvk.kind, target.name, e));
    }
    histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("apply_ok", 1u64);
    let created = live.is_none();
    info!(kind = %target.gvk.kind, name = %target.name, ns = ?ns, created, "applied");
    debug!(adds = summary.adds, updates = summary.updates, removes = summary.removes, "apply diff");
    Ok(AppliedObject { kind: target.gvk.kind.clone(), name: target.name.clone(), namespace: ns, created, summary })
}

fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            meta.remove(k);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn ensure_metadata(v: &mut Json, name: &str, ns: Option<&str>) -> Result<()> {
    let obj = v.as_object_mut().ok_or_else(|| anyhow!("manifest document is not a mapping"))?;
    let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    let meta = meta.as_object_mut().ok_or_else(|| anyhow!("metadata is not a mapping"))?;
    meta.insert("name".into(), Json::String(name.to_string()));
    match ns {
        Some(ns) => {
            meta.insert("namespace".into(), Json::String(ns.to_string()));
        }
        None => {
            meta.remove("namespace");
        }
    }
    Ok(())
}

/// Field-level change counts between a desired object and the live one.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
