#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use dx_manifest::DiscoverySettings;
use dx_registry::{find_manifests, ServiceRegistry};

/// Removes the directory when the test ends.
struct TempDir(PathBuf);

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn temp_repo(tag: &str) -> (TempDir, PathBuf) {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let p = std::env::temp_dir().join(format!("dx-registry-{}-{}", tag, nanos));
    std::fs::create_dir_all(&p).unwrap();
    (TempDir(p.clone()), p)
}

fn write(root: &Path, rel: &str, body: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, body).unwrap();
}

#[test]
fn discovers_valid_manifests_and_skips_broken_and_excluded() {
    let (_tmp, root) = temp_repo("scan");
    write(&root, "account-api/service.yaml", "name: account-api\nkind: api\n");
    write(
        &root,
        "rating-api/service.yaml",
        "name: rating-api\nkind: api\ndependencies:\n  build: [account-api]\n",
    );
    write(&root, "broken/service.yaml", "name: broken\nkind: api\nnot_a_field: 1\n");
    write(&root, "node_modules/pkg/service.yaml", "name: vendored\nkind: api\n");

    let reg = ServiceRegistry::new(&root, DiscoverySettings::default());
    let cat = reg.discover();
    let names: Vec<&str> = cat.names().collect();
    assert_eq!(names, vec!["account-api", "rating-api"]);
    assert_eq!(cat.get("rating-api").unwrap().path, "rating-api");
    assert!(reg.validate().is_empty());
}

#[test]
fn discovery_is_cached_until_reset() {
    let (_tmp, root) = temp_repo("cache");
    write(&root, "a/service.yaml", "name: a\nkind: worker\n");
    let reg = ServiceRegistry::new(&root, DiscoverySettings::default());
    assert_eq!(reg.discover().len(), 1);

    write(&root, "b/service.yaml", "name: b\nkind: worker\n");
    assert_eq!(reg.discover().len(), 1);

    reg.reset();
    assert_eq!(reg.discover().len(), 2);
}

#[test]
fn custom_manifest_name_and_root() {
    let (_tmp, root) = temp_repo("custom");
    write(&root, "services/x/dx.yaml", "name: x\nkind: engine\n");
    write(&root, "other/y/dx.yaml", "name: y\nkind: engine\n");
    let settings = DiscoverySettings { root: "services".into(), manifest: "dx.yaml".into(), exclude: vec![] };
    let found = find_manifests(&root, &settings);
    assert_eq!(found.len(), 1);
    assert!(found[0].ends_with("services/x/dx.yaml"));
}
