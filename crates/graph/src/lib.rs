//! dx dependency graph over a registry catalog.
//!
//! Edges are lifecycle-scoped: `a` depends on `b` for `build` says nothing
//! about `dev`. The resolver follows one lifecycle's edges; the validator
//! checks the union of all of them.

#![forbid(unsafe_code)]

use dx_core::{Lifecycle, ServiceDefinition};
use dx_registry::Catalog;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, warn};

mod validate;

pub use validate::GraphValidator;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("service '{name}' not found")]
    ServiceNotFound { name: String },
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

pub type DepthGroups<'a> = Vec<Vec<&'a ServiceDefinition>>;

/// Execution-order resolution for one catalog snapshot.
pub struct DependencyResolver<'a> {
    catalog: &'a Catalog,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    fn lookup(&self, name: &str) -> Result<&'a ServiceDefinition, GraphError> {
        self.catalog.get(name).ok_or_else(|| GraphError::ServiceNotFound { name: name.to_string() })
    }

    /// `name` and its transitive `lifecycle` dependencies, dependencies first, `name` last.
    ///
    /// Nodes are marked on entry, so a diamond yields each service once. Cyclic
    /// input terminates but the order is then meaningless; run the validator first.
    pub fn resolve_dependencies(
        &self,
        name: &str,
        lifecycle: Lifecycle,
    ) -> Result<Vec<&'a ServiceDefinition>, GraphError> {
        let root = self.lookup(name)?;
        let mut visited = FxHashSet::default();
        let mut out = Vec::new();
        self.visit(root, lifecycle, &mut visited, &mut out)?;
        debug!(service = %name, lifecycle = %lifecycle, count = out.len(), "resolved dependencies");
        Ok(out)
    }

    fn visit(
        &self,
        svc: &'a ServiceDefinition,
        lifecycle: Lifecycle,
        visited: &mut FxHashSet<&'a str>,
        out: &mut Vec<&'a ServiceDefinition>,
    ) -> Result<(), GraphError> {
        if !visited.insert(svc.name.as_str()) {
            return Ok(());
        }
        for dep in svc.deps(lifecycle) {
            let dep_svc = self.lookup(dep)?;
            self.visit(dep_svc, lifecycle, visited, out)?;
        }
        out.push(svc);
        Ok(())
    }

    /// Topological order over the whole catalog. Dangling references are skipped with a warning.
    pub fn resolve_global(&self, lifecycle: Lifecycle) -> Vec<&'a ServiceDefinition> {
        let mut visited = FxHashSet::default();
        let mut out = Vec::with_capacity(self.catalog.len());
        for svc in self.catalog.all() {
            self.visit_lenient(svc, lifecycle, &mut visited, &mut out);
        }
        out
    }

    fn visit_lenient(
        &self,
        svc: &'a ServiceDefinition,
        lifecycle: Lifecycle,
        visited: &mut FxHashSet<&'a str>,
        out: &mut Vec<&'a ServiceDefinition>,
    ) {
        if !visited.insert(svc.name.as_str()) {
            return;
        }
        for dep in svc.deps(lifecycle) {
            match self.catalog.get(dep) {
                Some(dep_svc) => self.visit_lenient(dep_svc, lifecycle, visited, out),
                None => warn!(service = %svc.name, dependency = %dep, "skipping unknown dependency"),
            }
        }
        out.push(svc);
    }

    /// Services reachable from `name` grouped by depth (0 = no dependencies), ascending.
    /// Within a group services are name-ordered and share no edges.
    pub fn resolve_by_depth(&self, name: &str, lifecycle: Lifecycle) -> Result<DepthGroups<'a>, GraphError> {
        let root = self.lookup(name)?;
        let mut depths = FxHashMap::default();
        let mut stack = Vec::new();
        self.depth_of(root, lifecycle, &mut depths, &mut stack)?;
        Ok(group_by_depth(depths))
    }

    /// Depth groups over the whole catalog.
    pub fn resolve_global_by_depth(&self, lifecycle: Lifecycle) -> Result<DepthGroups<'a>, GraphError> {
        let mut depths = FxHashMap::default();
        let mut stack = Vec::new();
        for svc in self.catalog.all() {
            self.depth_of(svc, lifecycle, &mut depths, &mut stack)?;
        }
        Ok(group_by_depth(depths))
    }

    fn depth_of(
        &self,
        svc: &'a ServiceDefinition,
        lifecycle: Lifecycle,
        depths: &mut FxHashMap<&'a str, (usize, &'a ServiceDefinition)>,
        stack: &mut Vec<&'a str>,
    ) -> Result<usize, GraphError> {
        if let Some((d, _)) = depths.get(svc.name.as_str()) {
            return Ok(*d);
        }
        if let Some(pos) = stack.iter().position(|n| *n == svc.name) {
            let mut path: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
            path.push(svc.name.clone());
            return Err(GraphError::Cycle { path });
        }
        stack.push(svc.name.as_str());
        let mut depth = 0;
        for dep in svc.deps(lifecycle) {
            let dep_svc = self.lookup(dep)?;
            depth = depth.max(self.depth_of(dep_svc, lifecycle, depths, stack)? + 1);
        }
        stack.pop();
        depths.insert(svc.name.as_str(), (depth, svc));
        Ok(depth)
    }
}

fn group_by_depth<'a>(depths: FxHashMap<&'a str, (usize, &'a ServiceDefinition)>) -> DepthGroups<'a> {
    let max = depths.values().map(|(d, _)| *d).max();
    let Some(max) = max else {
        return Vec::new();
    };
    let mut groups: DepthGroups<'a> = vec![Vec::new(); max + 1];
    for (_, (d, svc)) in depths {
        groups[d].push(svc);
    }
    for g in &mut groups {
        g.sort_by(|a, b| a.name.cmp(&b.name));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_core::ServiceKind;

    fn svc(name: &str, lifecycle: Lifecycle, deps: &[&str]) -> ServiceDefinition {
        let mut s = ServiceDefinition::new(name, ServiceKind::Service);
        let list = deps.iter().map(|d| d.to_string()).collect();
        match lifecycle {
            Lifecycle::Dev => s.dependencies.dev = list,
            Lifecycle::Test => s.dependencies.test = list,
            Lifecycle::Build => s.dependencies.build = list,
            Lifecycle::Deploy => s.dependencies.deploy = list,
            _ => {}
        }
        s
    }

    fn names(v: &[&ServiceDefinition]) -> Vec<String> {
        v.iter().map(|s| s.name.clone()).collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn chain_resolves_leaf_first() {
        let cat = Catalog::from_services(vec![
            svc("a", Lifecycle::Build, &["b"]),
            svc("b", Lifecycle::Build, &["c"]),
            svc("c", Lifecycle::Build, &[]),
        ]);
        let r = DependencyResolver::new(&cat);
        assert_eq!(names(&r.resolve_dependencies("a", Lifecycle::Build).unwrap()), vec!["c", "b", "a"]);
    }

    #[test]
    fn edges_are_lifecycle_scoped() {
        let cat = Catalog::from_services(vec![svc("a", Lifecycle::Build, &["b"]), svc("b", Lifecycle::Build, &[])]);
        let r = DependencyResolver::new(&cat);
        assert_eq!(names(&r.resolve_dependencies("a", Lifecycle::Dev).unwrap()), vec!["a"]);
        assert_eq!(names(&r.resolve_dependencies("a", Lifecycle::Lint).unwrap()), vec!["a"]);
    }

    #[test]
    fn diamond_lists_shared_dependency_once() {
        let cat = Catalog::from_services(vec![
            svc("top", Lifecycle::Test, &["left", "right"]),
            svc("left", Lifecycle::Test, &["base"]),
            svc("right", Lifecycle::Test, &["base"]),
            svc("base", Lifecycle::Test, &[]),
        ]);
        let r = DependencyResolver::new(&cat);
        let order = names(&r.resolve_dependencies("top", Lifecycle::Test).unwrap());
        assert_eq!(order.len(), 4);
        assert_eq!(order.last().map(|s| s.as_str()), Some("top"));
        assert!(position(&order, "base") < position(&order, "left"));
        assert!(position(&order, "base") < position(&order, "right"));
    }

    #[test]
    fn missing_root_or_dependency_is_named() {
        let cat = Catalog::from_services(vec![svc("a", Lifecycle::Build, &["ghost"])]);
        let r = DependencyResolver::new(&cat);
        assert_eq!(
            r.resolve_dependencies("nope", Lifecycle::Build).unwrap_err(),
            GraphError::ServiceNotFound { name: "nope".into() }
        );
        assert_eq!(
            r.resolve_dependencies("a", Lifecycle::Build).unwrap_err(),
            GraphError::ServiceNotFound { name: "ghost".into() }
        );
    }

    #[test]
    fn depth_groups_ascend_and_share_no_edges() {
        let cat = Catalog::from_services(vec![
            svc("top", Lifecycle::Build, &["left", "right", "base"]),
            svc("left", Lifecycle::Build, &["base"]),
            svc("right", Lifecycle::Build, &["base"]),
            svc("base", Lifecycle::Build, &[]),
        ]);
        let r = DependencyResolver::new(&cat);
        let groups = r.resolve_by_depth("top", Lifecycle::Build).unwrap();
        let got: Vec<Vec<String>> = groups.iter().map(|g| names(g)).collect();
        assert_eq!(got, vec![vec!["base".to_string()], vec!["left".into(), "right".into()], vec!["top".into()]]);
        for g in &groups {
            for a in g {
                for b in g {
                    assert!(!a.deps(Lifecycle::Build).contains(&b.name));
                }
            }
        }
    }

    #[test]
    fn depth_resolution_reports_cycles() {
        let cat = Catalog::from_services(vec![svc("a", Lifecycle::Test, &["b"]), svc("b", Lifecycle::Test, &["a"])]);
        let r = DependencyResolver::new(&cat);
        let err = r.resolve_by_depth("a", Lifecycle::Test).unwrap_err();
        assert_eq!(err, GraphError::Cycle { path: vec!["a".into(), "b".into(), "a".into()] });
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
        // marked-on-entry traversal still terminates
        assert_eq!(r.resolve_dependencies("a", Lifecycle::Test).unwrap().len(), 2);
    }

    #[test]
    fn global_order_respects_every_edge() {
        let cat = Catalog::from_services(vec![
            svc("web", Lifecycle::Deploy, &["api"]),
            svc("api", Lifecycle::Deploy, &["db-migrator", "ghost"]),
            svc("db-migrator", Lifecycle::Deploy, &[]),
            svc("lonely", Lifecycle::Deploy, &[]),
        ]);
        let r = DependencyResolver::new(&cat);
        let order = names(&r.resolve_global(Lifecycle::Deploy));
        assert_eq!(order.len(), 4);
        assert!(position(&order, "db-migrator") < position(&order, "api"));
        assert!(position(&order, "api") < position(&order, "web"));

        let groups = r.resolve_global_by_depth(Lifecycle::Deploy);
        assert!(groups.is_err());
    }
}
