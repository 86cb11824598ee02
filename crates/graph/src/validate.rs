use dx_core::ServiceDefinition;
use dx_registry::Catalog;
use rustc_hash::FxHashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Whole-catalog checks run before any execution: dangling references and cycles.
///
/// Cycle detection walks the union of the dev/test/build/deploy edges of each
/// service, so a loop that only closes across two lifecycles is reported too.
pub struct GraphValidator<'a> {
    catalog: &'a Catalog,
}

impl<'a> GraphValidator<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// All diagnostics; empty means the graph is safe to resolve.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.missing_references();
        errors.extend(self.cycles().into_iter().map(|path| format!("Dependency cycle detected: {}", path.join(" -> "))));
        errors
    }

    pub fn missing_references(&self) -> Vec<String> {
        let mut out = Vec::new();
        for svc in self.catalog.all() {
            for dep in svc.dependencies.union() {
                if !self.catalog.contains(dep) {
                    out.push(format!("service '{}' references non-existent dependency '{}'", svc.name, dep));
                }
            }
        }
        out
    }

    /// Every back edge found by a three-color DFS, as a closed path `a, b, .., a`.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut color: FxHashMap<&str, Color> = self.catalog.names().map(|n| (n, Color::White)).collect();
        let mut stack = Vec::new();
        let mut found = Vec::new();
        for svc in self.catalog.all() {
            if color.get(svc.name.as_str()) == Some(&Color::White) {
                self.dfs(svc, &mut color, &mut stack, &mut found);
            }
        }
        found
    }

    fn dfs(
        &self,
        svc: &'a ServiceDefinition,
        color: &mut FxHashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        found: &mut Vec<Vec<String>>,
    ) {
        color.insert(svc.name.as_str(), Color::Gray);
        stack.push(svc.name.as_str());
        for dep in svc.dependencies.union() {
            // dangling references are reported separately
            let Some(dep_svc) = self.catalog.get(dep) else {
                continue;
            };
            match color.get(dep).copied().unwrap_or(Color::White) {
                Color::White => self.dfs(dep_svc, color, stack, found),
                Color::Gray => {
                    let start = stack.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                    path.push(dep.to_string());
                    found.push(path);
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color.insert(svc.name.as_str(), Color::Black);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_core::ServiceKind;

    fn svc(name: &str, build: &[&str], test: &[&str]) -> ServiceDefinition {
        let mut s = ServiceDefinition::new(name, ServiceKind::Api);
        s.dependencies.build = build.iter().map(|d| d.to_string()).collect();
        s.dependencies.test = test.iter().map(|d| d.to_string()).collect();
        s
    }

    #[test]
    fn clean_graph_has_no_diagnostics() {
        let cat = Catalog::from_services(vec![svc("a", &["b"], &[]), svc("b", &[], &[])]);
        assert!(GraphValidator::new(&cat).validate().is_empty());
    }

    #[test]
    fn reports_exactly_the_missing_reference() {
        let cat = Catalog::from_services(vec![svc("a", &["z"], &[]), svc("b", &[], &["a"])]);
        assert_eq!(
            GraphValidator::new(&cat).validate(),
            vec!["service 'a' references non-existent dependency 'z'".to_string()]
        );
    }

    #[test]
    fn mutual_test_dependency_is_a_cycle() {
        let cat = Catalog::from_services(vec![svc("a", &[], &["b"]), svc("b", &[], &["a"])]);
        let errs = GraphValidator::new(&cat).validate();
        assert_eq!(errs, vec!["Dependency cycle detected: a -> b -> a".to_string()]);
    }

    #[test]
    fn cycle_spanning_lifecycles_is_reported() {
        let cat = Catalog::from_services(vec![svc("a", &["b"], &[]), svc("b", &[], &["c"]), svc("c", &["a"], &[])]);
        let cycles = GraphValidator::new(&cat).cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn self_loop_and_tail_into_cycle() {
        let cat = Catalog::from_services(vec![
            svc("entry", &["loop-a"], &[]),
            svc("loop-a", &["loop-b"], &[]),
            svc("loop-b", &["loop-a"], &[]),
            svc("selfish", &["selfish"], &[]),
        ]);
        let cycles = GraphValidator::new(&cat).cycles();
        assert!(cycles.contains(&vec!["loop-a".to_string(), "loop-b".into(), "loop-a".into()]));
        assert!(cycles.contains(&vec!["selfish".to_string(), "selfish".into()]));
        assert!(cycles.iter().all(|c| !c.contains(&"entry".to_string())));
    }
}
