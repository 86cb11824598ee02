//! Which services a lifecycle invocation touches, and in what order.

use dx_core::{Lifecycle, ServiceDefinition};
use dx_graph::{DependencyResolver, GraphError};
use dx_registry::Catalog;
use tracing::warn;

/// Services named on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Group(Vec<String>),
    One(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanFlags {
    /// Only the named services, no dependency resolution.
    pub single: bool,
    /// Depth groups instead of a sequential chain for single targets.
    pub parallel: bool,
}

/// Stages run strictly in order; services inside one stage may run concurrently.
pub type Stages<'a> = Vec<Vec<&'a ServiceDefinition>>;

pub fn plan<'a>(
    catalog: &'a Catalog,
    lifecycle: Lifecycle,
    selection: &Selection,
    flags: PlanFlags,
) -> Result<Stages<'a>, GraphError> {
    let resolver = DependencyResolver::new(catalog);
    match selection {
        Selection::All => resolver.resolve_global_by_depth(lifecycle),
        Selection::One(name) if flags.single => Ok(vec![vec![lookup(catalog, name)?]]),
        Selection::One(name) if flags.parallel => resolver.resolve_by_depth(name, lifecycle),
        Selection::One(name) => Ok(chain(resolver.resolve_dependencies(name, lifecycle)?)),
        Selection::Group(members) => {
            let mut order: Vec<&'a ServiceDefinition> = Vec::new();
            for name in members {
                let resolved = if flags.single {
                    vec![lookup(catalog, name)?]
                } else {
                    resolver.resolve_dependencies(name, lifecycle)?
                };
                for svc in resolved {
                    if !order.iter().any(|s| s.name == svc.name) {
                        order.push(svc);
                    }
                }
            }
            Ok(chain(order))
        }
    }
}

fn lookup<'a>(catalog: &'a Catalog, name: &str) -> Result<&'a ServiceDefinition, GraphError> {
    catalog.get(name).ok_or_else(|| GraphError::ServiceNotFound { name: name.to_string() })
}

fn chain(order: Vec<&ServiceDefinition>) -> Stages<'_> {
    order.into_iter().map(|svc| vec![svc]).collect()
}

/// Drop services without a command for `lifecycle`, and stages left empty.
pub fn runnable(stages: Stages<'_>, lifecycle: Lifecycle) -> Stages<'_> {
    stages
        .into_iter()
        .map(|stage| {
            stage
                .into_iter()
                .filter(|svc| {
                    let has = svc.command(lifecycle).is_some();
                    if !has {
                        warn!(service = %svc.name, "no {} command configured; skipping", lifecycle);
                    }
                    has
                })
                .collect::<Vec<_>>()
        })
        .filter(|stage| !stage.is_empty())
        .collect()
}
