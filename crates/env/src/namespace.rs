use std::path::PathBuf;

use dx_core::{is_valid_namespace, NamespaceStrategy, MAX_NAMESPACE_LEN};
use dx_exec::{CommandSpec, Executor};
use tracing::debug;

use crate::EnvError;

pub const PER_USER_PREFIX: &str = "dev-";

/// Where a per-user namespace gets its user name from.
pub trait UserIdentity {
    /// Version-control identity (`git config user.name`).
    fn vcs_user(&self) -> Option<String>;
    /// Session user name.
    fn os_user(&self) -> Option<String>;
}

/// Real identity sources: git, then `$USER` / `$USERNAME`.
pub struct SystemIdentity<'a> {
    executor: &'a Executor,
    cwd: Option<PathBuf>,
}

impl<'a> SystemIdentity<'a> {
    pub fn new(executor: &'a Executor) -> Self {
        Self { executor, cwd: None }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl UserIdentity for SystemIdentity<'_> {
    fn vcs_user(&self) -> Option<String> {
        let mut spec = CommandSpec::new("git", ["config", "user.name"]).quiet().ignore_errors(true);
        if let Some(dir) = &self.cwd {
            spec = spec.cwd(dir);
        }
        let res = self.executor.run_blocking(&spec);
        let name = res.stdout.trim();
        (res.success && !name.is_empty()).then(|| name.to_string())
    }

    fn os_user(&self) -> Option<String> {
        ["USER", "USERNAME"]
            .iter()
            .filter_map(|k| std::env::var(k).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// Lowercase, map everything outside `[a-z0-9-]` to `-`, trim dashes, and cut to fit
/// behind the per-user prefix. `None` when nothing usable is left.
pub fn sanitize_username(raw: &str) -> Option<String> {
    let mapped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' { c } else { '-' })
        .collect();
    let budget = MAX_NAMESPACE_LEN - PER_USER_PREFIX.len();
    let trimmed = mapped.trim_matches('-');
    let cut = &trimmed[..trimmed.len().min(budget)];
    let cut = cut.trim_end_matches('-');
    (!cut.is_empty()).then(|| cut.to_string())
}

/// Namespace for a strategy. The result always satisfies the namespace-token rule.
///
/// `per-team` has no team lookup and uses the default namespace like `fixed`.
pub fn derive_namespace(
    strategy: NamespaceStrategy,
    default_namespace: Option<&str>,
    identity: &dyn UserIdentity,
) -> Result<String, EnvError> {
    match strategy {
        NamespaceStrategy::Fixed | NamespaceStrategy::PerTeam => {
            let ns = default_namespace
                .filter(|s| !s.is_empty())
                .ok_or(EnvError::MissingDefaultNamespace { strategy })?;
            if !is_valid_namespace(ns) {
                return Err(EnvError::InvalidNamespace { namespace: ns.to_string() });
            }
            Ok(ns.to_string())
        }
        NamespaceStrategy::PerUser => {
            let user = identity
                .vcs_user()
                .and_then(|u| sanitize_username(&u))
                .or_else(|| identity.os_user().and_then(|u| sanitize_username(&u)))
                .ok_or(EnvError::NoUsername)?;
            let ns = format!("{}{}", PER_USER_PREFIX, user);
            debug!(ns = %ns, "derived per-user namespace");
            Ok(ns)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeIdentity {
        vcs: Option<&'static str>,
        os: Option<&'static str>,
    }

    impl UserIdentity for FakeIdentity {
        fn vcs_user(&self) -> Option<String> {
            self.vcs.map(String::from)
        }
        fn os_user(&self) -> Option<String> {
            self.os.map(String::from)
        }
    }

    const NOBODY: FakeIdentity = FakeIdentity { vcs: None, os: None };

    #[test]
    fn fixed_returns_default_exactly() {
        assert_eq!(derive_namespace(NamespaceStrategy::Fixed, Some("monocto-prod"), &NOBODY).unwrap(), "monocto-prod");
    }

    #[test]
    fn fixed_without_default_errors() {
        let err = derive_namespace(NamespaceStrategy::Fixed, None, &NOBODY).unwrap_err();
        assert!(matches!(err, EnvError::MissingDefaultNamespace { strategy: NamespaceStrategy::Fixed }));
        assert!(err.to_string().contains("'fixed'"));
    }

    #[test]
    fn per_team_degrades_to_default() {
        assert_eq!(derive_namespace(NamespaceStrategy::PerTeam, Some("monocto-dev"), &NOBODY).unwrap(), "monocto-dev");
        assert!(matches!(
            derive_namespace(NamespaceStrategy::PerTeam, None, &NOBODY),
            Err(EnvError::MissingDefaultNamespace { strategy: NamespaceStrategy::PerTeam })
        ));
    }

    #[test]
    fn configured_namespace_must_be_a_valid_token() {
        let err = derive_namespace(NamespaceStrategy::Fixed, Some("Monocto_Prod"), &NOBODY).unwrap_err();
        assert!(matches!(err, EnvError::InvalidNamespace { .. }));
    }

    #[test]
    fn per_user_sanitizes_git_name() {
        let id = FakeIdentity { vcs: Some("Alice.Smith"), os: Some("root") };
        let ns = derive_namespace(NamespaceStrategy::PerUser, None, &id).unwrap();
        assert_eq!(ns, "dev-alice-smith");
        assert!(is_valid_namespace(&ns));
    }

    #[test]
    fn per_user_falls_back_to_os_user() {
        let id = FakeIdentity { vcs: None, os: Some("bob") };
        assert_eq!(derive_namespace(NamespaceStrategy::PerUser, None, &id).unwrap(), "dev-bob");
        // a git name that sanitizes to nothing is skipped
        let id = FakeIdentity { vcs: Some("...."), os: Some("carol") };
        assert_eq!(derive_namespace(NamespaceStrategy::PerUser, None, &id).unwrap(), "dev-carol");
    }

    #[test]
    fn per_user_without_any_identity_errors() {
        assert!(matches!(derive_namespace(NamespaceStrategy::PerUser, None, &NOBODY), Err(EnvError::NoUsername)));
    }

    #[test]
    fn long_and_odd_names_stay_within_limits() {
        let long = format!("{}.{}", "X".repeat(300), "y");
        let s = sanitize_username(&long).unwrap();
        let ns = format!("{}{}", PER_USER_PREFIX, s);
        assert!(ns.len() <= MAX_NAMESPACE_LEN);
        assert!(is_valid_namespace(&ns));

        // truncation point lands on a dash
        let dashy = format!("{}-{}", "a".repeat(248), "bbbb");
        let s = sanitize_username(&dashy).unwrap();
        assert_eq!(s, "a".repeat(248));

        assert_eq!(sanitize_username("--Zoë Ångström--").as_deref(), Some("zo---ngstr-m"));
        assert_eq!(sanitize_username("___"), None);
    }
}
