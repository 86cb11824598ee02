//! dx environments: turn an environment name into a concrete context and
//! namespace, and remember which environment is active.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use dx_core::NamespaceStrategy;
use dx_manifest::ManifestError;
use thiserror::Error;

mod namespace;
mod resolve;
mod state;

pub use namespace::{derive_namespace, sanitize_username, SystemIdentity, UserIdentity, PER_USER_PREFIX};
pub use resolve::{format_environment, EnvironmentResolver};
pub use state::{StateOutcome, StateStore, ENV_OVERRIDE};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("environment '{name}' is not a Kubernetes environment (kind={kind})")]
    NotKubernetes { name: String, kind: String },
    #[error("namespace strategy is '{strategy}' but no defaultNamespace is configured")]
    MissingDefaultNamespace { strategy: NamespaceStrategy },
    #[error("unable to determine username for per-user namespace; set $USER or git config user.name")]
    NoUsername,
    #[error("'{namespace}' is not a valid Kubernetes namespace (lowercase [a-z0-9-], no leading or trailing '-', at most 253 chars)")]
    InvalidNamespace { namespace: String },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
