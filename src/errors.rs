//! Error types for configuration, backend resolution and lifecycle.
//!
//! Configuration errors are recoverable at the call site.  Resolution and
//! bring-up errors are surfaced only after everything they touched has been
//! rolled back, so holding one never implies a leaked backend.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::Role;
use crate::config::StorageKind;

/// Failures while locating, parsing or reading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No configuration source exists at any searched location.
    #[error("no configuration found (searched: {})", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    /// A source was found but is structurally invalid.
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },

    /// An index accessor was called with an index past the end.
    #[error("{what} index {index} out of range (have {len})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    /// The source exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            reason: reason.into(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failures while resolving a backend module.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No module is registered under the derived name.
    #[error("backend module {module} not found")]
    NotFound { module: String },

    /// The module exists but has no entry point for the requested role.
    #[error("backend module {module} has no {role} entry point")]
    MissingEntryPoint { module: String, role: Role },

    /// The module was built against a different backend ABI.
    #[error("backend module {module} has ABI version {found}, expected {expected}")]
    AbiMismatch {
        module: String,
        expected: u32,
        found: u32,
    },

    /// The entry point produced a handle for a different storage kind.
    #[error("backend module {module} returned a {found} handle, expected {expected}")]
    KindMismatch {
        module: String,
        expected: StorageKind,
        found: StorageKind,
    },

    /// The entry point refused the requested component.
    #[error("backend module {module} rejected component {component}: {reason}")]
    Rejected {
        module: String,
        component: String,
        reason: String,
    },
}

/// Failures during bring-up.  Always fully rolled back before returned.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A backend could not be resolved.
    #[error("failed to load {kind} backend {backend}{}: {source}", display_tier(.tier))]
    Load {
        kind: StorageKind,
        tier: Option<usize>,
        backend: String,
        #[source]
        source: LoadError,
    },

    /// A backend was resolved but its `init` failed.
    #[error("could not initialize {kind} backend {backend}{} at {path}: {source}", display_tier(.tier))]
    InitFailed {
        kind: StorageKind,
        tier: Option<usize>,
        backend: String,
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// A client-only collaborator failed to start.
    #[error("could not start client collaborator {name}: {source}")]
    CollaboratorFailed {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl LifecycleError {
    /// Storage kind the failure is attributed to, if any.
    pub fn kind(&self) -> Option<StorageKind> {
        match self {
            LifecycleError::Load { kind, .. } | LifecycleError::InitFailed { kind, .. } => {
                Some(*kind)
            }
            LifecycleError::CollaboratorFailed { .. } => None,
        }
    }

    /// Tier the failure is attributed to, if any.
    pub fn tier(&self) -> Option<usize> {
        match self {
            LifecycleError::Load { tier, .. } | LifecycleError::InitFailed { tier, .. } => *tier,
            LifecycleError::CollaboratorFailed { .. } => None,
        }
    }
}

fn display_tier(tier: &Option<usize>) -> String {
    match tier {
        Some(t) => format!(" (tier {t})"),
        None => String::new(),
    }
}

/// Failures of the process-wide state API.
#[derive(Debug, Error)]
pub enum StateError {
    /// An accessor was called before a successful initialization.
    #[error("julea is not initialized")]
    NotInitialized,

    /// A server-role initialization was requested while a state is
    /// already published.
    #[error("julea is already initialized")]
    AlreadyInitialized,

    /// A tier accessor was called with an unknown tier.
    #[error("{kind} tier {tier} out of range (have {len})")]
    OutOfRange {
        kind: StorageKind,
        tier: usize,
        len: usize,
    },

    /// Configuration could not be loaded for bring-up.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Bring-up failed and was rolled back.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Convenience result alias for the state API.
pub type Result<T, E = StateError> = std::result::Result<T, E>;

/// Any error produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    State(#[from] StateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_lists_paths() {
        let err = ConfigError::NotFound {
            searched: vec![PathBuf::from("/a/julea"), PathBuf::from("/b/julea")],
        };
        assert_eq!(
            err.to_string(),
            "no configuration found (searched: /a/julea, /b/julea)"
        );
    }

    #[test]
    fn test_init_failed_names_kind_and_tier() {
        let err = LifecycleError::InitFailed {
            kind: StorageKind::Object,
            tier: Some(2),
            backend: "posix".to_string(),
            path: "/tmp/o".to_string(),
            source: anyhow::anyhow!("disk on fire"),
        };
        assert_eq!(err.kind(), Some(StorageKind::Object));
        assert_eq!(err.tier(), Some(2));
        let msg = err.to_string();
        assert!(msg.contains("object backend posix (tier 2)"), "{msg}");
        assert!(msg.contains("disk on fire"), "{msg}");
    }

    #[test]
    fn test_db_error_has_no_tier() {
        let err = LifecycleError::Load {
            kind: StorageKind::Db,
            tier: None,
            backend: "sqlite".to_string(),
            source: LoadError::NotFound {
                module: "db-server-sqlite".to_string(),
            },
        };
        assert_eq!(err.tier(), None);
        assert!(!err.to_string().contains("tier"));
    }

    #[test]
    fn test_top_level_error_is_transparent() {
        let err: Error = StateError::OutOfRange {
            kind: StorageKind::KeyValue,
            tier: 4,
            len: 1,
        }
        .into();
        assert_eq!(err.to_string(), "kv tier 4 out of range (have 1)");

        let err: Error = ConfigError::invalid("missing [db] backend").into();
        assert!(matches!(err, Error::Config(ConfigError::Invalid { .. })));
    }
}
