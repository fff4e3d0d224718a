//! Typed error hierarchy for Anvil.
//!
//! Three top-level enums cover the three subsystems:
//! - `WorkspaceError`: workspace store leases, diff application, snapshots
//! - `FactoryError`: registry, setup tracker and build submission failures
//! - `ConfigError`: loading and validating `anvil.toml`
//!
//! Collaborator failures (`CollaboratorError`) live in `anvil-common` next
//! to the traits that return them.

use thiserror::Error;

pub use anvil_common::CollaboratorError;

/// Errors from the workspace store.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Workspace for factory {factory_id} is already leased by an in-flight build")]
    AlreadyExists { factory_id: i64 },

    #[error("Invalid workspace path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Failed to apply diff at '{path}': {source}")]
    ApplyFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot {id} not found for factory {factory_id}")]
    SnapshotNotFound { factory_id: i64, id: String },

    #[error("Snapshot {id} is corrupt: {reason}")]
    CorruptSnapshot { id: String, reason: String },

    #[error("Snapshot belongs to factory {snapshot_factory}, not {factory_id}")]
    ForeignSnapshot {
        factory_id: i64,
        snapshot_factory: i64,
    },

    #[error("Workspace lease table unavailable: {0}")]
    LeaseTableUnavailable(String),

    #[error("Workspace I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the factory registry, setup tracker and build runner.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Factory {id} not found")]
    FactoryNotFound { id: i64 },

    #[error("Build attempt {id} not found")]
    AttemptNotFound { id: String },

    #[error("Setup task {id} not found")]
    SetupTaskNotFound { id: i64 },

    #[error("Invalid status transition for factory {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Factory {id} is {status} and cannot accept feature requests")]
    NotAcceptingRequests { id: i64, status: String },

    #[error("A build is already in flight for factory {factory_id}")]
    BuildInFlight { factory_id: i64 },

    #[error("Build attempt {id} is not running")]
    AttemptNotRunning { id: String },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {message}")]
    Parse {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_error_already_exists_carries_factory() {
        let err = WorkspaceError::AlreadyExists { factory_id: 9 };
        match &err {
            WorkspaceError::AlreadyExists { factory_id } => assert_eq!(*factory_id, 9),
            _ => panic!("Expected AlreadyExists"),
        }
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn workspace_error_apply_failed_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = WorkspaceError::ApplyFailed {
            path: "src/lib.rs".into(),
            source: io_err,
        };
        match &err {
            WorkspaceError::ApplyFailed { path, source } => {
                assert_eq!(path, "src/lib.rs");
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected ApplyFailed"),
        }
    }

    #[test]
    fn factory_error_converts_from_workspace_error() {
        let inner = WorkspaceError::AlreadyExists { factory_id: 3 };
        let err: FactoryError = inner.into();
        assert!(matches!(
            err,
            FactoryError::Workspace(WorkspaceError::AlreadyExists { factory_id: 3 })
        ));
    }

    #[test]
    fn factory_error_transition_message() {
        let err = FactoryError::InvalidTransition {
            id: 1,
            from: "paused".into(),
            to: "provisioning".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for factory 1: paused -> provisioning"
        );
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&WorkspaceError::AlreadyExists { factory_id: 1 });
        assert_std_error(&FactoryError::FactoryNotFound { id: 1 });
        assert_std_error(&ConfigError::Invalid("x".into()));
        assert_std_error(&CollaboratorError::Transient("x".into()));
    }
}
