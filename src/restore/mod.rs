pub mod confirmation;
pub mod restore_manager;

pub use confirmation::*;
pub use restore_manager::*;

use crate::backup::{BackupError, DatastoreKind, SnapshotId};
use crate::error::ErrorClass;
use crate::runtime::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    Apply,
    /// Validate only; nothing is mutated and nobody is prompted
    DryRun,
}

/// How an operator names the snapshot to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotRef {
    Id(SnapshotId),
    /// Any artifact file of the snapshot
    Path(PathBuf),
    /// A remote archive key, or a bare identifier looked up under the
    /// configured prefix
    Remote(String),
}

impl SnapshotRef {
    pub fn parse(raw: &str, from_remote: bool) -> Self {
        let raw = raw.trim();
        if from_remote {
            return SnapshotRef::Remote(raw.to_string());
        }
        match SnapshotId::parse(raw) {
            Some(id) => SnapshotRef::Id(id),
            None => SnapshotRef::Path(PathBuf::from(raw)),
        }
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotRef::Id(id) => write!(f, "{id}"),
            SnapshotRef::Path(path) => write!(f, "{}", path.display()),
            SnapshotRef::Remote(key) => write!(f, "remote:{key}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub reference: SnapshotRef,
    pub mode: RestoreMode,
    /// Skip the confirmation prompt
    pub force: bool,
    /// Replay the plain SQL dump even when a native dump exists
    pub prefer_portable: bool,
}

impl RestoreRequest {
    pub fn dry_run(reference: SnapshotRef) -> Self {
        Self {
            reference,
            mode: RestoreMode::DryRun,
            force: false,
            prefer_portable: false,
        }
    }

    pub fn apply(reference: SnapshotRef, force: bool) -> Self {
        Self {
            reference,
            mode: RestoreMode::Apply,
            force,
            prefer_portable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMethod {
    /// pg_restore --clean --if-exists
    Native,
    /// Drop, recreate and replay plain SQL
    Portable,
    /// Replace the database file
    EmbeddedFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResult {
    pub snapshot_id: SnapshotId,
    pub mode: RestoreMode,
    /// `None` for dry runs
    pub method: Option<RestoreMethod>,
    /// Dump table of contents, or one line per checked artifact
    pub contents: Vec<String>,
    /// Copy of the live database file taken before it was overwritten
    pub safety_copy: Option<PathBuf>,
    pub uploads_restored: bool,
    pub size_bytes: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("Snapshot not found: {reference}")]
    SnapshotNotFound { reference: String },

    #[error("Failed to fetch {key} from the remote archive: {message}")]
    RemoteFetchFailed { key: String, message: String },

    #[error("Restored datastore failed verification: {message}")]
    VerificationFailed { message: String },

    #[error("Restore destination unreachable: {message}")]
    DestinationUnreachable { message: String },

    #[error("Snapshot {snapshot} is corrupt: {message}")]
    Corrupt { snapshot: String, message: String },

    #[error("Snapshot holds a {snapshot} datastore but the destination is {destination}")]
    KindMismatch {
        snapshot: DatastoreKind,
        destination: DatastoreKind,
    },

    #[error("Restore cancelled by operator")]
    Cancelled,

    #[error("Restore failed: {message}")]
    ApplyFailed { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RestoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RestoreError::SnapshotNotFound { .. } => ErrorClass::State,
            RestoreError::RemoteFetchFailed { .. }
            | RestoreError::DestinationUnreachable { .. } => ErrorClass::Connectivity,
            RestoreError::VerificationFailed { .. } | RestoreError::Corrupt { .. } => {
                ErrorClass::Integrity
            }
            RestoreError::KindMismatch { .. } => ErrorClass::Configuration,
            RestoreError::Cancelled
            | RestoreError::ApplyFailed { .. }
            | RestoreError::Io(_) => ErrorClass::Other,
        }
    }

    fn apply_failed(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable { target, message } => {
                RestoreError::DestinationUnreachable {
                    message: format!("{target}: {message}"),
                }
            }
            other => RestoreError::ApplyFailed {
                message: other.to_string(),
            },
        }
    }
}

impl From<BackupError> for RestoreError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Corrupt { snapshot, message } => RestoreError::Corrupt { snapshot, message },
            BackupError::Io(e) => RestoreError::Io(e),
            other => RestoreError::ApplyFailed {
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RestoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parsing() {
        assert!(matches!(
            SnapshotRef::parse("20240501_020000_000", false),
            SnapshotRef::Id(_)
        ));
        assert_eq!(
            SnapshotRef::parse("/backups/20240501_020000_000.dump", false),
            SnapshotRef::Path(PathBuf::from("/backups/20240501_020000_000.dump"))
        );
        assert_eq!(
            SnapshotRef::parse("backups/20240501_020000_000.dump", true),
            SnapshotRef::Remote("backups/20240501_020000_000.dump".to_string())
        );
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            RestoreError::Corrupt {
                snapshot: "x".to_string(),
                message: "bad frame".to_string()
            }
            .class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            RestoreError::SnapshotNotFound {
                reference: "x".to_string()
            }
            .class(),
            ErrorClass::State
        );
        assert_eq!(
            RestoreError::apply_failed(RuntimeError::Unreachable {
                target: "db".to_string(),
                message: "refused".to_string()
            })
            .class(),
            ErrorClass::Connectivity
        );
    }
}
