//! Collaborators the orchestration core talks to: the container runtime, the
//! datastore client, the remote archive, the uploads archiver and the source
//! tree. Production implementations shell out to the usual CLI tools; tests
//! substitute fakes.

pub mod archive;
pub mod assets;
pub mod docker;
pub mod postgres;
pub mod source;
pub mod sqlite;

pub use archive::{LocalDirArchive, S3CliArchive};
pub use assets::TarArchiver;
pub use docker::DockerComposeRuntime;
pub use postgres::PostgresClient;
pub use source::GitSource;
pub use sqlite::SqliteClient;

use crate::backup::DatastoreKind;
use crate::error::ErrorClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{target} is unreachable: {message}")]
    Unreachable { target: String, message: String },

    #[error("command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("restored datastore is inconsistent: {0}")]
    Inconsistent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RuntimeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::Unreachable { .. } => ErrorClass::Connectivity,
            RuntimeError::NotFound(_) => ErrorClass::State,
            RuntimeError::Inconsistent(_) => ErrorClass::Integrity,
            RuntimeError::Unsupported(_) => ErrorClass::Configuration,
            _ => ErrorClass::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Runtime-reported state of one compose service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerStatus {
    pub service: String,
    /// `running`, `exited`, `restarting`, ... or `missing` when no container exists
    pub state: String,
    /// Health reported by the container's healthcheck; `None` when it defines none
    pub health: Option<String>,
}

impl ContainerStatus {
    pub fn missing(service: &str) -> Self {
        Self {
            service: service.to_string(),
            state: "missing".to_string(),
            health: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + std::fmt::Debug {
    async fn status(&self, service: &str) -> Result<ContainerStatus>;
    async fn list(&self) -> Result<Vec<ContainerStatus>>;
    async fn stop(&self) -> Result<()>;
    async fn build(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn restart(&self) -> Result<()>;
    /// Run a command inside a running service container and return its stdout.
    async fn exec(&self, service: &str, command: &[String]) -> Result<String>;
    async fn logs(&self, tail: usize) -> Result<String>;
    async fn prune_images(&self) -> Result<()>;
}

#[async_trait]
pub trait DatastoreClient: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> DatastoreKind;

    /// Lightweight connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Native archive-format dump (relational stores only).
    async fn dump_native(&self, dest: &Path) -> Result<()>;

    /// Uncompressed portable dump: plain SQL for relational stores, an online
    /// consistent file copy for embedded stores.
    async fn dump_portable(&self, dest: &Path) -> Result<()>;

    /// Read back a native dump's table of contents.
    async fn list_native(&self, dump: &Path) -> Result<Vec<String>>;

    /// Overwrite the destination from a native dump.
    async fn restore_native(&self, dump: &Path) -> Result<()>;

    /// Replace the destination with an uncompressed portable dump.
    async fn restore_portable(&self, source: &Path) -> Result<()>;

    /// Post-restore verification of the destination. `toc` is the snapshot's
    /// native table of contents, empty when none was read back.
    async fn check_consistency(&self, toc: &[String]) -> Result<()>;

    /// The live database file for embedded stores.
    fn live_file(&self) -> Option<&Path> {
        None
    }
}

/// Remote object storage holding mirrored snapshot artifacts.
#[async_trait]
pub trait ArchiveStore: Send + Sync + std::fmt::Debug {
    async fn put(&self, key: &str, source: &Path) -> Result<()>;
    async fn get(&self, key: &str, dest: &Path) -> Result<()>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Compressed archives of the uploaded-assets directory.
#[async_trait]
pub trait AssetArchiver: Send + Sync + std::fmt::Debug {
    async fn create(&self, source_dir: &Path, dest: &Path) -> Result<()>;
    /// Returns the archive's entry listing; an unreadable archive is an error.
    async fn verify(&self, archive: &Path) -> Result<Vec<String>>;
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}

#[async_trait]
pub trait SourceRepository: Send + Sync + std::fmt::Debug {
    async fn revision(&self) -> Result<String>;
    /// Fetch the newest revision and return its identifier.
    async fn update(&self) -> Result<String>;
}

/// Run a prepared command, turning spawn failures and non-zero exits into
/// `RuntimeError::CommandFailed` carrying stderr.
pub(crate) async fn run_command(cmd: &mut Command, label: &str) -> Result<Output> {
    debug!("Executing {}", label);

    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RuntimeError::CommandFailed {
            command: label.to_string(),
            message: format!("failed to execute: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RuntimeError::CommandFailed {
            command: label.to_string(),
            message: format!("{} ({})", stderr.trim(), output.status),
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_reports_missing_program() {
        let mut cmd = Command::new("printhub-ops-definitely-not-installed");
        let err = run_command(&mut cmd, "missing").await.unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { .. }));
    }

    #[test]
    fn test_error_classes() {
        let unreachable = RuntimeError::Unreachable {
            target: "postgres".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(unreachable.class(), ErrorClass::Connectivity);
        assert_eq!(
            RuntimeError::NotFound("key".to_string()).class(),
            ErrorClass::State
        );
        assert_eq!(
            RuntimeError::Inconsistent("orders missing".to_string()).class(),
            ErrorClass::Integrity
        );
    }
}
