use super::{DatastoreClient, Result, RuntimeError};
use crate::backup::DatastoreKind;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Embedded file-backed datastore accessed through sqlx.
#[derive(Debug, Clone)]
pub struct SqliteClient {
    path: PathBuf,
}

impl SqliteClient {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn connect(&self) -> Result<SqliteConnection> {
        if !self.path.exists() {
            return Err(RuntimeError::Unreachable {
                target: self.path.display().to_string(),
                message: "database file does not exist".to_string(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(false);

        SqliteConnection::connect_with(&options)
            .await
            .map_err(|e| RuntimeError::Unreachable {
                target: self.path.display().to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl DatastoreClient for SqliteClient {
    fn kind(&self) -> DatastoreKind {
        DatastoreKind::Embedded
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        sqlx::query("SELECT 1").execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    async fn dump_native(&self, _dest: &Path) -> Result<()> {
        Err(RuntimeError::Unsupported(
            "embedded datastores have no native dump format".to_string(),
        ))
    }

    /// `VACUUM INTO` produces a transactionally consistent copy while other
    /// connections keep writing.
    async fn dump_portable(&self, dest: &Path) -> Result<()> {
        debug!("Copying {} to {} online", self.path.display(), dest.display());
        let mut conn = self.connect().await?;
        sqlx::query("VACUUM INTO ?")
            .bind(dest.to_string_lossy().into_owned())
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }

    async fn list_native(&self, _dump: &Path) -> Result<Vec<String>> {
        Err(RuntimeError::Unsupported(
            "embedded datastores have no native dump format".to_string(),
        ))
    }

    async fn restore_native(&self, _dump: &Path) -> Result<()> {
        Err(RuntimeError::Unsupported(
            "embedded datastores have no native dump format".to_string(),
        ))
    }

    async fn restore_portable(&self, source: &Path) -> Result<()> {
        fs::copy(source, &self.path).await?;

        // Journal files from the replaced database must not be replayed
        // against the restored one.
        for suffix in ["-wal", "-shm"] {
            let mut journal = self.path.clone().into_os_string();
            journal.push(suffix);
            let journal = PathBuf::from(journal);
            if journal.exists() {
                fs::remove_file(&journal).await?;
            }
        }

        info!("Replaced {} from {}", self.path.display(), source.display());
        Ok(())
    }

    async fn check_consistency(&self, _toc: &[String]) -> Result<()> {
        let mut conn = self.connect().await?;
        let rows: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;

        if rows.len() == 1 && rows[0] == "ok" {
            debug!("Integrity check passed for {}", self.path.display());
            Ok(())
        } else {
            Err(RuntimeError::Inconsistent(format!(
                "PRAGMA integrity_check: {}",
                rows.join("; ")
            )))
        }
    }

    fn live_file(&self) -> Option<&Path> {
        Some(&self.path)
    }
}
