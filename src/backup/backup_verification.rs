use super::{compression, ArtifactKind, BackupError, DatastoreKind, Result, Snapshot, SnapshotId};
use crate::runtime::{AssetArchiver, DatastoreClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub(crate) const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

/// Read-back checks for a written snapshot. Nothing is restored; each
/// artifact is opened and decoded far enough to prove it is usable.
#[derive(Debug, Clone)]
pub struct SnapshotVerifier {
    datastore: Arc<dyn DatastoreClient>,
    assets: Arc<dyn AssetArchiver>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCheck {
    pub kind: ArtifactKind,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub snapshot_id: SnapshotId,
    pub verification_time: DateTime<Utc>,
    pub checks: Vec<ArtifactCheck>,
    /// Table of contents of the native dump, when one was read back
    pub contents: Vec<String>,
    pub issues_found: Vec<String>,
}

impl VerificationReport {
    fn new(snapshot_id: SnapshotId) -> Self {
        Self {
            snapshot_id,
            verification_time: Utc::now(),
            checks: Vec::new(),
            contents: Vec::new(),
            issues_found: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.issues_found.is_empty()
    }

    fn record(&mut self, kind: ArtifactKind, outcome: std::result::Result<String, String>) {
        match outcome {
            Ok(detail) => self.checks.push(ArtifactCheck {
                kind,
                passed: true,
                detail,
            }),
            Err(issue) => {
                self.issues_found.push(format!("{}: {}", kind.suffix(), issue));
                self.checks.push(ArtifactCheck {
                    kind,
                    passed: false,
                    detail: issue,
                });
            }
        }
    }

    /// `Corrupt` carrying every issue when any check failed.
    pub fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(BackupError::Corrupt {
                snapshot: self.snapshot_id.to_string(),
                message: self.issues_found.join("; "),
            })
        }
    }
}

impl SnapshotVerifier {
    pub fn new(datastore: Arc<dyn DatastoreClient>, assets: Arc<dyn AssetArchiver>) -> Self {
        Self { datastore, assets }
    }

    /// Check every artifact of `snapshot`. Problems are collected in the
    /// report rather than returned as errors.
    pub async fn verify(&self, snapshot: &Snapshot) -> VerificationReport {
        info!("Verifying snapshot {}", snapshot.id);
        let mut report = VerificationReport::new(snapshot.id);

        let primary = match snapshot.kind {
            DatastoreKind::Relational => {
                snapshot.artifact(ArtifactKind::NativeDump).is_some()
                    || snapshot.artifact(ArtifactKind::PortableDump).is_some()
            }
            DatastoreKind::Embedded => snapshot.artifact(ArtifactKind::EmbeddedCopy).is_some(),
        };
        if !primary {
            report
                .issues_found
                .push(format!("no {} dump artifact present", snapshot.kind));
        }

        for artifact in &snapshot.artifacts {
            let size = match fs::metadata(&artifact.path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    report.record(artifact.kind, Err(format!("unreadable: {e}")));
                    continue;
                }
            };
            if size == 0 {
                report.record(artifact.kind, Err("file is empty".to_string()));
                continue;
            }

            let outcome = match artifact.kind {
                ArtifactKind::NativeDump => match self.datastore.list_native(&artifact.path).await {
                    Ok(entries) if entries.is_empty() => {
                        Err("archive lists no entries".to_string())
                    }
                    Ok(entries) => {
                        let detail = format!("{} archive entries", entries.len());
                        report.contents = entries;
                        Ok(detail)
                    }
                    Err(e) => Err(e.to_string()),
                },
                ArtifactKind::PortableDump => {
                    match compression::verify_stream(&artifact.path, None).await {
                        Ok(0) => Err("decompresses to nothing".to_string()),
                        Ok(n) => Ok(format!("{n} bytes of SQL")),
                        Err(e) => Err(format!("zstd stream is damaged: {e}")),
                    }
                }
                ArtifactKind::EmbeddedCopy => {
                    match compression::verify_stream(&artifact.path, Some(SQLITE_HEADER)).await {
                        Ok(n) => Ok(format!("{n} bytes of SQLite data")),
                        Err(e) => Err(format!("not a readable SQLite copy: {e}")),
                    }
                }
                ArtifactKind::Uploads => match self.assets.verify(&artifact.path).await {
                    Ok(entries) => Ok(format!("{} archived files", entries.len())),
                    Err(e) => Err(e.to_string()),
                },
            };
            debug!("{} check for {}: {:?}", artifact.kind.suffix(), snapshot.id, outcome);
            report.record(artifact.kind, outcome);
        }

        if report.is_valid() {
            info!(
                "Snapshot {} verified ({} artifacts)",
                snapshot.id,
                report.checks.len()
            );
        } else {
            warn!(
                "Snapshot {} failed verification: {}",
                snapshot.id,
                report.issues_found.join("; ")
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{compression, SnapshotArtifact};
    use crate::runtime::{self, TarArchiver};
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct ListingDatastore {
        entries: Vec<String>,
    }

    #[async_trait]
    impl DatastoreClient for ListingDatastore {
        fn kind(&self) -> DatastoreKind {
            DatastoreKind::Relational
        }
        async fn ping(&self) -> runtime::Result<()> {
            Ok(())
        }
        async fn dump_native(&self, _dest: &Path) -> runtime::Result<()> {
            Ok(())
        }
        async fn dump_portable(&self, _dest: &Path) -> runtime::Result<()> {
            Ok(())
        }
        async fn list_native(&self, _dump: &Path) -> runtime::Result<Vec<String>> {
            Ok(self.entries.clone())
        }
        async fn restore_native(&self, _dump: &Path) -> runtime::Result<()> {
            Ok(())
        }
        async fn restore_portable(&self, _source: &Path) -> runtime::Result<()> {
            Ok(())
        }
        async fn check_consistency(&self, _toc: &[String]) -> runtime::Result<()> {
            Ok(())
        }
    }

    fn verifier(entries: &[&str]) -> SnapshotVerifier {
        SnapshotVerifier::new(
            Arc::new(ListingDatastore {
                entries: entries.iter().map(|s| s.to_string()).collect(),
            }),
            Arc::new(TarArchiver),
        )
    }

    async fn add(snapshot: &mut Snapshot, kind: ArtifactKind, path: &Path) {
        let size_bytes = fs::metadata(path).await.unwrap().len();
        snapshot.artifacts.push(SnapshotArtifact {
            kind,
            path: path.to_path_buf(),
            size_bytes,
        });
    }

    fn snapshot(dir: &TempDir, kind: DatastoreKind) -> Snapshot {
        let id = SnapshotId::parse("20240501_020000_000").unwrap();
        Snapshot::new(id, kind, dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn test_relational_snapshot_passes() {
        let dir = TempDir::new().unwrap();
        let mut snap = snapshot(&dir, DatastoreKind::Relational);

        let native = snap.path_for(ArtifactKind::NativeDump);
        fs::write(&native, b"PGDMP fake").await.unwrap();
        add(&mut snap, ArtifactKind::NativeDump, &native).await;

        let plain = dir.path().join("plain.sql");
        fs::write(&plain, b"CREATE TABLE users (id int);").await.unwrap();
        let portable = snap.path_for(ArtifactKind::PortableDump);
        compression::compress_file(&plain, &portable).await.unwrap();
        add(&mut snap, ArtifactKind::PortableDump, &portable).await;

        let report = verifier(&["TABLE public users", "TABLE public orders"])
            .verify(&snap)
            .await;
        assert!(report.is_valid(), "{:?}", report.issues_found);
        assert_eq!(report.contents.len(), 2);
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_and_damaged_artifacts_are_reported() {
        let dir = TempDir::new().unwrap();
        let mut snap = snapshot(&dir, DatastoreKind::Relational);

        let native = snap.path_for(ArtifactKind::NativeDump);
        fs::write(&native, b"").await.unwrap();
        add(&mut snap, ArtifactKind::NativeDump, &native).await;

        let portable = snap.path_for(ArtifactKind::PortableDump);
        fs::write(&portable, b"plain text pretending to be zstd").await.unwrap();
        add(&mut snap, ArtifactKind::PortableDump, &portable).await;

        let report = verifier(&["TABLE public users"]).verify(&snap).await;
        assert_eq!(report.issues_found.len(), 2);
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, BackupError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_native_dump_without_entries_fails() {
        let dir = TempDir::new().unwrap();
        let mut snap = snapshot(&dir, DatastoreKind::Relational);
        let native = snap.path_for(ArtifactKind::NativeDump);
        fs::write(&native, b"PGDMP").await.unwrap();
        add(&mut snap, ArtifactKind::NativeDump, &native).await;

        assert!(!verifier(&[]).verify(&snap).await.is_valid());
    }

    #[tokio::test]
    async fn test_embedded_copy_needs_sqlite_header() {
        let dir = TempDir::new().unwrap();
        let mut snap = snapshot(&dir, DatastoreKind::Embedded);

        let raw = dir.path().join("raw.db");
        fs::write(&raw, b"definitely not sqlite").await.unwrap();
        let copy = snap.path_for(ArtifactKind::EmbeddedCopy);
        compression::compress_file(&raw, &copy).await.unwrap();
        add(&mut snap, ArtifactKind::EmbeddedCopy, &copy).await;

        let report = verifier(&[]).verify(&snap).await;
        assert!(!report.is_valid());
    }

    #[tokio::test]
    async fn test_snapshot_without_primary_artifact_fails() {
        let dir = TempDir::new().unwrap();
        let snap = snapshot(&dir, DatastoreKind::Embedded);
        let report = verifier(&[]).verify(&snap).await;
        assert!(!report.is_valid());
    }
}
