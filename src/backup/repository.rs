use super::{parse_artifact_name, Result, Snapshot, SnapshotArtifact, SnapshotId};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Snapshots stored as files directly under one directory.
#[derive(Debug, Clone)]
pub struct SnapshotCatalog {
    root: PathBuf,
}

impl SnapshotCatalog {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All snapshots, oldest first. Files that do not follow the snapshot
    /// naming scheme are ignored.
    pub async fn list(&self) -> Result<Vec<Snapshot>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut grouped: BTreeMap<SnapshotId, Vec<SnapshotArtifact>> = BTreeMap::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((id, kind)) = parse_artifact_name(&name) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            grouped.entry(id).or_default().push(SnapshotArtifact {
                kind,
                path: entry.path(),
                size_bytes: metadata.len(),
            });
        }

        Ok(grouped
            .into_iter()
            .map(|(id, mut artifacts)| {
                artifacts.sort_by_key(|a| a.kind);
                let kind = Snapshot::infer_kind(&artifacts);
                let mut snapshot = Snapshot::new(id, kind, self.root.clone());
                snapshot.artifacts = artifacts;
                snapshot
            })
            .collect())
    }

    pub async fn latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.list().await?.pop())
    }

    pub async fn find(&self, id: &SnapshotId) -> Result<Option<Snapshot>> {
        Ok(self.list().await?.into_iter().find(|s| s.id == *id))
    }

    /// Remove every file of a snapshot, logging each one.
    pub async fn delete(&self, snapshot: &Snapshot) -> Result<()> {
        for artifact in &snapshot.artifacts {
            warn!(
                "Deleting snapshot file {} ({} bytes)",
                artifact.path.display(),
                artifact.size_bytes
            );
            match fs::remove_file(&artifact.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} already removed", artifact.path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!("Deleted snapshot {}", snapshot.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{ArtifactKind, DatastoreKind};
    use tempfile::TempDir;

    async fn touch(dir: &Path, name: &str, bytes: &[u8]) {
        fs::write(dir.join(name), bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_groups_artifacts_by_id() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "20240501_020000_000.dump", b"native").await;
        touch(dir.path(), "20240501_020000_000.sql.zst", b"plain").await;
        touch(dir.path(), "20240502_020000_000.sqlite.zst", b"copy").await;
        touch(dir.path(), ".printhub-ops.lock", b"123").await;
        touch(dir.path(), "notes.txt", b"ignored").await;

        let catalog = SnapshotCatalog::new(dir.path().to_path_buf());
        let snapshots = catalog.list().await.unwrap();

        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].kind, DatastoreKind::Relational);
        assert_eq!(snapshots[0].artifacts.len(), 2);
        assert_eq!(snapshots[0].size_bytes(), 11);
        assert!(snapshots[0].artifact(ArtifactKind::NativeDump).is_some());
        assert_eq!(snapshots[1].kind, DatastoreKind::Embedded);

        let latest = catalog.latest().await.unwrap().unwrap();
        assert_eq!(latest.id.to_string(), "20240502_020000_000");
    }

    #[tokio::test]
    async fn test_deleted_snapshot_does_not_reappear() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "20240501_020000_000.dump", b"a").await;
        touch(dir.path(), "20240501_020000_000.sql.zst", b"b").await;
        touch(dir.path(), "20240503_020000_000.dump", b"c").await;

        let catalog = SnapshotCatalog::new(dir.path().to_path_buf());
        let doomed = catalog.list().await.unwrap().remove(0);
        catalog.delete(&doomed).await.unwrap();

        let remaining = catalog.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.iter().all(|s| s.id != doomed.id));
        assert!(catalog.find(&doomed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_root_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let catalog = SnapshotCatalog::new(dir.path().join("not-yet-created"));
        assert!(catalog.list().await.unwrap().is_empty());
    }
}
