use super::{
    compression, group_remote_keys, select_expired, ArtifactKind, BackupError, BackupSettings,
    DatastoreKind, Result, RetentionReport, Snapshot, SnapshotArtifact, SnapshotCatalog,
    SnapshotId, SnapshotVerifier,
};
use crate::clock::Clock;
use crate::notify::{NotificationEvent, Operation, WebhookNotifier};
use crate::runtime::{archive::join_key, ArchiveStore, AssetArchiver, DatastoreClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Produces verified snapshots of the datastore and the uploads directory,
/// mirrors them to the remote archive and prunes expired ones.
#[derive(Debug)]
pub struct BackupManager {
    settings: BackupSettings,
    datastore: Arc<dyn DatastoreClient>,
    assets: Arc<dyn AssetArchiver>,
    archive: Option<Arc<dyn ArchiveStore>>,
    catalog: SnapshotCatalog,
    verifier: SnapshotVerifier,
    notifier: WebhookNotifier,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(
        settings: BackupSettings,
        datastore: Arc<dyn DatastoreClient>,
        assets: Arc<dyn AssetArchiver>,
        archive: Option<Arc<dyn ArchiveStore>>,
        notifier: WebhookNotifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = SnapshotCatalog::new(settings.backup_root.clone());
        let verifier = SnapshotVerifier::new(datastore.clone(), assets.clone());
        Self {
            settings,
            datastore,
            assets,
            archive,
            catalog,
            verifier,
            notifier,
            clock,
        }
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.catalog.list().await
    }

    pub async fn latest_snapshot(&self) -> Result<Option<Snapshot>> {
        self.catalog.latest().await
    }

    /// Take a snapshot, verify it, mirror it and apply retention. Exactly one
    /// notification is sent per call.
    pub async fn create_snapshot(&self) -> Result<Snapshot> {
        let result = self.run_snapshot().await;

        let event = match &result {
            Ok(snapshot) => NotificationEvent::success(
                Operation::Backup,
                format!("{} snapshot verified", snapshot.kind),
            )
            .with_snapshot(snapshot.id, Some(snapshot.size_bytes())),
            Err(e) => NotificationEvent::failure(Operation::Backup, e.to_string()),
        };
        self.notifier.send(&event).await;

        result
    }

    async fn run_snapshot(&self) -> Result<Snapshot> {
        let root = self.settings.backup_root.clone();
        self.prepare_root(&root).await?;

        self.datastore
            .ping()
            .await
            .map_err(|e| BackupError::ConnectionRefused {
                message: e.to_string(),
            })?;

        let latest = self.catalog.latest().await?.map(|s| s.id);
        let id = SnapshotId::next(self.clock.now(), latest.as_ref());
        let mut snapshot = Snapshot::new(id, self.datastore.kind(), root);
        info!("Starting {} snapshot {}", snapshot.kind, snapshot.id);

        let verified = match self.write_artifacts(&mut snapshot).await {
            Ok(()) => self.verifier.verify(&snapshot).await.into_result(),
            Err(e) => Err(e),
        };
        if let Err(e) = verified {
            error!("Snapshot {} failed: {}", snapshot.id, e);
            self.discard(&snapshot).await;
            return Err(e);
        }
        snapshot.verified = true;

        info!(
            "Snapshot {} completed ({} artifacts, {} bytes)",
            snapshot.id,
            snapshot.artifacts.len(),
            snapshot.size_bytes()
        );

        if self.settings.retention.remote_mirror {
            self.mirror(&mut snapshot).await;
        }

        if let Err(e) = self.apply_retention().await {
            warn!("Retention cleanup failed after snapshot {}: {}", snapshot.id, e);
        }

        Ok(snapshot)
    }

    async fn prepare_root(&self, root: &Path) -> Result<()> {
        let insufficient = |e: std::io::Error| BackupError::InsufficientSpace {
            path: root.to_path_buf(),
            message: e.to_string(),
        };

        fs::create_dir_all(root).await.map_err(insufficient)?;

        let probe = root.join(".write-probe");
        fs::write(&probe, b"ok").await.map_err(insufficient)?;
        fs::remove_file(&probe).await.map_err(insufficient)?;
        Ok(())
    }

    fn partial_path(snapshot: &Snapshot, ext: &str) -> PathBuf {
        snapshot
            .directory
            .join(format!("{}.{}.partial", snapshot.id, ext))
    }

    async fn write_artifacts(&self, snapshot: &mut Snapshot) -> Result<()> {
        match snapshot.kind {
            DatastoreKind::Relational => {
                let native = snapshot.path_for(ArtifactKind::NativeDump);
                self.datastore.dump_native(&native).await?;
                snapshot
                    .artifacts
                    .push(artifact(ArtifactKind::NativeDump, native).await?);

                self.write_compressed(snapshot, "sql", ArtifactKind::PortableDump)
                    .await?;
            }
            DatastoreKind::Embedded => {
                self.write_compressed(snapshot, "sqlite", ArtifactKind::EmbeddedCopy)
                    .await?;
            }
        }

        if let Some(uploads) = &self.settings.uploads_dir {
            if uploads.is_dir() {
                let dest = snapshot.path_for(ArtifactKind::Uploads);
                self.assets.create(uploads, &dest).await?;
                snapshot
                    .artifacts
                    .push(artifact(ArtifactKind::Uploads, dest).await?);
            } else {
                warn!(
                    "Uploads directory {} does not exist, skipping",
                    uploads.display()
                );
            }
        }

        Ok(())
    }

    /// Portable dump to a partial file, then zstd into the final artifact.
    async fn write_compressed(
        &self,
        snapshot: &mut Snapshot,
        ext: &str,
        kind: ArtifactKind,
    ) -> Result<()> {
        let partial = Self::partial_path(snapshot, ext);
        self.datastore.dump_portable(&partial).await?;

        let dest = snapshot.path_for(kind);
        let compressed = compression::compress_file(&partial, &dest).await;
        remove_if_exists(&partial).await;
        compressed?;

        snapshot.artifacts.push(artifact(kind, dest).await?);
        Ok(())
    }

    /// Delete everything an unfinished snapshot may have written.
    async fn discard(&self, snapshot: &Snapshot) {
        warn!("Discarding files of failed snapshot {}", snapshot.id);
        for kind in ArtifactKind::ALL {
            remove_if_exists(&snapshot.path_for(kind)).await;
        }
        for ext in ["sql", "sqlite"] {
            remove_if_exists(&Self::partial_path(snapshot, ext)).await;
        }
    }

    /// Upload every artifact. Failures degrade the snapshot to local-only.
    async fn mirror(&self, snapshot: &mut Snapshot) {
        let Some(archive) = &self.archive else {
            warn!("Remote mirroring is enabled but no archive is configured");
            return;
        };

        let mut keys = Vec::new();
        for artifact in &snapshot.artifacts {
            let Some(name) = artifact.path.file_name() else {
                continue;
            };
            let key = join_key(&self.settings.remote_prefix, &name.to_string_lossy());
            match archive.put(&key, &artifact.path).await {
                Ok(()) => {
                    debug!("Mirrored {}", key);
                    keys.push(key);
                }
                Err(e) => warn!(
                    "Remote mirror degraded for snapshot {}: {} ({})",
                    snapshot.id, key, e
                ),
            }
        }

        if keys.len() == snapshot.artifacts.len() {
            info!("Snapshot {} mirrored to remote archive", snapshot.id);
        }
        snapshot.remote_keys = keys;
    }

    /// Delete expired snapshots, locally first and then in the remote archive.
    pub async fn apply_retention(&self) -> Result<RetentionReport> {
        let now = self.clock.now();
        let days = self.settings.retention.retention_days;
        let mut report = RetentionReport::default();

        let local = self.catalog.list().await?;
        let ids: Vec<SnapshotId> = local.iter().map(|s| s.id).collect();
        let expired = select_expired(&ids, now, days);
        for snapshot in local.iter().filter(|s| expired.contains(&s.id)) {
            match self.catalog.delete(snapshot).await {
                Ok(()) => report.local_deleted.push(snapshot.id),
                Err(e) => report
                    .failures
                    .push(format!("local {}: {}", snapshot.id, e)),
            }
        }

        if self.settings.retention.remote_mirror {
            if let Some(archive) = &self.archive {
                self.apply_remote_retention(archive.as_ref(), now, days, &mut report)
                    .await;
            }
        }

        info!(
            "Retention ({} days): {} local and {} remote objects deleted, {} failures",
            days,
            report.local_deleted.len(),
            report.remote_deleted.len(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn apply_remote_retention(
        &self,
        archive: &dyn ArchiveStore,
        now: chrono::DateTime<chrono::Utc>,
        days: u32,
        report: &mut RetentionReport,
    ) {
        let keys = match archive.list(&self.settings.remote_prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                report.failures.push(format!("remote listing: {e}"));
                return;
            }
        };

        let grouped = group_remote_keys(&keys);
        let ids: Vec<SnapshotId> = grouped.keys().copied().collect();
        for id in select_expired(&ids, now, days) {
            for key in grouped.get(&id).into_iter().flatten() {
                warn!("Deleting remote object {}", key);
                match archive.delete(key).await {
                    Ok(()) => {
                        info!("Deleted remote object {}", key);
                        report.remote_deleted.push(key.clone());
                    }
                    Err(e) => report.failures.push(format!("remote {key}: {e}")),
                }
            }
        }
    }
}

async fn artifact(kind: ArtifactKind, path: PathBuf) -> Result<SnapshotArtifact> {
    let size_bytes = fs::metadata(&path).await?.len();
    Ok(SnapshotArtifact {
        kind,
        path,
        size_bytes,
    })
}

async fn remove_if_exists(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}
