use super::{
    Confirmer, RestoreError, RestoreMethod, RestoreMode, RestoreRequest, RestoreResult, Result,
    SnapshotRef,
};
use crate::backup::compression;
use crate::backup::{
    parse_artifact_name, ArtifactKind, BackupSettings, DatastoreKind, Snapshot, SnapshotCatalog,
    SnapshotId, SnapshotVerifier, VerificationReport,
};
use crate::clock::Clock;
use crate::notify::{NotificationEvent, Operation, WebhookNotifier};
use crate::runtime::{archive::join_key, ArchiveStore, AssetArchiver, DatastoreClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Rebuilds the datastore and uploads directory from a snapshot.
///
/// Mid-restore cancellation is not atomic: a restore interrupted after the
/// destination was cleared leaves it partially restored.
#[derive(Debug)]
pub struct RestoreManager {
    datastore: Arc<dyn DatastoreClient>,
    assets: Arc<dyn AssetArchiver>,
    archive: Option<Arc<dyn ArchiveStore>>,
    catalog: SnapshotCatalog,
    verifier: SnapshotVerifier,
    confirmer: Arc<dyn Confirmer>,
    notifier: WebhookNotifier,
    clock: Arc<dyn Clock>,
    uploads_dir: Option<PathBuf>,
    remote_prefix: String,
}

impl RestoreManager {
    pub fn new(
        settings: &BackupSettings,
        datastore: Arc<dyn DatastoreClient>,
        assets: Arc<dyn AssetArchiver>,
        archive: Option<Arc<dyn ArchiveStore>>,
        confirmer: Arc<dyn Confirmer>,
        notifier: WebhookNotifier,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog: SnapshotCatalog::new(settings.backup_root.clone()),
            verifier: SnapshotVerifier::new(datastore.clone(), assets.clone()),
            datastore,
            assets,
            archive,
            confirmer,
            notifier,
            clock,
            uploads_dir: settings.uploads_dir.clone(),
            remote_prefix: settings.remote_prefix.clone(),
        }
    }

    /// Restore or validate a snapshot. Apply mode sends exactly one
    /// notification, whatever the outcome.
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreResult> {
        let result = self.run(&request).await;

        if let Err(e) = &result {
            error!("Restore of {} failed: {}", request.reference, e);
        }

        if request.mode == RestoreMode::Apply {
            let event = match &result {
                Ok(restored) => NotificationEvent::success(
                    Operation::Restore,
                    format!("restored from {}", request.reference),
                )
                .with_snapshot(restored.snapshot_id, Some(restored.size_bytes)),
                Err(e) => NotificationEvent::failure(Operation::Restore, e.to_string()),
            };
            self.notifier.send(&event).await;
        }

        result
    }

    async fn run(&self, request: &RestoreRequest) -> Result<RestoreResult> {
        let snapshot = self.resolve(&request.reference).await?;
        info!(
            "Validating snapshot {} ({} artifacts, {} bytes)",
            snapshot.id,
            snapshot.artifacts.len(),
            snapshot.size_bytes()
        );

        let report = self.verifier.verify(&snapshot).await.into_result()?;
        let mut result = RestoreResult {
            snapshot_id: snapshot.id,
            mode: request.mode,
            method: None,
            contents: listing(&report),
            safety_copy: None,
            uploads_restored: false,
            size_bytes: snapshot.size_bytes(),
        };

        if request.mode == RestoreMode::DryRun {
            info!(
                "Dry run: snapshot {} is restorable ({} entries)",
                snapshot.id,
                result.contents.len()
            );
            return Ok(result);
        }

        let destination = self.datastore.kind();
        if snapshot.kind != destination {
            return Err(RestoreError::KindMismatch {
                snapshot: snapshot.kind,
                destination,
            });
        }
        let method = select_method(&snapshot, request.prefer_portable)?;

        self.datastore
            .ping()
            .await
            .map_err(|e| RestoreError::DestinationUnreachable {
                message: e.to_string(),
            })?;

        if !request.force {
            let prompt = format!(
                "This will overwrite the {} datastore{} with snapshot {}. Continue?",
                destination,
                self.uploads_note(&snapshot),
                snapshot.id
            );
            if !self.confirmer.confirm(&prompt).await {
                warn!("Restore of {} declined by operator", snapshot.id);
                return Err(RestoreError::Cancelled);
            }
        }

        result.safety_copy = self.apply_datastore(&snapshot, method).await?;
        result.method = Some(method);

        if let Err(e) = self.datastore.check_consistency(&report.contents).await {
            return Err(RestoreError::VerificationFailed {
                message: e.to_string(),
            });
        }

        result.uploads_restored = self.apply_uploads(&snapshot).await?;

        info!(
            "Restored snapshot {} via {:?}{}",
            snapshot.id,
            method,
            if result.uploads_restored {
                " including uploads"
            } else {
                ""
            }
        );
        Ok(result)
    }

    fn uploads_note(&self, snapshot: &Snapshot) -> String {
        match (&self.uploads_dir, snapshot.artifact(ArtifactKind::Uploads)) {
            (Some(dir), Some(_)) => format!(" and {}", dir.display()),
            _ => String::new(),
        }
    }

    /// Locate the snapshot, fetching it from the remote archive first when
    /// asked to.
    async fn resolve(&self, reference: &SnapshotRef) -> Result<Snapshot> {
        let not_found = || RestoreError::SnapshotNotFound {
            reference: reference.to_string(),
        };

        match reference {
            SnapshotRef::Id(id) => self.catalog.find(id).await?.ok_or_else(not_found),
            SnapshotRef::Path(path) => {
                if !path.is_file() {
                    return Err(not_found());
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let (id, _) = parse_artifact_name(&name).ok_or_else(not_found)?;
                let directory = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                SnapshotCatalog::new(directory.to_path_buf())
                    .find(&id)
                    .await?
                    .ok_or_else(not_found)
            }
            SnapshotRef::Remote(key) => {
                let id = self.fetch_remote(key).await?;
                self.catalog.find(&id).await?.ok_or_else(not_found)
            }
        }
    }

    /// Download every artifact of the snapshot named by `key` into the
    /// backup root and return its identifier.
    async fn fetch_remote(&self, key: &str) -> Result<SnapshotId> {
        let fetch_failed = |message: String| RestoreError::RemoteFetchFailed {
            key: key.to_string(),
            message,
        };
        let archive = self
            .archive
            .as_ref()
            .ok_or_else(|| fetch_failed("no remote archive is configured".to_string()))?;

        let (prefix, id) = match SnapshotId::parse(key) {
            Some(id) => (self.remote_prefix.clone(), id),
            None => {
                let (prefix, name) = key.rsplit_once('/').unwrap_or(("", key));
                let (id, _) = parse_artifact_name(name).ok_or_else(|| {
                    fetch_failed("key does not name a snapshot artifact".to_string())
                })?;
                (prefix.to_string(), id)
            }
        };

        let keys: Vec<String> = archive
            .list(&prefix)
            .await
            .map_err(|e| fetch_failed(e.to_string()))?
            .into_iter()
            .filter(|k| {
                let name = k.rsplit('/').next().unwrap_or(k);
                parse_artifact_name(name).is_some_and(|(found, _)| found == id)
            })
            .collect();
        if keys.is_empty() {
            return Err(fetch_failed(format!(
                "no artifacts for {id} under {}",
                join_key(&prefix, "")
            )));
        }

        let root = self.catalog.root();
        fs::create_dir_all(root).await?;
        for key in keys {
            let name = key.rsplit('/').next().unwrap_or(&key);
            let dest = root.join(name);
            if dest.exists() {
                debug!("{} already present locally", name);
                continue;
            }
            info!("Fetching {} from remote archive", key);
            let partial = root.join(format!("{name}.partial"));
            if let Err(e) = archive.get(&key, &partial).await {
                let _ = fs::remove_file(&partial).await;
                return Err(RestoreError::RemoteFetchFailed {
                    key: key.clone(),
                    message: e.to_string(),
                });
            }
            fs::rename(&partial, &dest).await?;
        }
        Ok(id)
    }

    async fn apply_datastore(
        &self,
        snapshot: &Snapshot,
        method: RestoreMethod,
    ) -> Result<Option<PathBuf>> {
        match method {
            RestoreMethod::Native => {
                let dump = snapshot.path_for(ArtifactKind::NativeDump);
                warn!(
                    "Overwriting relational datastore from {} (pg_restore --clean)",
                    dump.display()
                );
                self.datastore
                    .restore_native(&dump)
                    .await
                    .map_err(RestoreError::apply_failed)?;
                warn!("Relational datastore overwritten from snapshot {}", snapshot.id);
                Ok(None)
            }
            RestoreMethod::Portable => {
                let plain = self
                    .decompress(snapshot, ArtifactKind::PortableDump, "sql")
                    .await?;
                warn!(
                    "Dropping and recreating relational datastore from snapshot {}",
                    snapshot.id
                );
                let applied = self.datastore.restore_portable(&plain).await;
                remove_quietly(&plain).await;
                applied.map_err(RestoreError::apply_failed)?;
                warn!("Relational datastore replaced from snapshot {}", snapshot.id);
                Ok(None)
            }
            RestoreMethod::EmbeddedFile => {
                let live = self
                    .datastore
                    .live_file()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| RestoreError::ApplyFailed {
                        message: "embedded datastore has no live file".to_string(),
                    })?;

                // The safety copy goes through the datastore so rows still in
                // the write-ahead log are included.
                let safety_copy = if live.exists() {
                    let copy = self.safety_copy_path(&live);
                    self.datastore
                        .dump_portable(&copy)
                        .await
                        .map_err(RestoreError::apply_failed)?;
                    info!("Saved current database to {}", copy.display());
                    Some(copy)
                } else {
                    None
                };

                let plain = self
                    .decompress(snapshot, ArtifactKind::EmbeddedCopy, "sqlite")
                    .await?;
                warn!(
                    "Overwriting {} with snapshot {}",
                    live.display(),
                    snapshot.id
                );
                let applied = self.datastore.restore_portable(&plain).await;
                remove_quietly(&plain).await;
                applied.map_err(RestoreError::apply_failed)?;
                warn!("Overwrote {} with snapshot {}", live.display(), snapshot.id);
                Ok(safety_copy)
            }
        }
    }

    /// `<live>.pre-restore-<timestamp>` with millisecond precision, numbered
    /// when that name is already taken.
    fn safety_copy_path(&self, live: &Path) -> PathBuf {
        let stamp = self.clock.now().format("%Y%m%d_%H%M%S_%3f");
        let mut base = live.as_os_str().to_owned();
        base.push(format!(".pre-restore-{stamp}"));

        let mut candidate = PathBuf::from(&base);
        let mut n = 1;
        while candidate.exists() {
            let mut numbered = base.clone();
            numbered.push(format!("-{n}"));
            candidate = PathBuf::from(numbered);
            n += 1;
        }
        candidate
    }

    async fn decompress(&self, snapshot: &Snapshot, kind: ArtifactKind, ext: &str) -> Result<PathBuf> {
        let source = snapshot.path_for(kind);
        let dest = snapshot
            .directory
            .join(format!("{}.{}.partial", snapshot.id, ext));
        compression::decompress_file(&source, &dest).await?;
        Ok(dest)
    }

    async fn apply_uploads(&self, snapshot: &Snapshot) -> Result<bool> {
        let (Some(dir), Some(archive)) = (
            &self.uploads_dir,
            snapshot.artifact(ArtifactKind::Uploads),
        ) else {
            return Ok(false);
        };

        warn!(
            "Extracting {} over {}",
            archive.path.display(),
            dir.display()
        );
        self.assets
            .extract(&archive.path, dir)
            .await
            .map_err(RestoreError::apply_failed)?;
        warn!("Uploads directory {} restored", dir.display());
        Ok(true)
    }
}

/// Native when a native dump exists, unless the portable dump is preferred.
fn select_method(snapshot: &Snapshot, prefer_portable: bool) -> Result<RestoreMethod> {
    let missing = |what: &str| RestoreError::SnapshotNotFound {
        reference: format!("{} has no {what}", snapshot.id),
    };
    match snapshot.kind {
        DatastoreKind::Embedded => Ok(RestoreMethod::EmbeddedFile),
        DatastoreKind::Relational => {
            let native = snapshot.artifact(ArtifactKind::NativeDump).is_some();
            let portable = snapshot.artifact(ArtifactKind::PortableDump).is_some();
            match (native, portable, prefer_portable) {
                (_, true, true) | (false, true, _) => Ok(RestoreMethod::Portable),
                (true, _, false) => Ok(RestoreMethod::Native),
                (_, false, true) => Err(missing("portable dump")),
                (false, false, false) => Err(missing("dump")),
            }
        }
    }
}

fn listing(report: &VerificationReport) -> Vec<String> {
    if !report.contents.is_empty() {
        return report.contents.clone();
    }
    report
        .checks
        .iter()
        .map(|c| format!("{}: {}", c.kind.suffix(), c.detail))
        .collect()
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!("Could not remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{RetentionPolicy, SnapshotArtifact};
    use crate::clock::ManualClock;
    use crate::restore::FixedConfirmer;
    use crate::runtime::TarArchiver;

    fn snapshot_with(kinds: &[ArtifactKind]) -> Snapshot {
        let id = SnapshotId::parse("20240501_020000_000").unwrap();
        let mut snapshot = Snapshot::new(id, DatastoreKind::Relational, PathBuf::from("/b"));
        snapshot.artifacts = kinds
            .iter()
            .map(|k| SnapshotArtifact {
                kind: *k,
                path: snapshot.path_for(*k),
                size_bytes: 1,
            })
            .collect();
        snapshot
    }

    #[test]
    fn test_method_selection() {
        use ArtifactKind::*;
        let both = snapshot_with(&[NativeDump, PortableDump]);
        assert_eq!(select_method(&both, false).unwrap(), RestoreMethod::Native);
        assert_eq!(select_method(&both, true).unwrap(), RestoreMethod::Portable);

        let portable_only = snapshot_with(&[PortableDump]);
        assert_eq!(
            select_method(&portable_only, false).unwrap(),
            RestoreMethod::Portable
        );

        let native_only = snapshot_with(&[NativeDump]);
        assert!(select_method(&native_only, true).is_err());
        assert!(select_method(&snapshot_with(&[]), false).is_err());
    }

    #[tokio::test]
    async fn test_unknown_snapshot_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = BackupSettings {
            backup_root: dir.path().to_path_buf(),
            uploads_dir: None,
            retention: RetentionPolicy::default(),
            remote_prefix: "backups".to_string(),
        };
        let manager = RestoreManager::new(
            &settings,
            Arc::new(crate::runtime::SqliteClient::new(dir.path().join("live.db"))),
            Arc::new(TarArchiver),
            None,
            Arc::new(FixedConfirmer::new(true)),
            WebhookNotifier::disabled(),
            Arc::new(ManualClock::default()),
        );

        let id = SnapshotId::parse("20240501_020000_000").unwrap();
        let err = manager
            .restore(RestoreRequest::dry_run(SnapshotRef::Id(id)))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::SnapshotNotFound { .. }));

        let err = manager
            .restore(RestoreRequest::dry_run(SnapshotRef::Remote(
                "backups/20240501_020000_000.sqlite.zst".to_string(),
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::RemoteFetchFailed { .. }));
    }
}
