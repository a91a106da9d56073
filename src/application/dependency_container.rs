use crate::{
    backup::{BackupManager, DatastoreKind},
    clock::{Clock, SystemClock},
    config::Config,
    deploy::{DeployDependencies, DeploySettings, DeploymentOrchestrator},
    lock::{self, LeaseLock},
    monitoring::{HealthProbe, RetryPolicy},
    notify::WebhookNotifier,
    restore::{Confirmer, RestoreManager, TerminalConfirmer},
    runtime::{
        ArchiveStore, AssetArchiver, ContainerRuntime, DatastoreClient, DockerComposeRuntime,
        GitSource, LocalDirArchive, PostgresClient, S3CliArchive, SourceRepository, SqliteClient,
        TarArchiver,
    },
    schedule::{CrontabStore, SystemCrontab},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// External systems the operations talk to. Production wiring comes from
/// [`Collaborators::from_config`]; tests swap in fakes.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub datastore: Arc<dyn DatastoreClient>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub assets: Arc<dyn AssetArchiver>,
    pub archive: Option<Arc<dyn ArchiveStore>>,
    pub source: Option<Arc<dyn SourceRepository>>,
    pub confirmer: Arc<dyn Confirmer>,
    pub crontab: Arc<dyn CrontabStore>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn from_config(config: &Config) -> Self {
        let datastore: Arc<dyn DatastoreClient> = match config.datastore.kind {
            DatastoreKind::Relational => Arc::new(PostgresClient::new(&config.datastore)),
            DatastoreKind::Embedded => {
                Arc::new(SqliteClient::new(config.datastore.sqlite_path.clone()))
            }
        };

        // A local directory wins over a bucket so mirroring can be exercised
        // without cloud credentials.
        let archive: Option<Arc<dyn ArchiveStore>> =
            match (&config.archive.local_dir, &config.archive.bucket) {
                (Some(dir), _) => Some(Arc::new(LocalDirArchive::new(dir.clone()))),
                (None, Some(bucket)) => {
                    Some(Arc::new(S3CliArchive::new(bucket.clone(), &config.archive)))
                }
                (None, None) => None,
            };

        Self {
            datastore,
            runtime: Arc::new(DockerComposeRuntime::new(
                config.deploy.compose_file.clone(),
                config.deploy.project_dir.clone(),
            )),
            assets: Arc::new(TarArchiver),
            archive,
            source: Some(Arc::new(GitSource::new(config.deploy.project_dir.clone()))),
            confirmer: Arc::new(TerminalConfirmer),
            crontab: Arc::new(SystemCrontab),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Dependency injection container for the operations
#[derive(Debug)]
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,

    // Infrastructure layer
    pub collaborators: Collaborators,
    pub notifier: WebhookNotifier,
    pub health_probe: HealthProbe,

    // Service layer
    pub backup_manager: Arc<BackupManager>,
    pub restore_manager: Arc<RestoreManager>,
    pub orchestrator: Arc<DeploymentOrchestrator>,
}

impl DependencyContainer {
    pub fn new(config: Config) -> Self {
        let collaborators = Collaborators::from_config(&config);
        Self::with_collaborators(config, collaborators)
    }

    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Self {
        info!("Initializing dependency container...");
        info!("Datastore: {}", config.safe_database_url());

        let settings = config.backup_settings();
        let notifier = WebhookNotifier::new(config.notification.webhook_url.clone());
        if !notifier.is_enabled() {
            info!("No NOTIFY_WEBHOOK_URL set, notifications are disabled");
        }
        let c = &collaborators;

        let backup_manager = Arc::new(BackupManager::new(
            settings.clone(),
            c.datastore.clone(),
            c.assets.clone(),
            c.archive.clone(),
            notifier.clone(),
            c.clock.clone(),
        ));

        let restore_manager = Arc::new(RestoreManager::new(
            &settings,
            c.datastore.clone(),
            c.assets.clone(),
            c.archive.clone(),
            c.confirmer.clone(),
            notifier.clone(),
            c.clock.clone(),
        ));

        let health_probe = HealthProbe::new(config.health_timeout(), config.health.concurrency)
            .with_runtime(c.runtime.clone())
            .with_datastore(c.datastore.clone());

        let orchestrator = Arc::new(DeploymentOrchestrator::new(
            DeployDependencies {
                backup: backup_manager.clone(),
                restore: restore_manager.clone(),
                runtime: c.runtime.clone(),
                source: c.source.clone(),
                probe: health_probe.clone(),
                targets: config.health_targets(),
                retry: RetryPolicy::new(config.deploy_retry_config(), c.clock.clone()),
                notifier: notifier.clone(),
                clock: c.clock.clone(),
            },
            DeploySettings {
                settle_delay: Duration::from_secs(config.deploy.settle_seconds),
                git_pull: config.deploy.git_pull,
                migration_service: config.deploy.migration_service.clone(),
                migration_command: config.deploy.migration_command.clone(),
            },
        ));

        info!("Dependency container initialized");

        Self {
            config,
            collaborators,
            notifier,
            health_probe,
            backup_manager,
            restore_manager,
            orchestrator,
        }
    }

    /// Take the single-operation lock next to the snapshots.
    pub fn acquire_lock(&self) -> lock::Result<LeaseLock> {
        LeaseLock::acquire(&self.config.backup.backup_root)
    }
}
