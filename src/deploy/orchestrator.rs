use super::{DeployError, DeploymentAttempt, DeploymentState, Result};
use crate::backup::{BackupManager, SnapshotId};
use crate::clock::Clock;
use crate::monitoring::{HealthProbe, HealthReport, HealthTarget, RetryPolicy};
use crate::notify::{NotificationEvent, Operation, WebhookNotifier};
use crate::restore::{RestoreManager, RestoreRequest, SnapshotRef};
use crate::runtime::{self, ContainerRuntime, ContainerStatus, SourceRepository};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DeploySettings {
    /// Wait after starting services before probing
    pub settle_delay: Duration,
    pub git_pull: bool,
    pub migration_service: Option<String>,
    pub migration_command: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    /// Skip the pre-deployment backup. Unsafe: a failed rollout cannot be
    /// rolled back and nobody is asked to confirm.
    pub quick: bool,
}

/// Everything a deployment talks to.
#[derive(Debug, Clone)]
pub struct DeployDependencies {
    pub backup: Arc<BackupManager>,
    pub restore: Arc<RestoreManager>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub source: Option<Arc<dyn SourceRepository>>,
    pub probe: HealthProbe,
    pub targets: Vec<HealthTarget>,
    pub retry: RetryPolicy,
    pub notifier: WebhookNotifier,
    pub clock: Arc<dyn Clock>,
}

/// backup -> restart -> migrate -> verify -> commit or roll back.
#[derive(Debug)]
pub struct DeploymentOrchestrator {
    deps: DeployDependencies,
    settings: DeploySettings,
}

enum Phase<T> {
    Done(T),
    Interrupted,
}

async fn interruptible<T>(
    shutdown: &mut (impl Future<Output = ()> + Unpin),
    work: impl Future<Output = T>,
) -> Phase<T> {
    tokio::select! {
        biased;
        _ = shutdown => Phase::Interrupted,
        value = work => Phase::Done(value),
    }
}

impl DeploymentOrchestrator {
    pub fn new(deps: DeployDependencies, settings: DeploySettings) -> Self {
        Self { deps, settings }
    }

    /// Run one deployment cycle. `shutdown` resolving (operator signal)
    /// stops the cycle without committing. Re-invoking simply runs another
    /// cycle.
    pub async fn deploy(
        &self,
        options: DeployOptions,
        shutdown: impl Future<Output = ()>,
    ) -> DeploymentAttempt {
        let mut shutdown = std::pin::pin!(shutdown);
        let mut attempt = DeploymentAttempt::new(self.deps.clock.now());

        self.run_cycle(options, &mut shutdown, &mut attempt).await;

        let event = if attempt.succeeded() {
            NotificationEvent::success(Operation::Deploy, "deployment committed")
        } else {
            NotificationEvent::failure(
                Operation::Deploy,
                format!(
                    "{}: {}",
                    attempt.state,
                    attempt.failure.as_deref().unwrap_or("no details")
                ),
            )
        };
        let event = match attempt.snapshot_id {
            Some(id) => event.with_snapshot(id, None),
            None => event,
        };
        self.deps.notifier.send(&event).await;

        attempt
    }

    async fn run_cycle(
        &self,
        options: DeployOptions,
        shutdown: &mut (impl Future<Output = ()> + Unpin),
        attempt: &mut DeploymentAttempt,
    ) {
        // Backing up
        if options.quick {
            warn!("Quick deploy: no pre-deployment backup, a failure cannot be rolled back");
        } else {
            attempt.transition(DeploymentState::BackingUp);
            match interruptible(&mut *shutdown, self.deps.backup.create_snapshot()).await {
                Phase::Interrupted => {
                    return self.end(attempt, DeploymentState::FailedNoBackup, "interrupted during backup");
                }
                Phase::Done(Err(e)) => {
                    return self.end(
                        attempt,
                        DeploymentState::FailedNoBackup,
                        format!("pre-deployment backup failed: {e}"),
                    );
                }
                Phase::Done(Ok(snapshot)) => {
                    info!("Pre-deployment snapshot {}", snapshot.id);
                    attempt.snapshot_id = Some(snapshot.id);
                }
            }
        }

        // Deploying
        attempt.transition(DeploymentState::Deploying);
        match interruptible(&mut *shutdown, self.roll_out()).await {
            Phase::Interrupted => {
                return self.end(attempt, DeploymentState::Interrupted, "interrupted during rollout");
            }
            Phase::Done(Err(e)) => {
                return self
                    .recover(attempt, format!("rollout failed: {e}"))
                    .await;
            }
            Phase::Done(Ok(revision)) => attempt.revision = revision,
        }

        // Health checking
        attempt.transition(DeploymentState::HealthChecking);
        info!(
            "Waiting {:?} for services to settle",
            self.settings.settle_delay
        );
        let checked = interruptible(&mut *shutdown, async {
            self.deps.clock.sleep(self.settings.settle_delay).await;
            self.deps
                .probe
                .check_with_retry(&self.deps.targets, &self.deps.retry)
                .await
        })
        .await;
        let report = match checked {
            Phase::Interrupted => {
                return self.end(attempt, DeploymentState::Interrupted, "interrupted during health check");
            }
            Phase::Done(report) => report,
        };

        info!("Final health check:\n{}", report);
        let healthy = report.is_healthy();
        let failing = report.failing_targets().join(", ");
        attempt.final_report = Some(report);

        if healthy {
            self.commit(attempt).await;
        } else {
            self.recover(attempt, format!("health check failed: {failing}"))
                .await;
        }
    }

    fn end(&self, attempt: &mut DeploymentAttempt, state: DeploymentState, reason: impl Into<String>) {
        attempt.fail(state, reason, self.deps.clock.now());
    }

    /// Stop, update, build, start and migrate. Returns the deployed revision.
    async fn roll_out(&self) -> runtime::Result<Option<String>> {
        info!("Stopping services");
        self.deps.runtime.stop().await?;

        let revision = match &self.deps.source {
            Some(source) if self.settings.git_pull => Some(source.update().await?),
            Some(source) => source.revision().await.ok(),
            None => None,
        };
        if let Some(revision) = &revision {
            info!("Deploying revision {}", revision);
        }

        info!("Building images");
        self.deps.runtime.build().await?;
        info!("Starting services");
        self.deps.runtime.start().await?;

        if let Some(service) = &self.settings.migration_service {
            info!(
                "Running migrations in {}: {}",
                service,
                self.settings.migration_command.join(" ")
            );
            let output = self
                .deps
                .runtime
                .exec(service, &self.settings.migration_command)
                .await?;
            if !output.trim().is_empty() {
                info!("Migration output: {}", output.trim());
            }
        }

        Ok(revision)
    }

    async fn commit(&self, attempt: &mut DeploymentAttempt) {
        match self.deps.backup.apply_retention().await {
            Ok(report) => info!(
                "Post-deploy retention removed {} local snapshots",
                report.local_deleted.len()
            ),
            Err(e) => warn!("Post-deploy retention failed: {}", e),
        }
        if let Err(e) = self.deps.runtime.prune_images().await {
            warn!("Image prune failed: {}", e);
        }
        attempt.finish(DeploymentState::Committed, self.deps.clock.now());
    }

    /// Roll back to the snapshot taken by this attempt, or give up when there
    /// is none.
    async fn recover(&self, attempt: &mut DeploymentAttempt, reason: String) {
        attempt.failure = Some(reason);
        let Some(id) = attempt.snapshot_id else {
            return self.end(
                attempt,
                DeploymentState::FailedNoBackup,
                "no pre-deployment snapshot to roll back to",
            );
        };

        attempt.transition(DeploymentState::RollingBack);
        let (state, report) = self.rollback_to(id).await;
        if report.is_some() {
            attempt.final_report = report;
        }
        attempt.finish(state, self.deps.clock.now());
    }

    /// Stop services, restore `id` with force, start services on the
    /// restored state and probe once. Returns the terminal state and the
    /// post-rollback probe.
    async fn rollback_to(&self, id: SnapshotId) -> (DeploymentState, Option<HealthReport>) {
        warn!("Rolling back to snapshot {}", id);
        // Nothing may hold the datastore open while it is overwritten
        if let Err(e) = self.deps.runtime.stop().await {
            warn!("Stopping services before rollback failed: {}", e);
            return (DeploymentState::RollbackFailed, None);
        }

        let request = RestoreRequest::apply(SnapshotRef::Id(id), true);
        if let Err(e) = self.deps.restore.restore(request).await {
            warn!("Rollback restore of {} failed: {}", id, e);
            return (DeploymentState::RollbackFailed, None);
        }

        if let Err(e) = self.deps.runtime.start().await {
            warn!("Starting services after rollback failed: {}", e);
        }

        let report = self.deps.probe.check(&self.deps.targets).await;
        info!("Health after rollback:\n{}", report);
        (DeploymentState::RolledBack, Some(report))
    }

    /// Operator-requested rollback to the newest local snapshot.
    pub async fn rollback_latest(&self) -> Result<DeploymentAttempt> {
        let latest = self
            .deps
            .backup
            .latest_snapshot()
            .await?
            .ok_or(DeployError::NoSnapshot)?;

        let mut attempt = DeploymentAttempt::new(self.deps.clock.now());
        attempt.snapshot_id = Some(latest.id);
        attempt.transition(DeploymentState::RollingBack);
        let (state, report) = self.rollback_to(latest.id).await;
        attempt.final_report = report;
        if state == DeploymentState::RollbackFailed {
            attempt.failure = Some(format!("rollback to {} failed", latest.id));
        }
        attempt.finish(state, self.deps.clock.now());
        Ok(attempt)
    }

    pub async fn status(&self) -> Result<(Vec<ContainerStatus>, HealthReport)> {
        let containers = self.deps.runtime.list().await?;
        let report = self.deps.probe.check(&self.deps.targets).await;
        Ok((containers, report))
    }

    pub async fn stop(&self) -> Result<()> {
        warn!("Stopping all services");
        self.deps.runtime.stop().await?;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        info!("Restarting all services");
        self.deps.runtime.restart().await?;
        Ok(())
    }

    pub async fn logs(&self, lines: usize) -> Result<String> {
        Ok(self.deps.runtime.logs(lines).await?)
    }
}
