use crate::application::{lifecycle::shutdown_signal, DependencyContainer};
use crate::backup::Snapshot;
use crate::config::ConfigError;
use crate::deploy::{DeployError, DeployOptions, DeploymentAttempt, DeploymentState};
use crate::monitoring::HealthReport;
use crate::restore::{RestoreMode, RestoreRequest, RestoreResult, SnapshotRef};
use crate::schedule::{Frequency, ScheduleEntry, ScheduleManager};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Creates snapshots and lists what is stored locally.
pub struct BackupCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BackupCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run_backup(&self) -> Result<Snapshot> {
        let _lock = self.container.acquire_lock()?;
        info!(
            "Starting backup into {}",
            self.container.config.backup.backup_root.display()
        );

        let snapshot = self
            .container
            .backup_manager
            .create_snapshot()
            .await
            .context("backup failed")?;

        println!("Snapshot {} ({} bytes)", snapshot.id, snapshot.size_bytes());
        for artifact in &snapshot.artifacts {
            println!("  {}", artifact.path.display());
        }
        for key in &snapshot.remote_keys {
            println!("  remote: {key}");
        }
        Ok(snapshot)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let snapshots = self.container.backup_manager.list_snapshots().await?;
        if snapshots.is_empty() {
            println!(
                "No snapshots in {}",
                self.container.config.backup.backup_root.display()
            );
        }
        for snapshot in &snapshots {
            let kinds: Vec<String> = snapshot
                .artifacts
                .iter()
                .map(|a| a.kind.suffix().to_string())
                .collect();
            println!(
                "{}  {:>12} bytes  {}",
                snapshot.id,
                snapshot.size_bytes(),
                kinds.join(", ")
            );
        }
        Ok(snapshots)
    }
}

pub struct RestoreCommandHandler {
    container: Arc<DependencyContainer>,
}

impl RestoreCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run_restore(
        &self,
        reference: &str,
        dry_run: bool,
        force: bool,
        from_remote: bool,
        prefer_portable: bool,
    ) -> Result<RestoreResult> {
        let reference = SnapshotRef::parse(reference, from_remote);
        let mut request = if dry_run {
            RestoreRequest::dry_run(reference)
        } else {
            RestoreRequest::apply(reference, force)
        };
        request.prefer_portable = prefer_portable;

        // Dry runs mutate nothing and may overlap a running operation
        let _lock = match request.mode {
            RestoreMode::Apply => Some(self.container.acquire_lock()?),
            RestoreMode::DryRun => None,
        };

        let result = self
            .container
            .restore_manager
            .restore(request)
            .await
            .context("restore failed")?;

        match result.mode {
            RestoreMode::DryRun => {
                println!("Snapshot {} is valid ({} bytes)", result.snapshot_id, result.size_bytes);
                for line in &result.contents {
                    println!("  {line}");
                }
            }
            RestoreMode::Apply => {
                println!("Restored snapshot {}", result.snapshot_id);
                if let Some(copy) = &result.safety_copy {
                    println!("Previous database kept at {}", copy.display());
                }
                if result.uploads_restored {
                    println!("Uploaded files restored");
                }
            }
        }
        Ok(result)
    }
}

/// Installs the recurring backup into the host crontab.
pub struct ScheduleCommandHandler {
    manager: ScheduleManager,
}

impl ScheduleCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Result<Self> {
        let command = scheduled_command()?;
        let manager = ScheduleManager::new(container.collaborators.crontab.clone(), command);
        Ok(Self { manager })
    }

    pub async fn install(
        &self,
        frequency: &str,
        time_of_day: Option<&str>,
        user: Option<&str>,
    ) -> Result<ScheduleEntry> {
        let frequency: Frequency = frequency.parse()?;
        let entry = self.manager.install(frequency, time_of_day, user).await?;
        println!("Installed: {}", entry.to_line());
        Ok(entry)
    }

    pub async fn remove(&self, user: Option<&str>) -> Result<usize> {
        let removed = self.manager.remove(user).await?;
        println!("Removed {removed} schedule entries");
        Ok(removed)
    }

    pub async fn list(&self, user: Option<&str>) -> Result<Vec<ScheduleEntry>> {
        let entries = self.manager.list(user).await?;
        if entries.is_empty() {
            println!("No backup schedule installed");
        }
        for entry in &entries {
            println!("{}  {}", entry.cron_expression(), entry.frequency);
        }
        Ok(entries)
    }
}

/// `cd <cwd> && <this binary> backup`, so cron picks up the same `.env`.
fn scheduled_command() -> Result<String> {
    let exe = std::env::current_exe().context("cannot locate the running executable")?;
    let cwd = std::env::current_dir().context("cannot read the working directory")?;
    Ok(format!("cd {} && {} backup", shell_quote(&cwd), shell_quote(&exe)))
}

fn shell_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-".contains(c))
    {
        raw.into_owned()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}

pub struct HealthCommandHandler {
    container: Arc<DependencyContainer>,
}

impl HealthCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Probe every configured target, or only those matching `target`.
    pub async fn run_health_check(&self, target: Option<&str>) -> Result<HealthReport> {
        let mut targets = self.container.config.health_targets();
        if let Some(query) = target {
            targets.retain(|t| t.matches(query));
            if targets.is_empty() {
                let known: Vec<String> = self
                    .container
                    .config
                    .health_targets()
                    .iter()
                    .map(|t| t.name().to_string())
                    .collect();
                return Err(ConfigError::InvalidValue {
                    key: "target".to_string(),
                    message: format!("no target matches {query:?}; known: {}", known.join(", ")),
                }
                .into());
            }
        }

        let report = self.container.health_probe.check(&targets).await;
        println!("{report}");
        Ok(report)
    }
}

pub struct DeployCommandHandler {
    container: Arc<DependencyContainer>,
}

impl DeployCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// One full deployment cycle. Anything but a commit is an error.
    pub async fn deploy(&self, quick: bool) -> Result<DeploymentAttempt> {
        let _lock = self.container.acquire_lock()?;
        let attempt = self
            .container
            .orchestrator
            .deploy(DeployOptions { quick }, shutdown_signal())
            .await;

        print_attempt(&attempt);
        match DeployError::from_attempt(&attempt) {
            Some(err) => Err(err.into()),
            None => Ok(attempt),
        }
    }

    /// Restore the newest snapshot. Ending rolled back is success here.
    pub async fn rollback(&self) -> Result<DeploymentAttempt> {
        let _lock = self.container.acquire_lock()?;
        let attempt = self.container.orchestrator.rollback_latest().await?;

        print_attempt(&attempt);
        if attempt.state == DeploymentState::RolledBack {
            return Ok(attempt);
        }
        match DeployError::from_attempt(&attempt) {
            Some(err) => Err(err.into()),
            None => Ok(attempt),
        }
    }

    pub async fn status(&self) -> Result<HealthReport> {
        let (containers, report) = self.container.orchestrator.status().await?;
        if containers.is_empty() {
            warn!("No containers reported by the runtime");
        }
        for container in &containers {
            println!(
                "{:<24} {:<12} {}",
                container.service,
                container.state,
                container.health.as_deref().unwrap_or("-")
            );
        }
        println!();
        println!("{report}");
        Ok(report)
    }

    pub async fn stop(&self) -> Result<()> {
        let _lock = self.container.acquire_lock()?;
        self.container.orchestrator.stop().await?;
        println!("Services stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        let _lock = self.container.acquire_lock()?;
        self.container.orchestrator.restart().await?;
        println!("Services restarted");
        Ok(())
    }

    pub async fn logs(&self, lines: usize) -> Result<()> {
        let logs = self.container.orchestrator.logs(lines).await?;
        print!("{logs}");
        Ok(())
    }
}

fn print_attempt(attempt: &DeploymentAttempt) {
    let history: Vec<String> = attempt.history.iter().map(|s| s.to_string()).collect();
    println!("Deployment {}: {}", attempt.state, history.join(" -> "));
    if let Some(id) = &attempt.snapshot_id {
        println!("Pre-deployment snapshot: {id}");
    }
    if let Some(revision) = &attempt.revision {
        println!("Revision: {revision}");
    }
    if let Some(reason) = &attempt.failure {
        println!("Reason: {reason}");
    }
    if let Some(report) = &attempt.final_report {
        println!("{report}");
    }
}
