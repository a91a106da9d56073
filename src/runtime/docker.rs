use super::{run_command, ContainerRuntime, ContainerStatus, Result, RuntimeError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// `docker compose` driven container runtime.
#[derive(Debug, Clone)]
pub struct DockerComposeRuntime {
    compose_file: PathBuf,
    project_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ComposePsEntry {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Health", default)]
    health: String,
}

impl From<ComposePsEntry> for ContainerStatus {
    fn from(entry: ComposePsEntry) -> Self {
        Self {
            service: entry.service,
            state: entry.state,
            health: if entry.health.is_empty() {
                None
            } else {
                Some(entry.health)
            },
        }
    }
}

impl DockerComposeRuntime {
    pub fn new(compose_file: PathBuf, project_dir: PathBuf) -> Self {
        Self {
            compose_file,
            project_dir,
        }
    }

    fn compose(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("--file")
            .arg(&self.compose_file)
            .arg("--project-directory")
            .arg(&self.project_dir);
        cmd
    }

    async fn compose_run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = self.compose();
        cmd.args(args);
        let label = format!("docker compose {}", args.join(" "));
        let output = run_command(&mut cmd, &label).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ps(&self, service: Option<&str>) -> Result<Vec<ContainerStatus>> {
        let mut args = vec!["ps", "--all", "--format", "json"];
        if let Some(service) = service {
            args.push(service);
        }
        let stdout = self.compose_run(&args).await?;
        parse_ps_output(&stdout)
    }
}

/// Compose prints either one JSON array or one object per line depending on
/// its version.
fn parse_ps_output(stdout: &str) -> Result<Vec<ContainerStatus>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let parse_err = |e: serde_json::Error| RuntimeError::CommandFailed {
        command: "docker compose ps".to_string(),
        message: format!("unexpected output: {e}"),
    };

    if trimmed.starts_with('[') {
        let entries: Vec<ComposePsEntry> = serde_json::from_str(trimmed).map_err(parse_err)?;
        return Ok(entries.into_iter().map(Into::into).collect());
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<ComposePsEntry>(line)
                .map(Into::into)
                .map_err(parse_err)
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerComposeRuntime {
    async fn status(&self, service: &str) -> Result<ContainerStatus> {
        let statuses = self.ps(Some(service)).await?;
        Ok(statuses
            .into_iter()
            .find(|s| s.service == service)
            .unwrap_or_else(|| ContainerStatus::missing(service)))
    }

    async fn list(&self) -> Result<Vec<ContainerStatus>> {
        self.ps(None).await
    }

    async fn stop(&self) -> Result<()> {
        info!("Stopping services");
        self.compose_run(&["down"]).await.map(|_| ())
    }

    async fn build(&self) -> Result<()> {
        info!("Building service images");
        self.compose_run(&["build"]).await.map(|_| ())
    }

    async fn start(&self) -> Result<()> {
        info!("Starting services");
        self.compose_run(&["up", "-d"]).await.map(|_| ())
    }

    async fn restart(&self) -> Result<()> {
        info!("Restarting services");
        self.compose_run(&["restart"]).await.map(|_| ())
    }

    async fn exec(&self, service: &str, command: &[String]) -> Result<String> {
        let mut args = vec!["exec", "-T", service];
        args.extend(command.iter().map(String::as_str));
        self.compose_run(&args).await
    }

    async fn logs(&self, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        self.compose_run(&["logs", "--no-color", "--tail", &tail])
            .await
    }

    async fn prune_images(&self) -> Result<()> {
        debug!("Pruning dangling images");
        let mut cmd = Command::new("docker");
        cmd.args(["image", "prune", "-f"]);
        run_command(&mut cmd, "docker image prune").await.map(|_| ())
    }
}
