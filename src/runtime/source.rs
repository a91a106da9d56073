use super::{run_command, Result, SourceRepository};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::info;

/// Git checkout of the deployed application.
#[derive(Debug, Clone)]
pub struct GitSource {
    dir: PathBuf,
}

impl GitSource {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.dir);
        cmd
    }
}

#[async_trait]
impl SourceRepository for GitSource {
    async fn revision(&self) -> Result<String> {
        let mut cmd = self.git();
        cmd.args(["rev-parse", "--short", "HEAD"]);
        let output = run_command(&mut cmd, "git rev-parse").await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn update(&self) -> Result<String> {
        let mut cmd = self.git();
        cmd.args(["pull", "--ff-only"]);
        run_command(&mut cmd, "git pull").await?;
        let revision = self.revision().await?;
        info!("Source updated to {}", revision);
        Ok(revision)
    }
}
