use super::{run_command, AssetArchiver, Result, RuntimeError};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// gzip-compressed tarballs through the system `tar`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarArchiver;

#[async_trait]
impl AssetArchiver for TarArchiver {
    async fn create(&self, source_dir: &Path, dest: &Path) -> Result<()> {
        let (parent, name) = split_dir(source_dir)?;
        let mut cmd = Command::new("tar");
        cmd.arg("-czf").arg(dest).arg("-C").arg(parent).arg(name);
        run_command(&mut cmd, "tar -czf").await?;
        Ok(())
    }

    async fn verify(&self, archive: &Path) -> Result<Vec<String>> {
        let mut cmd = Command::new("tar");
        cmd.arg("-tzf").arg(archive);
        let output = run_command(&mut cmd, "tar -tzf").await?;
        let entries: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if entries.is_empty() {
            return Err(RuntimeError::CommandFailed {
                command: "tar -tzf".to_string(),
                message: "archive has no entries".to_string(),
            });
        }
        Ok(entries)
    }

    /// Extracts next to `dest_dir` so the archived top-level directory lands
    /// on `dest_dir` itself.
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        let (parent, _) = split_dir(dest_dir)?;
        tokio::fs::create_dir_all(parent).await?;
        let mut cmd = Command::new("tar");
        cmd.arg("-xzf").arg(archive).arg("-C").arg(parent);
        run_command(&mut cmd, "tar -xzf").await?;
        Ok(())
    }
}

fn split_dir(dir: &Path) -> Result<(&Path, &std::ffi::OsStr)> {
    match (dir.parent(), dir.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(RuntimeError::Unsupported(format!(
            "cannot archive directory {}",
            dir.display()
        ))),
    }
}
