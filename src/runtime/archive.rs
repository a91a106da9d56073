use super::{run_command, ArchiveStore, Result, RuntimeError};
use crate::config::ArchiveConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

/// S3-compatible object storage reached through the `aws` CLI.
#[derive(Debug, Clone)]
pub struct S3CliArchive {
    bucket: String,
    region: Option<String>,
    endpoint_url: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
}

impl S3CliArchive {
    pub fn new(bucket: String, config: &ArchiveConfig) -> Self {
        Self {
            bucket,
            region: config.region.clone(),
            endpoint_url: config.endpoint_url.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
        }
    }

    fn aws(&self) -> Command {
        let mut cmd = Command::new("aws");
        if let Some(key) = &self.access_key {
            cmd.env("AWS_ACCESS_KEY_ID", key);
        }
        if let Some(secret) = &self.secret_key {
            cmd.env("AWS_SECRET_ACCESS_KEY", secret);
        }
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        if let Some(endpoint) = &self.endpoint_url {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        cmd.arg("s3");
        cmd
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key.trim_start_matches('/'))
    }
}

/// Keys from `aws s3 ls --recursive` lines: `DATE TIME SIZE KEY`.
fn parse_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _date = parts.next()?;
            let _time = parts.next()?;
            let _size = parts.next()?;
            let key: Vec<&str> = parts.collect();
            if key.is_empty() {
                None
            } else {
                Some(key.join(" "))
            }
        })
        .collect()
}

#[async_trait]
impl ArchiveStore for S3CliArchive {
    async fn put(&self, key: &str, source: &Path) -> Result<()> {
        let mut cmd = self.aws();
        cmd.arg("cp").arg(source).arg(self.url(key)).arg("--only-show-errors");
        run_command(&mut cmd, "aws s3 cp (upload)").await?;
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<()> {
        let mut cmd = self.aws();
        cmd.arg("cp").arg(self.url(key)).arg(dest).arg("--only-show-errors");
        run_command(&mut cmd, "aws s3 cp (download)").await.map_err(|e| match e {
            RuntimeError::CommandFailed { message, .. } if message.contains("404") => {
                RuntimeError::NotFound(key.to_string())
            }
            other => other,
        })?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut cmd = self.aws();
        cmd.arg("ls").arg(self.url(prefix)).arg("--recursive");
        // `aws s3 ls` exits 1 when nothing matches the prefix.
        match run_command(&mut cmd, "aws s3 ls").await {
            Ok(output) => Ok(parse_listing(&String::from_utf8_lossy(&output.stdout))),
            Err(RuntimeError::CommandFailed { message, .. }) if message.trim().starts_with('(') => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut cmd = self.aws();
        cmd.arg("rm").arg(self.url(key)).arg("--only-show-errors");
        run_command(&mut cmd, "aws s3 rm").await?;
        Ok(())
    }
}

/// Archive kept in a directory, typically a mounted network share.
#[derive(Debug, Clone)]
pub struct LocalDirArchive {
    root: PathBuf,
}

impl LocalDirArchive {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ArchiveStore for LocalDirArchive {
    async fn put(&self, key: &str, source: &Path) -> Result<()> {
        let dest = self.path_for(key);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Copy under a temporary name so a reader never sees a partial object.
        let mut partial = dest.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        fs::copy(source, &partial).await?;
        fs::rename(&partial, &dest).await?;
        debug!("Archived {} as {}", source.display(), key);
        Ok(())
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<()> {
        let source = self.path_for(key);
        if !source.exists() {
            return Err(RuntimeError::NotFound(key.to_string()));
        }
        fs::copy(&source, dest).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".partial") {
                continue;
            }
            keys.push(join_key(prefix, &name));
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// `prefix/name`, or just `name` for an empty prefix.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_listing() {
        let stdout = "2024-05-01 02:00:03      48213 printhub/backups/20240501_020000_000.dump\n\
                      2024-05-01 02:00:04       9120 printhub/backups/20240501_020000_000.sql.zst\n";
        let keys = parse_listing(stdout);
        assert_eq!(
            keys,
            vec![
                "printhub/backups/20240501_020000_000.dump",
                "printhub/backups/20240501_020000_000.sql.zst"
            ]
        );
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "a.dump"), "a.dump");
        assert_eq!(join_key("backups/", "a.dump"), "backups/a.dump");
    }

    #[tokio::test]
    async fn test_local_dir_archive_put_list_get_delete() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let archive = LocalDirArchive::new(remote.path().to_path_buf());

        let source = local.path().join("20240501_020000_000.sql.zst");
        fs::write(&source, b"payload").await.unwrap();

        archive
            .put("backups/20240501_020000_000.sql.zst", &source)
            .await
            .unwrap();
        let keys = archive.list("backups").await.unwrap();
        assert_eq!(keys, vec!["backups/20240501_020000_000.sql.zst"]);

        let fetched = local.path().join("fetched");
        archive.get(&keys[0], &fetched).await.unwrap();
        assert_eq!(fs::read(&fetched).await.unwrap(), b"payload");

        archive.delete(&keys[0]).await.unwrap();
        assert!(archive.list("backups").await.unwrap().is_empty());
        assert!(matches!(
            archive.get(&keys[0], &fetched).await,
            Err(RuntimeError::NotFound(_))
        ));
    }
}
