use super::{Result, ScheduleError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Where schedule entries live. `None` is the invoking user's table.
#[async_trait]
pub trait CrontabStore: Send + Sync + std::fmt::Debug {
    async fn read(&self, user: Option<&str>) -> Result<String>;
    async fn write(&self, user: Option<&str>, contents: &str) -> Result<()>;
}

/// The host's `crontab` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCrontab;

impl SystemCrontab {
    fn command(user: Option<&str>) -> Command {
        let mut cmd = Command::new("crontab");
        if let Some(user) = user {
            cmd.arg("-u").arg(user);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

fn store_error(message: impl Into<String>) -> ScheduleError {
    ScheduleError::Store {
        message: message.into(),
    }
}

#[async_trait]
impl CrontabStore for SystemCrontab {
    async fn read(&self, user: Option<&str>) -> Result<String> {
        let output = Self::command(user)
            .arg("-l")
            .output()
            .await
            .map_err(|e| store_error(format!("failed to run crontab: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no crontab for") {
            debug!("No crontab installed yet");
            return Ok(String::new());
        }
        Err(store_error(format!("crontab -l failed: {}", stderr.trim())))
    }

    async fn write(&self, user: Option<&str>, contents: &str) -> Result<()> {
        let mut child = Self::command(user)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| store_error(format!("failed to run crontab: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(contents.as_bytes())
                .await
                .map_err(|e| store_error(format!("failed to write crontab: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| store_error(e.to_string()))?;
        if !output.status.success() {
            return Err(store_error(format!(
                "crontab install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Crontabs kept in memory, keyed by user.
#[derive(Debug, Default)]
pub struct InMemoryCrontab {
    tables: Mutex<HashMap<Option<String>, String>>,
    reads: AtomicUsize,
}

impl InMemoryCrontab {
    pub fn set(&self, user: Option<&str>, contents: &str) {
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(user.map(str::to_string), contents.to_string());
    }

    pub fn contents(&self, user: Option<&str>) -> String {
        self.tables
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&user.map(str::to_string))
            .cloned()
            .unwrap_or_default()
    }

    /// How many times the table was read through the store interface.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CrontabStore for InMemoryCrontab {
    async fn read(&self, user: Option<&str>) -> Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.contents(user))
    }

    async fn write(&self, user: Option<&str>, contents: &str) -> Result<()> {
        self.set(user, contents);
        Ok(())
    }
}
