pub mod orchestrator;

pub use orchestrator::*;

use crate::backup::SnapshotId;
use crate::error::ErrorClass;
use crate::monitoring::HealthReport;
use crate::restore::RestoreError;
use crate::runtime::RuntimeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentState {
    Idle,
    BackingUp,
    Deploying,
    HealthChecking,
    RollingBack,
    Committed,
    RolledBack,
    FailedNoBackup,
    /// The restore performed during rollback failed
    RollbackFailed,
    /// Operator signal while backing up or deploying
    Interrupted,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentState::Committed
                | DeploymentState::RolledBack
                | DeploymentState::FailedNoBackup
                | DeploymentState::RollbackFailed
                | DeploymentState::Interrupted
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeploymentState::Idle => "idle",
            DeploymentState::BackingUp => "backing-up",
            DeploymentState::Deploying => "deploying",
            DeploymentState::HealthChecking => "health-checking",
            DeploymentState::RollingBack => "rolling-back",
            DeploymentState::Committed => "committed",
            DeploymentState::RolledBack => "rolled-back",
            DeploymentState::FailedNoBackup => "failed-no-backup",
            DeploymentState::RollbackFailed => "rollback-failed",
            DeploymentState::Interrupted => "interrupted",
        })
    }
}

/// Record of one deployment cycle. The terminal state is assigned once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    /// Pre-deployment snapshot; `None` only for quick deploys or when the
    /// backup failed
    pub snapshot_id: Option<SnapshotId>,
    pub revision: Option<String>,
    pub state: DeploymentState,
    pub history: Vec<DeploymentState>,
    pub failure: Option<String>,
    /// Last probe cycle that decided the outcome
    pub final_report: Option<HealthReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentAttempt {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            snapshot_id: None,
            revision: None,
            state: DeploymentState::Idle,
            history: vec![DeploymentState::Idle],
            failure: None,
            final_report: None,
            started_at,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(&mut self, to: DeploymentState) {
        if self.is_finished() {
            warn!(
                "Ignoring transition {} -> {}: attempt already finished",
                self.state, to
            );
            return;
        }
        info!("Deployment state: {} -> {}", self.state, to);
        self.state = to;
        self.history.push(to);
    }

    pub fn finish(&mut self, state: DeploymentState, at: DateTime<Utc>) {
        debug_assert!(state.is_terminal());
        if self.is_finished() {
            warn!("Deployment already finished as {}, not {}", self.state, state);
            return;
        }
        self.transition(state);
        self.finished_at = Some(at);
        match state {
            DeploymentState::Committed => info!("Deployment committed"),
            other => error!(
                "Deployment ended {}: {}",
                other,
                self.failure.as_deref().unwrap_or("no details")
            ),
        }
    }

    pub fn fail(&mut self, state: DeploymentState, reason: impl Into<String>, at: DateTime<Utc>) {
        if self.failure.is_none() {
            self.failure = Some(reason.into());
        }
        self.finish(state, at);
    }

    pub fn succeeded(&self) -> bool {
        self.state == DeploymentState::Committed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("No snapshot available to roll back to")]
    NoSnapshot,

    #[error("Deployment ended {state}: {reason}")]
    NotCommitted {
        state: DeploymentState,
        reason: String,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("Backup error: {0}")]
    Backup(#[from] crate::backup::BackupError),
}

impl DeployError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DeployError::NoSnapshot => ErrorClass::State,
            DeployError::NotCommitted { state, .. } => match state {
                DeploymentState::RollbackFailed => ErrorClass::Integrity,
                _ => ErrorClass::Other,
            },
            DeployError::Runtime(e) => e.class(),
            DeployError::Restore(e) => e.class(),
            DeployError::Backup(e) => e.class(),
        }
    }

    /// Error for an attempt that did not commit, or `None` if it did.
    pub fn from_attempt(attempt: &DeploymentAttempt) -> Option<Self> {
        if attempt.succeeded() {
            return None;
        }
        Some(DeployError::NotCommitted {
            state: attempt.state,
            reason: attempt
                .failure
                .clone()
                .unwrap_or_else(|| "no details".to_string()),
        })
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
