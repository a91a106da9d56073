pub mod health;
pub mod retry;

pub use health::*;
pub use retry::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    /// No health contract; never blocks a deployment
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Starting => "starting",
            HealthStatus::Unknown => "unknown",
        })
    }
}

/// Something the probe can check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthTarget {
    Http {
        name: String,
        url: String,
        expected_status: u16,
    },
    Container {
        name: String,
        service: String,
    },
    Datastore {
        name: String,
    },
}

impl HealthTarget {
    pub fn name(&self) -> &str {
        match self {
            HealthTarget::Http { name, .. }
            | HealthTarget::Container { name, .. }
            | HealthTarget::Datastore { name } => name,
        }
    }

    /// Matches the target's own name, or the bare service of a container.
    pub fn matches(&self, query: &str) -> bool {
        match self {
            HealthTarget::Container { name, service } => name == query || service == query,
            other => other.name() == query,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthVerdict {
    pub target: String,
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub message: Option<String>,
}

impl HealthVerdict {
    pub fn new(target: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            target: target.into(),
            status,
            latency_ms: None,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Any unhealthy wins, then any starting, otherwise healthy. Unknown
/// verdicts do not count.
pub fn aggregate(verdicts: &[HealthVerdict]) -> HealthStatus {
    let statuses = || verdicts.iter().map(|v| v.status);
    if statuses().any(|s| s == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if statuses().any(|s| s == HealthStatus::Starting) {
        HealthStatus::Starting
    } else {
        HealthStatus::Healthy
    }
}

/// One probe cycle: a verdict per target, in target order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub verdicts: Vec<HealthVerdict>,
    pub overall: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(verdicts: Vec<HealthVerdict>, checked_at: DateTime<Utc>) -> Self {
        let overall = aggregate(&verdicts);
        Self {
            verdicts,
            overall,
            checked_at,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }

    pub fn verdict(&self, target: &str) -> Option<&HealthVerdict> {
        self.verdicts.iter().find(|v| v.target == target)
    }

    /// 0 healthy, 1 starting, 2 unhealthy.
    pub fn exit_code(&self) -> u8 {
        match self.overall {
            HealthStatus::Healthy | HealthStatus::Unknown => 0,
            HealthStatus::Starting => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    pub fn failing_targets(&self) -> Vec<&str> {
        self.verdicts
            .iter()
            .filter(|v| matches!(v.status, HealthStatus::Unhealthy | HealthStatus::Starting))
            .map(|v| v.target.as_str())
            .collect()
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .verdicts
            .iter()
            .map(|v| v.target.len())
            .max()
            .unwrap_or(6)
            .max(6);

        writeln!(f, "{:<width$}  {:<9}  {:>8}  DETAIL", "TARGET", "STATUS", "LATENCY")?;
        for verdict in &self.verdicts {
            let latency = verdict
                .latency_ms
                .map(|ms| format!("{ms}ms"))
                .unwrap_or_else(|| "-".to_string());
            writeln!(
                f,
                "{:<width$}  {:<9}  {:>8}  {}",
                verdict.target,
                verdict.status.to_string(),
                latency,
                verdict.message.as_deref().unwrap_or("")
            )?;
        }
        write!(f, "overall: {}", self.overall)
    }
}
