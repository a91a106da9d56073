//! Success and failure pings to an operator webhook.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Backup,
    Restore,
    Deploy,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::Deploy => "deploy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEvent {
    pub operation: Operation,
    pub success: bool,
    pub snapshot_id: Option<String>,
    pub size_bytes: Option<u64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn success(operation: Operation, message: impl Into<String>) -> Self {
        Self {
            operation,
            success: true,
            snapshot_id: None,
            size_bytes: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(operation: Operation, message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(operation, message)
        }
    }

    pub fn with_snapshot(mut self, id: impl ToString, size_bytes: Option<u64>) -> Self {
        self.snapshot_id = Some(id.to_string());
        self.size_bytes = size_bytes;
        self
    }

    /// Chat-friendly one-liner, also sent as `text` for Slack-style hooks.
    pub fn summary(&self) -> String {
        let outcome = if self.success { "succeeded" } else { "FAILED" };
        let mut text = format!("printhub {} {}", self.operation.label(), outcome);
        if let Some(id) = &self.snapshot_id {
            text.push_str(&format!(" [{id}]"));
        }
        if let Some(size) = self.size_bytes {
            text.push_str(&format!(" {size} bytes"));
        }
        if !self.message.is_empty() {
            text.push_str(": ");
            text.push_str(&self.message);
        }
        text
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    text: String,
    #[serde(flatten)]
    event: &'a NotificationEvent,
}

/// Best-effort webhook. Delivery problems are logged and swallowed.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Returns whether the webhook accepted the event.
    pub async fn send(&self, event: &NotificationEvent) -> bool {
        let Some(url) = &self.url else {
            debug!("No webhook configured, skipping notification");
            return false;
        };

        let payload = Payload {
            text: event.summary(),
            event,
        };
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Notification delivered ({})", response.status());
                true
            }
            Ok(response) => {
                warn!("Notification webhook answered {}", response.status());
                false
            }
            Err(e) => {
                warn!("Failed to deliver notification: {}", e);
                false
            }
        }
    }
}
