use super::{HealthReport, HealthStatus, HealthTarget, HealthVerdict, RetryPolicy};
use crate::runtime::{ContainerRuntime, ContainerStatus, DatastoreClient};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Checks HTTP endpoints, container health and datastore readiness.
///
/// `check` is total: every target gets exactly one verdict, and a target
/// that errors or exceeds the per-target timeout is reported `unhealthy`
/// with a diagnostic instead of failing the cycle.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    datastore: Option<Arc<dyn DatastoreClient>>,
    timeout: Duration,
    concurrency: usize,
}

impl HealthProbe {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            runtime: None,
            datastore: None,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_datastore(mut self, datastore: Arc<dyn DatastoreClient>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    /// One probe cycle over `targets`, at most `concurrency` in flight.
    pub async fn check(&self, targets: &[HealthTarget]) -> HealthReport {
        let mut results: Vec<(usize, HealthVerdict)> = stream::iter(targets.iter().enumerate())
            .map(|(index, target)| async move { (index, self.check_target(target).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let report = HealthReport::new(
            results.into_iter().map(|(_, verdict)| verdict).collect(),
            Utc::now(),
        );
        debug!(
            "Probe cycle over {} targets: {}",
            report.verdicts.len(),
            report.overall
        );
        report
    }

    /// Repeat cycles until everything is healthy or the policy gives up.
    /// Returns the final cycle.
    pub async fn check_with_retry(
        &self,
        targets: &[HealthTarget],
        policy: &RetryPolicy,
    ) -> HealthReport {
        policy
            .repeat_until(
                |attempt| async move {
                    let report = self.check(targets).await;
                    if report.is_healthy() {
                        info!("Health check {} passed", attempt);
                    } else {
                        warn!(
                            "Health check {} {}: {}",
                            attempt,
                            report.overall,
                            report.failing_targets().join(", ")
                        );
                    }
                    report
                },
                HealthReport::is_healthy,
            )
            .await
    }

    async fn check_target(&self, target: &HealthTarget) -> HealthVerdict {
        let started = Instant::now();
        let verdict = match tokio::time::timeout(self.timeout, self.probe(target)).await {
            Ok(verdict) => verdict,
            Err(_) => HealthVerdict::new(target.name(), HealthStatus::Unhealthy)
                .with_message(format!("timed out after {:?}", self.timeout)),
        };
        verdict.with_latency(started.elapsed().as_millis() as u64)
    }

    async fn probe(&self, target: &HealthTarget) -> HealthVerdict {
        match target {
            HealthTarget::Http {
                name,
                url,
                expected_status,
            } => match self.client.get(url).send().await {
                Ok(response) if response.status().as_u16() == *expected_status => {
                    HealthVerdict::new(name, HealthStatus::Healthy)
                }
                Ok(response) => HealthVerdict::new(name, HealthStatus::Unhealthy).with_message(
                    format!("expected HTTP {}, got {}", expected_status, response.status()),
                ),
                Err(e) => unhealthy(name, e.to_string()),
            },
            HealthTarget::Container { name, service } => match &self.runtime {
                None => HealthVerdict::new(name, HealthStatus::Unknown)
                    .with_message("no container runtime configured"),
                Some(runtime) => match runtime.status(service).await {
                    Ok(status) => {
                        let (health, message) = classify_container(&status);
                        let verdict = HealthVerdict::new(name, health);
                        match message {
                            Some(message) => verdict.with_message(message),
                            None => verdict,
                        }
                    }
                    Err(e) => unhealthy(name, e.to_string()),
                },
            },
            HealthTarget::Datastore { name } => match &self.datastore {
                None => HealthVerdict::new(name, HealthStatus::Unknown)
                    .with_message("no datastore configured"),
                Some(datastore) => match datastore.ping().await {
                    Ok(()) => HealthVerdict::new(name, HealthStatus::Healthy),
                    Err(e) => unhealthy(name, e.to_string()),
                },
            },
        }
    }
}

fn unhealthy(name: &str, message: String) -> HealthVerdict {
    let message = if message.trim().is_empty() {
        "probe failed without diagnostics".to_string()
    } else {
        message
    };
    HealthVerdict::new(name, HealthStatus::Unhealthy).with_message(message)
}

/// Map a container's runtime state to a verdict status.
pub fn classify_container(status: &ContainerStatus) -> (HealthStatus, Option<String>) {
    if !status.is_running() {
        return (
            HealthStatus::Unhealthy,
            Some(format!("container is {}", status.state)),
        );
    }
    match status.health.as_deref() {
        Some("healthy") => (HealthStatus::Healthy, None),
        Some("unhealthy") => (
            HealthStatus::Unhealthy,
            Some("healthcheck reports unhealthy".to_string()),
        ),
        Some("starting") => (HealthStatus::Starting, None),
        Some("") | None => (
            HealthStatus::Unknown,
            Some("no healthcheck defined".to_string()),
        ),
        Some(other) => (
            HealthStatus::Unknown,
            Some(format!("unrecognised health state {other:?}")),
        ),
    }
}
