//! Deployment cycles against a scripted runtime, a real SQLite datastore and
//! a mocked HTTP backend.


use printhub_ops::application::DeployCommandHandler;
use printhub_ops::deploy::{DeployOptions, DeploymentState};
use printhub_ops::error::{classify, ErrorClass};
use printhub_ops::monitoring::HealthStatus;
use std::time::Duration;
use test_helpers::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn backend(status: u16, expected_hits: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/health"))
        .respond_with(ResponseTemplate::new(status))
        .expect(expected_hits)
        .mount(&server)
        .await;
    server
}

async fn webhook(expected_posts: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .expect(expected_posts)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_unhealthy_backend_rolls_back_to_pre_deploy_snapshot() {
    // Three failed probes during the retry window, one after rollback
    let server = backend(500, 4).await;
    // backup, rollback restore and deploy outcome
    let hook = webhook(3).await;

    let builder = EnvironmentBuilder::new();
    let db = builder.sqlite_path();
    seed_orders(&db, &["ada", "brook", "cyd"]).await;
    let env = builder
        .runtime(ScriptedRuntime::new().with_migration_db(db.clone()))
        .configure(|c| {
            c.health.http_targets = vec![http_target(
                "backend",
                format!("{}/api/v1/health", server.uri()),
            )];
            c.deploy.health_retries = 3;
            c.notification.webhook_url = Some(format!("{}/hook", hook.uri()));
        })
        .build();

    let err = DeployCommandHandler::new(env.container.clone())
        .deploy(false)
        .await
        .unwrap_err();
    assert_ne!(classify(&err).exit_code(), 0);

    // The migration's row is gone again
    assert_eq!(order_customers(&db).await, ["ada", "brook", "cyd"]);

    // Services are down while the snapshot is restored, then come back up
    let calls = env.runtime.calls();
    assert_eq!(calls.len(), 6);
    assert_eq!(&calls[..3], ["stop", "build", "start"]);
    assert!(calls[3].starts_with("exec backend"));
    assert_eq!(&calls[4..], ["stop", "start"]);

    // Settle delay, then two waits between the three probes
    let sleeps = env.clock.sleeps();
    assert_eq!(sleeps.len(), 3);
    assert_eq!(sleeps[0], Duration::from_secs(5));

    let snapshots = env.container.backup_manager.list_snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 1);
}

#[tokio::test]
async fn test_orchestrator_records_rollback_history() {
    let server = backend(503, 3).await;
    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    let env = builder
        .configure(|c| {
            c.health.http_targets = vec![http_target(
                "backend",
                format!("{}/api/v1/health", server.uri()),
            )];
            c.deploy.health_retries = 2;
        })
        .build();

    let attempt = env
        .container
        .orchestrator
        .deploy(DeployOptions::default(), std::future::pending())
        .await;

    assert_eq!(attempt.state, DeploymentState::RolledBack);
    assert_eq!(
        attempt.history,
        [
            DeploymentState::Idle,
            DeploymentState::BackingUp,
            DeploymentState::Deploying,
            DeploymentState::HealthChecking,
            DeploymentState::RollingBack,
            DeploymentState::RolledBack,
        ]
    );
    assert!(attempt.snapshot_id.is_some());
    assert!(attempt.failure.as_deref().unwrap().contains("backend"));
    let report = attempt.final_report.unwrap();
    assert_eq!(report.overall, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_healthy_deploy_commits_and_prunes() {
    let server = backend(200, 1).await;
    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    let env = builder
        .configure(|c| {
            c.health.http_targets = vec![http_target(
                "backend",
                format!("{}/api/v1/health", server.uri()),
            )];
        })
        .build();

    let attempt = DeployCommandHandler::new(env.container.clone())
        .deploy(false)
        .await
        .unwrap();

    assert_eq!(attempt.state, DeploymentState::Committed);
    assert!(attempt.finished_at.is_some());
    assert!(attempt.final_report.unwrap().is_healthy());
    assert_eq!(env.runtime.calls().last().map(String::as_str), Some("prune"));
    assert_eq!(env.clock.sleeps(), [Duration::from_secs(5)]);
}

#[tokio::test]
async fn test_quick_deploy_failure_has_nothing_to_roll_back() {
    let server = backend(500, 1).await;
    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    let env = builder
        .configure(|c| {
            c.health.http_targets = vec![http_target(
                "backend",
                format!("{}/api/v1/health", server.uri()),
            )];
            c.deploy.health_retries = 1;
        })
        .build();

    let attempt = env
        .container
        .orchestrator
        .deploy(DeployOptions { quick: true }, std::future::pending())
        .await;

    assert_eq!(attempt.state, DeploymentState::FailedNoBackup);
    assert!(attempt.snapshot_id.is_none());
    assert!(env.container.backup_manager.list_snapshots().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_pre_deploy_backup_stops_before_touching_services() {
    // No datastore file, so the backup cannot connect
    let env = EnvironmentBuilder::new().build();

    let err = DeployCommandHandler::new(env.container.clone())
        .deploy(false)
        .await
        .unwrap_err();

    assert_eq!(classify(&err), ErrorClass::Other);
    assert!(err.to_string().contains("failed-no-backup"));
    assert!(env.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_rollout_error_rolls_back() {
    let builder = EnvironmentBuilder::new();
    let db = builder.sqlite_path();
    seed_orders(&db, &["ada"]).await;
    let env = builder
        .runtime(ScriptedRuntime::new().failing_build())
        .build();

    let attempt = env
        .container
        .orchestrator
        .deploy(DeployOptions::default(), std::future::pending())
        .await;

    assert_eq!(attempt.state, DeploymentState::RolledBack);
    assert!(attempt.failure.unwrap().contains("build context missing"));
    assert_eq!(env.runtime.calls(), ["stop", "build", "stop", "start"]);
    assert_eq!(order_customers(&db).await, ["ada"]);
}

#[tokio::test]
async fn test_interrupt_before_backup_completes() {
    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    let env = builder.build();

    let attempt = env
        .container
        .orchestrator
        .deploy(DeployOptions::default(), std::future::ready(()))
        .await;

    assert_eq!(attempt.state, DeploymentState::FailedNoBackup);
    assert!(attempt.failure.unwrap().contains("interrupted"));
    assert!(env.runtime.calls().is_empty());
}

#[tokio::test]
async fn test_operator_rollback_without_snapshot_is_state_error() {
    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    let env = builder.build();

    let err = DeployCommandHandler::new(env.container.clone())
        .rollback()
        .await
        .unwrap_err();

    assert_eq!(classify(&err), ErrorClass::State);
}

#[tokio::test]
async fn test_operator_rollback_restores_latest_snapshot() {
    let builder = EnvironmentBuilder::new();
    let db = builder.sqlite_path();
    seed_orders(&db, &["ada", "brook"]).await;
    let env = builder.build();

    env.container.backup_manager.create_snapshot().await.unwrap();
    insert_orders(&db, &["cyd"]).await;

    let attempt = DeployCommandHandler::new(env.container.clone())
        .rollback()
        .await
        .unwrap();

    assert_eq!(attempt.state, DeploymentState::RolledBack);
    assert_eq!(order_customers(&db).await, ["ada", "brook"]);
    assert_eq!(env.confirmer.times_asked(), 0);
    assert_eq!(env.runtime.calls(), ["stop", "start"]);
}
