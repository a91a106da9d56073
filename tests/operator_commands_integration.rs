
use printhub_ops::application::{HealthCommandHandler, ScheduleCommandHandler};
use printhub_ops::error::{classify, ErrorClass};
use printhub_ops::monitoring::HealthStatus;
use printhub_ops::schedule::{Frequency, MARKER};
use test_helpers::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_schedule_install_replaces_previous_entry() {
    let env = EnvironmentBuilder::new().build();
    env.crontab
        .set(None, "15 4 * * * /usr/bin/certbot renew\n");
    let handler = ScheduleCommandHandler::new(env.container.clone()).unwrap();

    handler.install("daily", Some("03:30"), None).await.unwrap();
    let entry = handler.install("weekly", None, None).await.unwrap();
    assert_eq!(entry.cron_expression(), "0 2 * * 0");

    let table = env.crontab.contents(None);
    assert!(table.contains("/usr/bin/certbot renew"));
    assert_eq!(table.matches(MARKER).count(), 1);
    assert!(table.contains("backup"));

    let entries = handler.list(None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].frequency, Frequency::Weekly);

    assert_eq!(handler.remove(None).await.unwrap(), 1);
    assert_eq!(env.crontab.contents(None), "15 4 * * * /usr/bin/certbot renew\n");
}

#[tokio::test]
async fn test_schedule_rejects_bad_time_before_reading_crontab() {
    let env = EnvironmentBuilder::new().build();
    let handler = ScheduleCommandHandler::new(env.container.clone()).unwrap();

    let err = handler.install("daily", Some("25:00"), None).await.unwrap_err();
    assert_eq!(classify(&err), ErrorClass::Configuration);

    let err = handler.install("monthly", None, None).await.unwrap_err();
    assert_eq!(classify(&err), ErrorClass::Configuration);

    assert_eq!(env.crontab.reads(), 0);
}

#[tokio::test]
async fn test_health_reports_every_target_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    let env = builder
        .configure(|c| {
            c.health.http_targets = vec![
                http_target("frontend", format!("{}/ok", server.uri())),
                http_target("backend", format!("{}/broken", server.uri())),
            ];
        })
        .build();

    let report = HealthCommandHandler::new(env.container.clone())
        .run_health_check(None)
        .await
        .unwrap();

    let names: Vec<&str> = report.verdicts.iter().map(|v| v.target.as_str()).collect();
    assert_eq!(names, ["frontend", "backend", "container:backend", "datastore"]);
    assert_eq!(report.verdict("frontend").unwrap().status, HealthStatus::Healthy);
    let broken = report.verdict("backend").unwrap();
    assert_eq!(broken.status, HealthStatus::Unhealthy);
    assert!(broken.message.as_deref().unwrap().contains("502"));
    assert_eq!(report.overall, HealthStatus::Unhealthy);
    assert_ne!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_health_single_target_and_unknown_target() {
    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    let env = builder.build();
    let handler = HealthCommandHandler::new(env.container.clone());

    let report = handler.run_health_check(Some("datastore")).await.unwrap();
    assert_eq!(report.verdicts.len(), 1);
    assert!(report.is_healthy());
    assert_eq!(report.exit_code(), 0);

    let err = handler.run_health_check(Some("nope")).await.unwrap_err();
    assert_eq!(classify(&err), ErrorClass::Configuration);
}

#[tokio::test]
async fn test_unreachable_target_gets_a_diagnostic() {
    let builder = EnvironmentBuilder::new();
    seed_orders(&builder.sqlite_path(), &["ada"]).await;
    // Nothing listens on port 9 locally
    let env = builder
        .configure(|c| {
            c.health.http_targets = vec![http_target("backend", "http://127.0.0.1:9/".to_string())];
            c.health.containers.clear();
            c.health.check_datastore = false;
        })
        .build();

    let report = HealthCommandHandler::new(env.container.clone())
        .run_health_check(None)
        .await
        .unwrap();

    let verdict = report.verdict("backend").unwrap();
    assert_eq!(verdict.status, HealthStatus::Unhealthy);
    assert!(!verdict.message.as_deref().unwrap().is_empty());
}
