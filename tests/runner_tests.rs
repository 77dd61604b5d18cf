use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use odata_sync::jobs::{IncrementalWindow, JobSpec};
use odata_sync::job_state::JobStateStore;
use odata_sync::logging::ErrorReporter;
use odata_sync::odata::{Credentials, PullClient, PushClient, RetryPolicy};
use odata_sync::repositories::WriteStrategy;
use odata_sync::sync_executor::{JobRunner, RunPhase, RunStatus, RunnerOptions};
use odata_sync::transform::MapOptions;
use sea_orm::DatabaseConnection;
use serde_json::json;
use tempfile::TempDir;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_json, header, method, path, query_param},
};

mod test_utils;
use test_utils::{
    count, error_log_lines, execute, file_reporter, pull_job, push_job, query_json,
    setup_test_db,
};

struct Harness {
    db: Arc<DatabaseConnection>,
    runner: JobRunner,
    logs: TempDir,
    _state: TempDir,
}

async fn harness() -> Harness {
    let db = setup_test_db().await.unwrap();
    let logs = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let reporter: Arc<ErrorReporter> = file_reporter(logs.path()).unwrap();
    let http = reqwest::Client::new();
    let credentials = Credentials::new("SYNC_USER", "secret");

    let runner = JobRunner::new(
        db.clone(),
        PullClient::new(
            http.clone(),
            credentials.clone(),
            RetryPolicy::new(0, Duration::from_millis(1)),
            Duration::from_secs(5),
        ),
        PushClient::new(http, credentials, Duration::from_secs(5)),
        JobStateStore::new(state.path()),
        reporter,
        RunnerOptions {
            page_size: 100,
            batch_size: 50,
            map: MapOptions::default(),
        },
    );

    Harness {
        db,
        runner,
        logs,
        _state: state,
    }
}

#[tokio::test]
async fn pull_job_loads_rows_and_records_success() {
    let h = harness().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/odata/Materials"))
        .and(query_param("$top", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {"Material": "M-1", "MaterialName": "Bolt", "Plant": "1000"},
                {"Material": "M-2", "MaterialName": "Nut"}
            ],
            "@odata.nextLink": "Materials?$skiptoken=2"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/odata/Materials"))
        .and(query_param("$skiptoken", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [{"Material": "M-3", "MaterialName": "Washer"}]
        })))
        .mount(&server)
        .await;

    let job = pull_job(
        "materials",
        &format!("{}/odata/Materials", server.uri()),
        WriteStrategy::Replace,
    );
    let report = h.runner.run(&job).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.phase, RunPhase::Done);
    assert_eq!(report.rows_read, 3);
    assert_eq!(report.rows_written, 3);
    assert_eq!(count(&h.db, "materials").await.unwrap(), 3);
    assert!(
        h.runner
            .state_store()
            .get_last_success("materials")
            .await
            .is_some()
    );
}

#[tokio::test]
async fn failed_pull_is_fatal_and_keeps_state() {
    let h = harness().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
        .mount(&server)
        .await;

    let job = pull_job(
        "materials",
        &format!("{}/odata/Materials", server.uri()),
        WriteStrategy::Insert,
    );
    let report = h.runner.run(&job).await;

    assert_eq!(report.status, RunStatus::Fatal);
    assert_eq!(report.phase, RunPhase::Fetching);
    assert!(report.error.unwrap().contains("500"));
    assert!(h.runner.state_store().get("materials").await.is_none());

    let errors = error_log_lines(h.logs.path());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["message"], "Job run failed");
    assert_eq!(errors[0]["job_id"], "materials");
    assert_eq!(errors[0]["http_status"], 500);
}

#[tokio::test]
async fn incremental_pull_filters_from_last_success() {
    let h = harness().await;
    let server = MockServer::start().await;

    let last = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
    h.runner
        .state_store()
        .set_last_success("materials", last)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/odata/Materials"))
        .and(query_param(
            "$filter",
            "(Plant eq '1000') and (ChangedAt gt 2026-01-02T03:03:05Z)",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .expect(1)
        .mount(&server)
        .await;

    let mut job = pull_job(
        "materials",
        &format!("{}/odata/Materials", server.uri()),
        WriteStrategy::Upsert {
            key: vec!["id".into()],
        },
    );
    if let JobSpec::Pull(spec) = &mut job.spec {
        spec.source.filter = Some("Plant eq '1000'".to_string());
        spec.source.incremental = Some(IncrementalWindow {
            field: "ChangedAt".to_string(),
            overlap_seconds: 60,
        });
    }

    let report = h.runner.run(&job).await;
    assert_eq!(report.status, RunStatus::Success);

    let advanced = h
        .runner
        .state_store()
        .get_last_success("materials")
        .await
        .unwrap();
    assert!(advanced > last);
}

#[tokio::test]
async fn push_job_marks_rows_sent_or_error() {
    let h = harness().await;
    let server = MockServer::start().await;
    execute(
        &h.db,
        "INSERT INTO defects_outbox (id, material, quantity) VALUES \
         (1, 'M-1', 10), (2, 'M-2', 20), (3, 'M-3', 30)",
    )
    .await
    .unwrap();

    Mock::given(method("GET"))
        .and(path("/odata/"))
        .and(header("x-csrf-token", "fetch"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-csrf-token", "tok-1")
                .insert_header("set-cookie", "SAP_SESSIONID=s1; Path=/"),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Registered first so it wins over the catch-all below.
    Mock::given(method("POST"))
        .and(path("/odata/DefectSet"))
        .and(body_json(json!({"Material": "M-2", "Quantity": 20})))
        .respond_with(ResponseTemplate::new(400).set_body_string("Material M-2 is blocked"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/odata/DefectSet"))
        .and(header("x-csrf-token", "tok-1"))
        .and(header("cookie", "SAP_SESSIONID=s1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"DefectId": "D-1"})))
        .mount(&server)
        .await;

    let job = push_job("defects", &format!("{}/odata/", server.uri()));
    let report = h.runner.run(&job).await;

    assert_eq!(report.status, RunStatus::PartialFailure);
    assert_eq!(report.rows_read, 3);
    assert_eq!(report.rows_written, 2);
    assert_eq!(report.rows_failed, 1);

    let rows = query_json(
        &h.db,
        "SELECT json_object('id', id, 'status', sync_status, 'error', sync_error) AS j \
         FROM defects_outbox ORDER BY id",
    )
    .await
    .unwrap();
    assert_eq!(rows[0]["status"], "sent");
    assert_eq!(rows[1]["status"], "error");
    assert!(
        rows[1]["error"]
            .as_str()
            .unwrap()
            .contains("Material M-2 is blocked")
    );
    assert_eq!(rows[2]["status"], "sent");

    let errors = error_log_lines(h.logs.path());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["primary_key"], 2);
    assert_eq!(errors[0]["http_status"], 400);
    assert!(h.runner.state_store().get("defects").await.is_some());
}

#[tokio::test]
async fn rejected_csrf_token_is_refreshed_once() {
    let h = harness().await;
    let server = MockServer::start().await;
    execute(
        &h.db,
        "INSERT INTO defects_outbox (id, material, quantity) VALUES (1, 'M-1', 1)",
    )
    .await
    .unwrap();

    Mock::given(method("GET"))
        .and(header("x-csrf-token", "fetch"))
        .respond_with(ResponseTemplate::new(200).insert_header("x-csrf-token", "tok"))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("CSRF token validation failed"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .mount(&server)
        .await;

    let job = push_job("defects", &format!("{}/odata/", server.uri()));
    let report = h.runner.run(&job).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.rows_written, 1);
    let rows = query_json(
        &h.db,
        "SELECT json_object('status', sync_status) AS j FROM defects_outbox",
    )
    .await
    .unwrap();
    assert_eq!(rows, vec![json!({"status": "sent"})]);
}

#[tokio::test]
async fn push_without_pending_rows_skips_handshake() {
    let h = harness().await;
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let job = push_job("defects", &format!("{}/odata/", server.uri()));
    let report = h.runner.run(&job).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.rows_read, 0);
    assert!(h.runner.state_store().get("defects").await.is_some());
}
