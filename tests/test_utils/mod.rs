//! Test utilities shared by the integration tests.
//!
//! Provides in-memory SQLite databases with sync target tables, job
//! definitions built in code, and error reporters writing into temp dirs.

#![allow(dead_code)]

use anyhow::Result;
use odata_sync::config::LoggingConfig;
use odata_sync::jobs::{JobDefinition, JobSpec, PullJob, PullSource, PushJob, PushTarget};
use odata_sync::logging::ErrorReporter;
use odata_sync::repositories::{LoadTarget, OutboxQuery, WriteStrategy};
use odata_sync::transform::Mapping;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Sets up an in-memory SQLite database with a `materials` target table and
/// a `defects_outbox` push table.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;

    execute(
        &db,
        "CREATE TABLE materials (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            plant TEXT
        )",
    )
    .await?;

    execute(
        &db,
        "CREATE TABLE defects_outbox (
            id INTEGER PRIMARY KEY,
            material TEXT,
            quantity INTEGER,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            sync_error TEXT,
            sent_at TEXT,
            response TEXT
        )",
    )
    .await?;

    Ok(Arc::new(db))
}

pub async fn execute(db: &DatabaseConnection, sql: &str) -> Result<()> {
    db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?;
    Ok(())
}

/// Rows of `sql` as JSON objects, one per row, via SQLite's `json_object`.
pub async fn query_json(db: &DatabaseConnection, sql: &str) -> Result<Vec<Value>> {
    let rows = db
        .query_all(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let text: String = row.try_get("", "j")?;
        out.push(serde_json::from_str(&text)?);
    }
    Ok(out)
}

pub async fn count(db: &DatabaseConnection, table: &str) -> Result<i64> {
    let row = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            format!("SELECT COUNT(*) AS n FROM {table}"),
        ))
        .await?
        .ok_or_else(|| anyhow::anyhow!("COUNT returned no row"))?;
    Ok(row.try_get("", "n")?)
}

pub fn materials_mapping() -> Mapping {
    Mapping {
        columns: vec!["id".into(), "description".into(), "plant".into()],
        rename: BTreeMap::from([
            ("Material".to_string(), "id".to_string()),
            ("MaterialName".to_string(), "description".to_string()),
            ("Plant".to_string(), "plant".to_string()),
        ]),
        length: BTreeMap::from([("description".to_string(), 20)]),
    }
}

pub fn materials_target(strategy: WriteStrategy) -> LoadTarget {
    LoadTarget {
        schema: "main".into(),
        table: "materials".into(),
        strategy,
    }
}

pub fn pull_job(id: &str, url: &str, strategy: WriteStrategy) -> JobDefinition {
    JobDefinition {
        id: id.to_string(),
        schedule: "0 */5 * * * *".to_string(),
        enabled: true,
        mapping: materials_mapping(),
        spec: JobSpec::Pull(PullJob {
            source: PullSource {
                url: url.to_string(),
                page_size: Some(2),
                filter: None,
                incremental: None,
            },
            target: materials_target(strategy),
        }),
        dir: PathBuf::from("jobs").join(id),
    }
}

pub fn defects_query() -> OutboxQuery {
    OutboxQuery {
        schema: "main".into(),
        table: "defects_outbox".into(),
        key_column: "id".into(),
        status_column: "sync_status".into(),
        error_column: "sync_error".into(),
        sent_at_column: Some("sent_at".into()),
        response_column: Some("response".into()),
        filter: None,
        order_by: None,
        limit: None,
    }
}

pub fn defects_mapping() -> Mapping {
    Mapping {
        columns: vec!["Material".into(), "Quantity".into()],
        rename: BTreeMap::from([
            ("material".to_string(), "Material".to_string()),
            ("quantity".to_string(), "Quantity".to_string()),
        ]),
        length: BTreeMap::new(),
    }
}

pub fn push_job(id: &str, service_url: &str) -> JobDefinition {
    JobDefinition {
        id: id.to_string(),
        schedule: "0 * * * * *".to_string(),
        enabled: true,
        mapping: defects_mapping(),
        spec: JobSpec::Push(PushJob {
            source: defects_query(),
            target: PushTarget {
                url: service_url.to_string(),
                action: Some("DefectSet".to_string()),
            },
        }),
        dir: PathBuf::from("jobs").join(id),
    }
}

/// Error reporter writing JSON lines to `<dir>/errors.log`.
pub fn file_reporter(dir: &Path) -> Result<Arc<ErrorReporter>> {
    let config = LoggingConfig {
        error_log_path: Some(dir.join("errors.log")),
        ..LoggingConfig::default()
    };
    Ok(Arc::new(ErrorReporter::new(&config)?))
}

/// Parsed JSON lines of the error log written by [`file_reporter`].
pub fn error_log_lines(dir: &Path) -> Vec<Value> {
    std::fs::read_to_string(dir.join("errors.log"))
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("error log line is JSON"))
        .collect()
}
