//! # Loader
//!
//! Writes mapped rows into a target table using one of three strategies.
//! Replace-all runs in a single transaction; insert and upsert write one row
//! per statement so a bad row never rolls back the rows before it.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement, TransactionTrait,
    Value as DbValue,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{ColumnType, column_types, qualified_table, quote_ident, to_db_value, typed_placeholder};
use crate::error::{ErrorContext, SyncError};
use crate::logging::ErrorReporter;
use crate::transform::{MappedRow, Mapping, to_object};

const POSTGRES_MAX_PARAMS: usize = 65_535;
const SQLITE_MAX_PARAMS: usize = 32_766;

/// How mapped rows reach the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Atomically replace the table contents.
    Replace,
    /// Plain row-wise insert.
    Insert,
    /// Row-wise insert, updating on conflict with `key`.
    Upsert { key: Vec<String> },
}

impl WriteStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            WriteStrategy::Replace => "replace",
            WriteStrategy::Insert => "insert",
            WriteStrategy::Upsert { .. } => "upsert",
        }
    }
}

/// Target table of a pull job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LoadTargetFile", into = "LoadTargetFile")]
pub struct LoadTarget {
    pub schema: String,
    pub table: String,
    pub strategy: WriteStrategy,
}

/// On-disk shape of [`LoadTarget`]: a flat strategy name plus an optional key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadTargetFile {
    #[serde(default = "default_schema")]
    schema: String,
    table: String,
    #[serde(default = "default_strategy")]
    strategy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    key: Vec<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_strategy() -> String {
    "insert".to_string()
}

impl TryFrom<LoadTargetFile> for LoadTarget {
    type Error = String;

    fn try_from(file: LoadTargetFile) -> Result<Self, Self::Error> {
        let strategy = match file.strategy.to_ascii_lowercase().as_str() {
            "replace" | "replace_all" | "replace-all" => WriteStrategy::Replace,
            "insert" => WriteStrategy::Insert,
            "upsert" if file.key.is_empty() => {
                return Err("upsert strategy requires a non-empty `key`".to_string());
            }
            "upsert" => WriteStrategy::Upsert { key: file.key },
            other => return Err(format!("unknown write strategy '{other}'")),
        };
        Ok(Self {
            schema: file.schema,
            table: file.table,
            strategy,
        })
    }
}

impl From<LoadTarget> for LoadTargetFile {
    fn from(target: LoadTarget) -> Self {
        let strategy = target.strategy.name().to_string();
        let key = match target.strategy {
            WriteStrategy::Upsert { key } => key,
            _ => Vec::new(),
        };
        Self {
            schema: target.schema,
            table: target.table,
            strategy,
            key,
        }
    }
}

/// Outcome of one load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub strategy: &'static str,
    pub attempted: usize,
    pub written: usize,
    pub failed: usize,
}

/// Writes mapped rows into Postgres (or SQLite in tests).
pub struct Loader {
    db: Arc<DatabaseConnection>,
    batch_size: usize,
    reporter: Arc<ErrorReporter>,
}

impl Loader {
    pub fn new(db: Arc<DatabaseConnection>, batch_size: usize, reporter: Arc<ErrorReporter>) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
            reporter,
        }
    }

    /// Load `rows` into `target` according to its strategy.
    ///
    /// Replace failures are returned; row-wise failures are reported and counted.
    #[instrument(skip(self, mapping, rows), fields(table = %target.table, strategy = target.strategy.name(), rows = rows.len()))]
    pub async fn load(
        &self,
        job_id: &str,
        target: &LoadTarget,
        mapping: &Mapping,
        rows: &[MappedRow],
    ) -> Result<LoadReport, SyncError> {
        let types = column_types(self.db.as_ref(), &target.schema, &target.table)
            .await
            .map_err(|err| SyncError::database("failed to read target column types", None, err))?;

        let report = match &target.strategy {
            WriteStrategy::Replace => self.replace_all(target, mapping, rows, &types).await?,
            strategy => {
                let sql = row_sql(
                    self.db.get_database_backend(),
                    target,
                    &mapping.columns,
                    strategy,
                    &types,
                );
                self.write_rows(job_id, target, mapping, rows, &sql).await
            }
        };

        counter!("sync_rows_written_total", "strategy" => report.strategy)
            .increment(report.written as u64);
        if report.failed > 0 {
            counter!("sync_rows_failed_total", "strategy" => report.strategy)
                .increment(report.failed as u64);
        }
        info!(
            written = report.written,
            failed = report.failed,
            "Loaded rows into {}.{}",
            target.schema,
            target.table
        );

        Ok(report)
    }

    async fn replace_all(
        &self,
        target: &LoadTarget,
        mapping: &Mapping,
        rows: &[MappedRow],
        types: &HashMap<String, ColumnType>,
    ) -> Result<LoadReport, SyncError> {
        let backend = self.db.get_database_backend();
        let table = qualified_table(&target.schema, &target.table);
        let chunk_size = self.chunk_size(backend, mapping.columns.len());

        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| SyncError::database("failed to begin replace transaction", None, err))?;

        let clear_sql = match backend {
            DatabaseBackend::Postgres => format!("TRUNCATE TABLE {table}"),
            _ => format!("DELETE FROM {table}"),
        };
        txn.execute(Statement::from_string(backend, clear_sql.clone()))
            .await
            .map_err(|err| SyncError::database("failed to clear target table", Some(clear_sql), err))?;

        for chunk in rows.chunks(chunk_size) {
            let sql = insert_sql(backend, &table, &mapping.columns, chunk.len(), types);
            let values: Vec<DbValue> = chunk
                .iter()
                .flat_map(|row| row.iter().map(|value| to_db_value(backend, value)))
                .collect();
            debug!(rows = chunk.len(), "Inserting replace batch");
            txn.execute(Statement::from_sql_and_values(backend, &sql, values))
                .await
                .map_err(|err| SyncError::database("replace batch insert failed", Some(sql), err))?;
        }

        txn.commit()
            .await
            .map_err(|err| SyncError::database("failed to commit replace transaction", None, err))?;

        Ok(LoadReport {
            strategy: WriteStrategy::Replace.name(),
            attempted: rows.len(),
            written: rows.len(),
            failed: 0,
        })
    }

    async fn write_rows(
        &self,
        job_id: &str,
        target: &LoadTarget,
        mapping: &Mapping,
        rows: &[MappedRow],
        sql: &str,
    ) -> LoadReport {
        let backend = self.db.get_database_backend();
        let key_positions: Vec<usize> = match &target.strategy {
            WriteStrategy::Upsert { key } => key.iter().filter_map(|k| mapping.position(k)).collect(),
            _ => Vec::new(),
        };

        let mut written = 0;
        let mut failed = 0;

        for row in rows {
            let values: Vec<DbValue> = row.iter().map(|value| to_db_value(backend, value)).collect();
            match self
                .db
                .execute(Statement::from_sql_and_values(backend, sql, values))
                .await
            {
                Ok(_) => written += 1,
                Err(err) => {
                    failed += 1;
                    let mut ctx = ErrorContext::for_job(job_id)
                        .with_table(&target.schema, &target.table)
                        .with_row(Value::Object(to_object(mapping, row)));
                    if !key_positions.is_empty() {
                        let key: Vec<Value> =
                            key_positions.iter().map(|&i| row[i].clone()).collect();
                        ctx = ctx.with_primary_key(Value::Array(key));
                    }
                    let err = SyncError::database("row write failed", Some(sql.to_string()), err);
                    self.reporter.report_error("Row write failed", &err, ctx);
                }
            }
        }

        if failed > 0 {
            warn!(written, failed, "Row-wise load finished with failures");
        }

        LoadReport {
            strategy: target.strategy.name(),
            attempted: rows.len(),
            written,
            failed,
        }
    }

    /// Rows per multi-row insert, bounded by the backend's parameter limit.
    fn chunk_size(&self, backend: DatabaseBackend, columns: usize) -> usize {
        let max_params = match backend {
            DatabaseBackend::Postgres => POSTGRES_MAX_PARAMS,
            _ => SQLITE_MAX_PARAMS,
        };
        self.batch_size.min(max_params / columns.max(1)).max(1)
    }
}

/// Multi-row `INSERT` with `rows` value tuples.
fn insert_sql(
    backend: DatabaseBackend,
    table: &str,
    columns: &[String],
    rows: usize,
    types: &HashMap<String, ColumnType>,
) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut index = 0;
    let tuples = (0..rows)
        .map(|_| {
            let params = columns
                .iter()
                .map(|column| {
                    index += 1;
                    typed_placeholder(backend, index, types.get(column))
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({params})")
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!("INSERT INTO {table} ({column_list}) VALUES {tuples}")
}

/// Single-row statement for the insert and upsert strategies.
fn row_sql(
    backend: DatabaseBackend,
    target: &LoadTarget,
    columns: &[String],
    strategy: &WriteStrategy,
    types: &HashMap<String, ColumnType>,
) -> String {
    let table = qualified_table(&target.schema, &target.table);
    let insert = insert_sql(backend, &table, columns, 1, types);

    let WriteStrategy::Upsert { key } = strategy else {
        return insert;
    };

    let conflict = key
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key.contains(*c))
        .map(|c| format!("{col} = excluded.{col}", col = quote_ident(c)))
        .collect();

    if updates.is_empty() {
        format!("{insert} ON CONFLICT ({conflict}) DO NOTHING")
    } else {
        format!(
            "{insert} ON CONFLICT ({conflict}) DO UPDATE SET {}",
            updates.join(", ")
        )
    }
}
