//! # Outbox Reader
//!
//! Reads pending rows from a push job's source table and records the outcome
//! of each send. A row only leaves `pending` once: both updates are guarded by
//! the current status.

use std::sync::Arc;

use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, Statement, Value as DbValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{key_text, placeholder, qualified_table, quote_ident, quote_literal};
use crate::error::SyncError;
use crate::logging::clip;

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SENT: &str = "sent";
pub const STATUS_ERROR: &str = "error";

/// Fields per `jsonb_build_object` call, keeping well under the 100-argument limit.
const JSON_OBJECT_CHUNK: usize = 50;
const MAX_ERROR_TEXT: usize = 2_000;

/// Where a push job finds its pending rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxQuery {
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    #[serde(default = "default_status_column")]
    pub status_column: String,
    #[serde(default = "default_error_column")]
    pub error_column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at_column: Option<String>,
    /// Text column receiving the serialized OData response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_column: Option<String>,
    /// Extra SQL predicate ANDed with the pending filter.
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_status_column() -> String {
    "sync_status".to_string()
}

fn default_error_column() -> String {
    "sync_error".to_string()
}

impl OutboxQuery {
    fn table_name(&self) -> String {
        qualified_table(&self.schema, &self.table)
    }
}

/// One pending row: its key and the selected fields as a JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub key: Value,
    pub record: Value,
}

pub struct OutboxReader {
    db: Arc<DatabaseConnection>,
}

impl OutboxReader {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Pending rows in deterministic order, each carrying `fields` plus the key column.
    #[instrument(skip(self, fields), fields(table = %query.table))]
    pub async fn read_pending(
        &self,
        query: &OutboxQuery,
        fields: &[String],
        default_limit: u64,
    ) -> Result<Vec<OutboxRow>, SyncError> {
        let backend = self.db.get_database_backend();

        let mut selected: Vec<&str> = fields.iter().map(String::as_str).collect();
        if !selected.contains(&query.key_column.as_str()) {
            selected.push(&query.key_column);
        }

        let order_by = query
            .order_by
            .clone()
            .unwrap_or_else(|| quote_ident(&query.key_column));
        let limit = query.limit.unwrap_or(default_limit).max(1);

        let mut sql = format!(
            "SELECT {} AS record FROM {} WHERE {} = {}",
            json_record_expr(backend, &selected),
            query.table_name(),
            quote_ident(&query.status_column),
            placeholder(backend, 1),
        );
        if let Some(filter) = query.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            sql.push_str(&format!(" AND ({filter})"));
        }
        sql.push_str(&format!(" ORDER BY {order_by} LIMIT {limit}"));

        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                backend,
                &sql,
                vec![STATUS_PENDING.into()],
            ))
            .await
            .map_err(|err| SyncError::database("failed to read pending rows", Some(sql.clone()), err))?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row
                .try_get("", "record")
                .map_err(|err| SyncError::database("failed to read outbox record", Some(sql.clone()), err))?;
            let record: Value = serde_json::from_str(&text).map_err(|err| {
                SyncError::database(
                    "outbox record is not valid JSON",
                    Some(sql.clone()),
                    DbErr::Json(err.to_string()),
                )
            })?;
            let key = record.get(&query.key_column).cloned().unwrap_or(Value::Null);
            pending.push(OutboxRow { key, record });
        }

        debug!(rows = pending.len(), "Read pending outbox rows");
        Ok(pending)
    }

    /// Move a pending row to `sent`. Returns false when the row was not pending.
    pub async fn mark_sent(
        &self,
        query: &OutboxQuery,
        key: &Value,
        response: &Value,
    ) -> Result<bool, SyncError> {
        let backend = self.db.get_database_backend();
        let mut sets = vec![
            format!("{} = {}", quote_ident(&query.status_column), placeholder(backend, 1)),
            format!("{} = NULL", quote_ident(&query.error_column)),
        ];
        let mut values: Vec<DbValue> = vec![STATUS_SENT.into()];

        if let Some(column) = &query.sent_at_column {
            sets.push(format!("{} = CURRENT_TIMESTAMP", quote_ident(column)));
        }
        if let Some(column) = &query.response_column {
            values.push(response.to_string().into());
            sets.push(format!(
                "{} = {}",
                quote_ident(column),
                placeholder(backend, values.len())
            ));
        }

        self.transition(query, key, sets, values, "failed to mark row as sent")
            .await
    }

    /// Move a pending row to `error`, storing the clipped message.
    pub async fn mark_error(
        &self,
        query: &OutboxQuery,
        key: &Value,
        message: &str,
    ) -> Result<bool, SyncError> {
        let backend = self.db.get_database_backend();
        let sets = vec![
            format!("{} = {}", quote_ident(&query.status_column), placeholder(backend, 1)),
            format!("{} = {}", quote_ident(&query.error_column), placeholder(backend, 2)),
        ];
        let values: Vec<DbValue> = vec![STATUS_ERROR.into(), clip(message, MAX_ERROR_TEXT).into()];

        self.transition(query, key, sets, values, "failed to mark row as error")
            .await
    }

    async fn transition(
        &self,
        query: &OutboxQuery,
        key: &Value,
        sets: Vec<String>,
        mut values: Vec<DbValue>,
        context: &str,
    ) -> Result<bool, SyncError> {
        let backend = self.db.get_database_backend();

        values.push(key_text(key).into());
        let key_param = placeholder(backend, values.len());
        values.push(STATUS_PENDING.into());
        let status_param = placeholder(backend, values.len());

        let sql = format!(
            "UPDATE {} SET {} WHERE CAST({} AS TEXT) = {} AND {} = {}",
            query.table_name(),
            sets.join(", "),
            quote_ident(&query.key_column),
            key_param,
            quote_ident(&query.status_column),
            status_param,
        );

        let result = self
            .db
            .execute(Statement::from_sql_and_values(backend, &sql, values))
            .await
            .map_err(|err| SyncError::database(context, Some(sql), err))?;

        Ok(result.rows_affected() == 1)
    }
}

/// Expression turning the selected columns into one JSON text value.
fn json_record_expr(backend: DatabaseBackend, columns: &[&str]) -> String {
    let chunks: Vec<String> = columns
        .chunks(JSON_OBJECT_CHUNK)
        .map(|chunk| {
            let args = chunk
                .iter()
                .map(|c| format!("{}, {}", quote_literal(c), quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ");
            match backend {
                DatabaseBackend::Postgres => format!("jsonb_build_object({args})"),
                _ => format!("json_object({args})"),
            }
        })
        .collect();

    match backend {
        DatabaseBackend::Postgres => format!("({})::text", chunks.join(" || ")),
        _ => chunks
            .into_iter()
            .reduce(|acc, next| format!("json_patch({acc}, {next})"))
            .unwrap_or_else(|| "json_object()".to_string()),
    }
}
