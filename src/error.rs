//! # Error Handling
//!
//! Every layer below the job runner returns a typed error. The runner and the
//! scheduler are the only places that catch and log; they do it by turning a
//! [`SyncError`] into an [`ErrorContext`] for the error reporter.

use std::error::Error as _;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;
use crate::job_state::StateError;
use crate::jobs::DefinitionError;
use crate::odata::ODataError;

/// Engine-level error.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    OData(#[from] ODataError),

    #[error("{context}: {source}")]
    Database {
        context: String,
        sql: Option<String>,
        #[source]
        source: sea_orm::DbErr,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Wrap a database error with the statement that produced it.
    pub fn database(
        context: impl Into<String>,
        sql: Option<String>,
        source: sea_orm::DbErr,
    ) -> Self {
        SyncError::Database {
            context: context.into(),
            sql,
            source,
        }
    }

    /// Diagnostic fields carried by this error.
    pub fn context(&self) -> ErrorContext {
        match self {
            SyncError::OData(err) => ErrorContext {
                http_status: err.status(),
                url: err.url().map(str::to_string),
                response_body: err.body().map(str::to_string),
                ..ErrorContext::default()
            },
            SyncError::Database { sql, .. } => ErrorContext {
                sql: sql.clone(),
                ..ErrorContext::default()
            },
            _ => ErrorContext::default(),
        }
    }

    /// Full `source()` chain, outermost first, one cause per line.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

/// Named diagnostic fields attached to an error when it is reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_snapshot: Option<Value>,
}

impl ErrorContext {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self.table = Some(table.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn with_primary_key(mut self, key: Value) -> Self {
        self.primary_key = Some(key);
        self
    }

    pub fn with_row(mut self, row: Value) -> Self {
        self.row_snapshot = Some(row);
        self
    }

    /// Fill unset fields from `other`; fields already set here win.
    pub fn merge(mut self, other: ErrorContext) -> Self {
        self.job_id = self.job_id.or(other.job_id);
        self.http_status = self.http_status.or(other.http_status);
        self.url = self.url.or(other.url);
        self.response_body = self.response_body.or(other.response_body);
        self.schema = self.schema.or(other.schema);
        self.table = self.table.or(other.table);
        self.sql = self.sql.or(other.sql);
        self.primary_key = self.primary_key.or(other.primary_key);
        self.row_snapshot = self.row_snapshot.or(other.row_snapshot);
        self
    }
}
