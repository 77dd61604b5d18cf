//! # Repository Layer
//!
//! Raw-SQL access to job target tables. Tables are only known at runtime (from
//! job definitions), so statements are assembled here with quoted identifiers
//! and bound values rather than through SeaORM entities.

pub mod loader;
pub mod outbox;

pub use loader::{LoadReport, LoadTarget, Loader, WriteStrategy};
pub use outbox::{OutboxQuery, OutboxReader, OutboxRow};

use std::collections::HashMap;

use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr, Statement, Value as DbValue};
use serde_json::Value;

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Positional placeholder for the 1-based parameter `index`.
pub fn placeholder(backend: DatabaseBackend, index: usize) -> String {
    match backend {
        DatabaseBackend::Postgres => format!("${index}"),
        _ => "?".to_string(),
    }
}

/// Placeholder wrapped in a cast to the column type when one is known.
pub fn typed_placeholder(backend: DatabaseBackend, index: usize, ty: Option<&ColumnType>) -> String {
    let param = placeholder(backend, index);
    match ty {
        Some(ty) if backend == DatabaseBackend::Postgres => {
            format!("CAST({param} AS {})", ty.sql_name())
        }
        _ => param,
    }
}

/// A column's type as reported by `information_schema.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    pub udt_schema: String,
    pub udt_name: String,
}

impl ColumnType {
    pub fn sql_name(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.udt_schema),
            quote_ident(&self.udt_name)
        )
    }
}

/// Column types for `schema.table`. Empty on backends other than Postgres.
pub async fn column_types<C: ConnectionTrait>(
    db: &C,
    schema: &str,
    table: &str,
) -> Result<HashMap<String, ColumnType>, DbErr> {
    let backend = db.get_database_backend();
    if backend != DatabaseBackend::Postgres {
        return Ok(HashMap::new());
    }

    let rows = db
        .query_all(Statement::from_sql_and_values(
            backend,
            "SELECT column_name, udt_schema, udt_name FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2",
            vec![schema.into(), table.into()],
        ))
        .await?;

    let mut types = HashMap::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("", "column_name")?;
        types.insert(
            name,
            ColumnType {
                udt_schema: row.try_get("", "udt_schema")?,
                udt_name: row.try_get("", "udt_name")?,
            },
        );
    }
    Ok(types)
}

/// Convert a JSON value into a bind parameter.
///
/// Postgres parameters are sent as text and cast server-side to the column
/// type; SQLite receives natively typed values.
pub fn to_db_value(backend: DatabaseBackend, value: &Value) -> DbValue {
    match (backend, value) {
        (_, Value::Null) => DbValue::String(None),
        (_, Value::String(s)) => DbValue::String(Some(Box::new(s.clone()))),
        (DatabaseBackend::Postgres, Value::Bool(b)) => {
            DbValue::String(Some(Box::new(b.to_string())))
        }
        (DatabaseBackend::Postgres, Value::Number(n)) => {
            DbValue::String(Some(Box::new(n.to_string())))
        }
        (_, Value::Bool(b)) => DbValue::Bool(Some(*b)),
        (_, Value::Number(n)) => match n.as_i64() {
            Some(i) => DbValue::BigInt(Some(i)),
            None => DbValue::Double(n.as_f64()),
        },
        (_, other) => DbValue::String(Some(Box::new(other.to_string()))),
    }
}

/// Text form of a key value, as compared against `CAST(key AS TEXT)`.
pub fn key_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified_table("public", "items"), "\"public\".\"items\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn placeholders_depend_on_backend() {
        assert_eq!(placeholder(DatabaseBackend::Postgres, 3), "$3");
        assert_eq!(placeholder(DatabaseBackend::Sqlite, 3), "?");

        let ty = ColumnType {
            udt_schema: "pg_catalog".into(),
            udt_name: "int4".into(),
        };
        assert_eq!(
            typed_placeholder(DatabaseBackend::Postgres, 1, Some(&ty)),
            "CAST($1 AS \"pg_catalog\".\"int4\")"
        );
        assert_eq!(typed_placeholder(DatabaseBackend::Sqlite, 1, Some(&ty)), "?");
    }

    #[test]
    fn postgres_values_bind_as_text() {
        assert_eq!(
            to_db_value(DatabaseBackend::Postgres, &json!(42)),
            DbValue::String(Some(Box::new("42".to_string())))
        );
        assert_eq!(
            to_db_value(DatabaseBackend::Sqlite, &json!(42)),
            DbValue::BigInt(Some(42))
        );
        assert_eq!(
            to_db_value(DatabaseBackend::Sqlite, &json!({"a": 1})),
            DbValue::String(Some(Box::new("{\"a\":1}".to_string())))
        );
        assert_eq!(
            to_db_value(DatabaseBackend::Postgres, &Value::Null),
            DbValue::String(None)
        );
    }

    #[test]
    fn key_text_unquotes_strings() {
        assert_eq!(key_text(&json!("A-1")), "A-1");
        assert_eq!(key_text(&json!(17)), "17");
    }
}
