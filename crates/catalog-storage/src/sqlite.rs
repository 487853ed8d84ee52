use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row as SqlxRow, TypeInfo, ValueRef};

use crate::relational::{QueryResponse, RelationalStore, Row};
use crate::StorageError;

/// Embedded SQLite running the same statements as the remote store.
///
/// A single pooled connection keeps `sqlite::memory:` databases alive for the
/// lifetime of the store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:").await
    }
}

#[async_trait]
impl RelationalStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResponse, StorageError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }
        match query.fetch_all(&self.pool).await {
            Ok(rows) => {
                let rows = rows
                    .iter()
                    .map(row_to_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(QueryResponse::ok(rows))
            }
            // Statement-level failures are reported the way D1 reports them.
            Err(sqlx::Error::Database(err)) => Ok(QueryResponse {
                success: false,
                rows: Vec::new(),
                errors: vec![err.message().to_string()],
            }),
            Err(err) => Err(err.into()),
        }
    }
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn row_to_json(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let kind = {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_ascii_uppercase())
            }
        };
        let value = match kind.as_deref() {
            None | Some("NULL") => Value::Null,
            Some("INTEGER") | Some("BOOLEAN") => Value::from(row.try_get::<i64, _>(idx)?),
            Some("REAL") => serde_json::Number::from_f64(row.try_get::<f64, _>(idx)?)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Some("BLOB") => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(idx)?)),
            Some(_) => Value::String(row.try_get::<String, _>(idx)?),
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
