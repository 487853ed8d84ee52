use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{HttpFetcher, StorageError};

/// One result row, keyed by column name.
pub type Row = Map<String, Value>;

const D1_API: &str = "cloudflare-d1";

/// The outcome of a single statement as the store reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub success: bool,
    pub rows: Vec<Row>,
    pub errors: Vec<String>,
}

impl QueryResponse {
    pub fn ok(rows: Vec<Row>) -> Self {
        Self {
            success: true,
            rows,
            errors: Vec::new(),
        }
    }

    pub fn into_rows(self) -> Result<Vec<Row>, StorageError> {
        if self.success {
            Ok(self.rows)
        } else if self.errors.is_empty() {
            Err(StorageError::Rejected("no error detail reported".to_string()))
        } else {
            Err(StorageError::Rejected(self.errors.join("; ")))
        }
    }
}

/// A SQL store that takes one parameterized statement at a time.
///
/// Statements use `?` placeholders and SQLite dialect, which both the remote
/// D1 database and the embedded SQLite backend accept.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResponse, StorageError>;

    async fn query_rows(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        self.query(sql, params).await?.into_rows()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<(), StorageError> {
        self.query(sql, params).await?.into_rows().map(|_| ())
    }
}

/// Cloudflare D1 over its HTTP query endpoint.
#[derive(Debug, Clone)]
pub struct D1Store {
    http: Arc<HttpFetcher>,
    endpoint: String,
    api_token: String,
}

impl D1Store {
    pub fn new(
        http: Arc<HttpFetcher>,
        api_base: &str,
        account_id: &str,
        database_id: &str,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: d1_query_endpoint(api_base, account_id, database_id),
            api_token: api_token.into(),
        }
    }
}

pub fn d1_query_endpoint(api_base: &str, account_id: &str, database_id: &str) -> String {
    format!(
        "{}/accounts/{account_id}/d1/database/{database_id}/query",
        api_base.trim_end_matches('/')
    )
}

#[async_trait]
impl RelationalStore for D1Store {
    fn backend(&self) -> &'static str {
        "d1"
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResponse, StorageError> {
        let payload = serde_json::to_vec(&json!({ "sql": sql, "params": params }))?;
        let response = self
            .http
            .send(D1_API, &self.endpoint, |client| {
                client
                    .post(&self.endpoint)
                    .bearer_auth(&self.api_token)
                    .header(CONTENT_TYPE, "application/json")
                    .body(payload.clone())
            })
            .await?;
        parse_d1_response(&response.body)
    }
}

#[derive(Debug, Deserialize)]
struct D1Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<D1Message>,
    #[serde(default)]
    result: Vec<D1StatementResult>,
}

#[derive(Debug, Deserialize)]
struct D1Message {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct D1StatementResult {
    #[serde(default)]
    results: Vec<Row>,
    #[serde(default = "statement_succeeded")]
    success: bool,
}

fn statement_succeeded() -> bool {
    true
}

pub fn parse_d1_response(body: &[u8]) -> Result<QueryResponse, StorageError> {
    let envelope: D1Envelope = serde_json::from_slice(body)?;
    let success = envelope.success && envelope.result.iter().all(|r| r.success);
    let rows = envelope
        .result
        .into_iter()
        .flat_map(|statement| statement.results)
        .collect();
    let errors = envelope
        .errors
        .into_iter()
        .map(|e| match e.code {
            Some(code) => format!("{code}: {}", e.message),
            None => e.message,
        })
        .collect();
    Ok(QueryResponse {
        success,
        rows,
        errors,
    })
}

/// Text value of a column. Numbers are rendered, blank strings count as absent.
pub fn row_text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn row_f64(row: &Row, column: &str) -> Option<f64> {
    match row.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
