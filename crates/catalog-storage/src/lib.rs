//! HTTP transport, local asset staging and the persistence collaborators.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

pub mod assets;
pub mod local;
pub mod relational;
pub mod sqlite;

pub use assets::{AssetStore, DirectoryAssetStore, R2AssetStore};
pub use local::{sanitize_key_segment, LocalAssetDir, StoredAsset};
pub use relational::{
    parse_d1_response, row_f64, row_text, D1Store, QueryResponse, RelationalStore, Row,
};
pub use sqlite::SqliteStore;

pub const CRATE_NAME: &str = "catalog-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("store rejected statement: {0}")]
    Rejected(String),
    #[error("decoding store response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid asset location: {0}")]
    InvalidLocation(String),
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry policy for transient transport failures. The default makes a single attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum spacing between two calls to the same API.
    pub request_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            request_delay: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Keeps successive calls to one API at least `min_interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_call: Mutex<HashMap<String, Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    /// `last` may lie in the future when a slot is already reserved.
    pub fn remaining_wait(min_interval: Duration, last: Option<Instant>, now: Instant) -> Duration {
        match last {
            Some(last) => (last + min_interval).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Reserve the next slot for `api` under the lock, then sleep without it so
    /// other apis are not held up.
    pub async fn wait_turn(&self, api: &str) {
        if self.min_interval.is_zero() {
            return;
        }
        let wait = {
            let mut last_call = self.last_call.lock().await;
            let now = Instant::now();
            let wait = Self::remaining_wait(self.min_interval, last_call.get(api).copied(), now);
            last_call.insert(api.to_string(), now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {snippet}")]
    HttpStatus {
        status: u16,
        url: String,
        snippet: String,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            pacer: RequestPacer::new(config.request_delay),
            backoff: config.backoff,
        })
    }

    /// GET `url` with query parameters, paced against other calls to `api`.
    pub async fn get(
        &self,
        api: &str,
        url: &str,
        query: &[(&str, String)],
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(api, url, |client| {
            let request = client.get(url).query(query);
            match accept {
                Some(accept) => request.header(ACCEPT, accept),
                None => request,
            }
        })
        .await
    }

    /// Send a request rebuilt by `build` for every attempt. Only 2xx is success.
    pub async fn send<F>(&self, api: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        self.pacer.wait_turn(api).await;
        let span = info_span!("http_fetch", api, url);
        self.send_with_retry(build).instrument(span).await
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0usize;
        loop {
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let snippet = resp
                        .text()
                        .await
                        .map(|text| text.chars().take(200).collect::<String>())
                        .unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        snippet,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn default_backoff_is_a_single_attempt() {
        assert_eq!(BackoffPolicy::default().max_retries, 0);
    }

    #[test]
    fn pacer_waits_only_for_the_remaining_interval() {
        let now = Instant::now();
        let interval = Duration::from_millis(500);
        assert_eq!(RequestPacer::remaining_wait(interval, None, now), Duration::ZERO);
        assert_eq!(
            RequestPacer::remaining_wait(interval, Some(now), now + Duration::from_millis(200)),
            Duration::from_millis(300)
        );
        assert_eq!(
            RequestPacer::remaining_wait(interval, Some(now), now + Duration::from_secs(2)),
            Duration::ZERO
        );
            assert_eq!(
            RequestPacer::remaining_wait(interval, Some(now + Duration::from_millis(300)), now),
            Duration::from_millis(800)
        );
    }

    #[tokio::test]
    async fn a_sleeping_api_does_not_hold_up_another() {
        let pacer = std::sync::Arc::new(RequestPacer::new(Duration::from_millis(300)));
        pacer.wait_turn("items").await;

        let queued = std::sync::Arc::clone(&pacer);
        let second_items = tokio::spawn(async move { queued.wait_turn("items").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        pacer.wait_turn("prices").await;
        assert!(started.elapsed() < Duration::from_millis(150));

        second_items.await.expect("join");
    }

    #[tokio::test]
    async fn queued_calls_to_one_api_stay_spaced() {
        let pacer = std::sync::Arc::new(RequestPacer::new(Duration::from_millis(100)));
        let started = Instant::now();
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let pacer = std::sync::Arc::clone(&pacer);
                tokio::spawn(async move { pacer.wait_turn("items").await })
            })
            .collect();
        for call in calls {
            call.await.expect("join");
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn zero_interval_pacer_never_sleeps() {
        let pacer = RequestPacer::new(Duration::ZERO);
        let started = Instant::now();
        for _ in 0..10 {
            pacer.wait_turn("items").await;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
