use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request limiter closed")]
    Closed,
}

/// Exponential backoff between attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub retries: usize,
    pub initial: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Pause before retry number `retry` (zero based).
    pub fn delay(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.initial.saturating_mul(1 << shift).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Per-request ceiling; a stalled model call must not hold a job forever.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across every job sharing the client.
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("fsx/{}", env!("CARGO_PKG_VERSION"))),
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Rate limiting and server-side failures are worth another attempt.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// JSON POST client shared by every job. A semaphore bounds concurrent calls to the
/// external service; transient failures are retried with backoff.
#[derive(Debug)]
pub struct JsonHttpClient {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl JsonHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn post_json(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &Value,
    ) -> Result<Value, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut retry = 0;
        loop {
            let outcome = self
                .attempt(url, bearer_token, body)
                .instrument(info_span!("http_post", url, retry))
                .await;
            match outcome {
                Err(Attempt::Transient(err)) if retry < self.backoff.retries => {
                    debug!(error = %err, retry, "transient failure; backing off");
                    tokio::time::sleep(self.backoff.delay(retry)).await;
                    retry += 1;
                }
                Err(Attempt::Transient(err)) | Err(Attempt::Fatal(err)) => return Err(err),
                Ok(value) => return Ok(value),
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &Value,
    ) -> Result<Value, Attempt> {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|err| {
            if is_transient_error(&err) {
                Attempt::Transient(err.into())
            } else {
                Attempt::Fatal(err.into())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|err| Attempt::Fatal(err.into()));
        }
        let error = FetchError::HttpStatus {
            status: status.as_u16(),
            url: response.url().to_string(),
            body: response.text().await.unwrap_or_default(),
        };
        Err(if is_transient_status(status) {
            Attempt::Transient(error)
        } else {
            Attempt::Fatal(error)
        })
    }
}

enum Attempt {
    Transient(FetchError),
    Fatal(FetchError),
}
