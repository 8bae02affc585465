//! Rate-limited page fetching.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info_span, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            min_request_interval: Duration::from_secs(1),
        }
    }
}

/// Leaky bucket of one: remembers when the previous request went out and
/// sleeps out whatever is left of `min_interval` before letting the next one
/// through.
#[derive(Debug)]
pub struct RequestSpacing {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestSpacing {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    spacing: RequestSpacing,
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
            spacing: RequestSpacing::new(config.min_request_interval),
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        self.spacing.wait_turn().await;

        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "page fetched");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

/// Source of raw listing markup. Failures are logged by the implementation
/// and surface as `None`.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Option<String>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Option<String> {
        match self.fetch_text(url).await {
            Ok(body) => Some(body),
            Err(err) => {
                error!(url, error = %err, "page fetch failed");
                None
            }
        }
    }
}
