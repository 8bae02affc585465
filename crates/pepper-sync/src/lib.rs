//! Scrape pipeline, notification dispatch and the periodic scheduler.

use std::time::Duration;

use pepper_adapters::pepper::DEFAULT_BASE_URL;

pub mod dispatch;
pub mod pipeline;
pub mod scheduler;

pub use dispatch::{DispatchSummary, Dispatcher, Notifier};
pub use pipeline::{ScrapePipeline, ScrapeStatus, ScrapeSummary};
pub use scheduler::{DispatchOutcome, JobGate, PipelineScheduler, ScrapeOutcome};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_request_interval_ms: u64,
    pub scheduler_enabled: bool,
    pub scrape_interval_secs: u64,
    pub dispatch_interval_secs: u64,
    pub dispatch_backoff_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            base_url: lookup("PEPPER_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            user_agent: lookup("PEPPER_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("PEPPER_HTTP_TIMEOUT_SECS", 30),
            min_request_interval_ms: number("PEPPER_MIN_REQUEST_INTERVAL_MS", 1000),
            scheduler_enabled: lookup("PEPPER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            scrape_interval_secs: number("PEPPER_SCRAPE_INTERVAL_SECS", 30 * 60),
            dispatch_interval_secs: number("PEPPER_DISPATCH_INTERVAL_SECS", 5 * 60),
            dispatch_backoff_secs: number("PEPPER_DISPATCH_BACKOFF_SECS", 60),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs.max(1))
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs.max(1))
    }

    pub fn dispatch_backoff(&self) -> Duration {
        Duration::from_secs(self.dispatch_backoff_secs)
    }
}
