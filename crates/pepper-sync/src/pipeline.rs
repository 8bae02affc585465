//! Fetch, parse and upsert one listing.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use pepper_adapters::{PepperAdapter, SourceAdapter};
use pepper_core::{Clock, SystemClock};
use pepper_storage::{DealStore, HttpClientConfig, HttpFetcher, PageSource, Store};

use crate::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeStatus {
    Completed,
    FetchFailed,
    StoreFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ScrapeStatus,
    pub parsed: usize,
    pub inserted: usize,
    pub updated: usize,
}

pub struct ScrapePipeline {
    source: Arc<dyn PageSource>,
    adapter: Arc<dyn SourceAdapter>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ScrapePipeline {
    pub fn new(
        source: Arc<dyn PageSource>,
        adapter: Arc<dyn SourceAdapter>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            adapter,
            store,
            clock,
        }
    }

    pub fn from_config(config: &SyncConfig, store: Arc<dyn Store>) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            min_request_interval: config.min_request_interval(),
        })?;
        let adapter = PepperAdapter::new(&config.base_url)?;
        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(adapter),
            store,
            Arc::new(SystemClock),
        ))
    }

    /// One scrape pass. Failures are logged and reported in the summary,
    /// never returned.
    pub async fn run_once(&self) -> ScrapeSummary {
        let run_id = Uuid::new_v4();
        let source_id = self.adapter.source_id();
        let span = info_span!("scrape_run", %run_id, source_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> ScrapeSummary {
        let started_at = self.clock.now();
        let mut summary = ScrapeSummary {
            run_id,
            source_id: self.adapter.source_id().to_string(),
            started_at,
            finished_at: started_at,
            status: ScrapeStatus::Completed,
            parsed: 0,
            inserted: 0,
            updated: 0,
        };

        info!(url = self.adapter.listing_url(), "scrape started");
        let Some(markup) = self.source.fetch_page(self.adapter.listing_url()).await else {
            error!("listing fetch failed; nothing stored");
            summary.status = ScrapeStatus::FetchFailed;
            summary.finished_at = self.clock.now();
            return summary;
        };

        let drafts = self.adapter.parse_listing(&markup);
        summary.parsed = drafts.len();
        info!(parsed = drafts.len(), "listing parsed");

        match self.store.upsert_deals(&drafts).await {
            Ok(counts) => {
                summary.inserted = counts.inserted;
                summary.updated = counts.updated;
                info!(inserted = counts.inserted, updated = counts.updated, "deals stored");
            }
            Err(err) => {
                error!(error = %err, "storing deals failed; batch rolled back");
                summary.status = ScrapeStatus::StoreFailed;
            }
        }
        summary.finished_at = self.clock.now();
        summary
    }
}
