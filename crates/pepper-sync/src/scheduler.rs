//! Two periodic jobs, each capped at one run in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{DispatchSummary, Dispatcher, ScrapePipeline, ScrapeSummary, SyncConfig};

/// Non-reentrancy flag. A held gate makes overlapping attempts bail out
/// instead of queueing.
#[derive(Debug, Default)]
pub struct JobGate {
    busy: AtomicBool,
}

pub struct GateGuard<'a> {
    gate: &'a JobGate,
}

impl JobGate {
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub enum ScrapeOutcome {
    Skipped,
    Completed(ScrapeSummary),
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Skipped,
    Completed(DispatchSummary),
    Failed(String),
}

pub struct PipelineScheduler {
    pipeline: Arc<ScrapePipeline>,
    dispatcher: Option<Arc<Dispatcher>>,
    scrape_interval: Duration,
    dispatch_interval: Duration,
    dispatch_backoff: Duration,
    scrape_gate: JobGate,
    dispatch_gate: JobGate,
    last_run: RwLock<Option<ScrapeSummary>>,
    running: Mutex<Option<JobScheduler>>,
}

impl PipelineScheduler {
    pub fn new(
        config: &SyncConfig,
        pipeline: Arc<ScrapePipeline>,
        dispatcher: Option<Arc<Dispatcher>>,
    ) -> Self {
        Self {
            pipeline,
            dispatcher,
            scrape_interval: config.scrape_interval(),
            dispatch_interval: config.dispatch_interval(),
            dispatch_backoff: config.dispatch_backoff(),
            scrape_gate: JobGate::default(),
            dispatch_gate: JobGate::default(),
            last_run: RwLock::new(None),
            running: Mutex::new(None),
        }
    }

    /// Run the scrape pipeline now unless a run is already in flight.
    pub async fn trigger_scrape(&self) -> ScrapeOutcome {
        let Some(_guard) = self.scrape_gate.try_acquire() else {
            info!("scrape already running; skipping");
            return ScrapeOutcome::Skipped;
        };
        let summary = self.pipeline.run_once().await;
        *self.last_run.write().await = Some(summary.clone());
        ScrapeOutcome::Completed(summary)
    }

    /// One dispatch pass. A failed pass keeps the gate for the backoff
    /// period so the next tick is skipped rather than retried immediately.
    pub async fn run_dispatch(&self) -> DispatchOutcome {
        let Some(dispatcher) = &self.dispatcher else {
            return DispatchOutcome::Skipped;
        };
        let Some(_guard) = self.dispatch_gate.try_acquire() else {
            info!("dispatch already running; skipping");
            return DispatchOutcome::Skipped;
        };
        match dispatcher.run_pass().await {
            Ok(summary) => DispatchOutcome::Completed(summary),
            Err(err) => {
                error!(
                    error = ?err,
                    backoff_secs = self.dispatch_backoff.as_secs(),
                    "dispatch pass failed"
                );
                tokio::time::sleep(self.dispatch_backoff).await;
                DispatchOutcome::Failed(format!("{err:#}"))
            }
        }
    }

    pub fn scrape_in_flight(&self) -> bool {
        self.scrape_gate.is_busy()
    }

    pub async fn last_run(&self) -> Option<ScrapeSummary> {
        self.last_run.read().await.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Register the periodic jobs and start ticking. The dispatch job only
    /// exists when a dispatcher was supplied.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("scheduler already started");
            return Ok(());
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let this = Arc::clone(self);
        let scrape_job = Job::new_repeated_async(self.scrape_interval, move |_uuid, _l| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.trigger_scrape().await;
            })
        })
        .context("creating scrape job")?;
        sched.add(scrape_job).await.context("adding scrape job")?;

        if self.dispatcher.is_some() {
            let this = Arc::clone(self);
            let dispatch_job = Job::new_repeated_async(self.dispatch_interval, move |_uuid, _l| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.run_dispatch().await;
                })
            })
            .context("creating dispatch job")?;
            sched.add(dispatch_job).await.context("adding dispatch job")?;
        } else {
            info!("no notifier configured; dispatch job not registered");
        }

        sched.start().await.context("starting scheduler")?;
        info!(
            scrape_interval_secs = self.scrape_interval.as_secs(),
            dispatch_interval_secs = self.dispatch_interval.as_secs(),
            "scheduler started"
        );
        *running = Some(sched);
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(mut sched) = self.running.lock().await.take() {
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::{OfflineStore, RecordingNotifier};
    use crate::pipeline::tests::{pipeline, LISTING};
    use crate::ScrapeStatus;
    use pepper_core::SystemClock;
    use pepper_storage::MemoryStore;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::from_lookup(|_| None);
        config.dispatch_backoff_secs = 0;
        config
    }

    #[test]
    fn gate_releases_on_drop() {
        let gate = JobGate::default();
        let guard = gate.try_acquire().expect("first");
        assert!(gate.try_acquire().is_none());
        drop(guard);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let slow = Arc::new(pipeline(store, Some(LISTING), Duration::from_millis(150)));
        let scheduler = PipelineScheduler::new(&config(), slow, None);

        let (a, b) = tokio::join!(scheduler.trigger_scrape(), scheduler.trigger_scrape());
        let outcomes = [a, b];
        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, ScrapeOutcome::Completed(_)))
            .count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, ScrapeOutcome::Skipped))
            .count();
        assert_eq!((completed, skipped), (1, 1));

        let last = scheduler.last_run().await.expect("last run");
        assert_eq!(last.status, ScrapeStatus::Completed);
        assert_eq!(last.inserted, 2);
        assert!(!scheduler.scrape_in_flight());
    }

    #[tokio::test]
    async fn dispatch_without_notifier_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let scheduler =
            PipelineScheduler::new(&config(), Arc::new(pipeline(store, None, Duration::ZERO)), None);
        assert!(matches!(scheduler.run_dispatch().await, DispatchOutcome::Skipped));
    }

    #[tokio::test]
    async fn dispatch_runs_through_the_gate() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(SystemClock),
            Arc::new(RecordingNotifier::default()),
        ));
        let scheduler = PipelineScheduler::new(
            &config(),
            Arc::new(pipeline(store, None, Duration::ZERO)),
            Some(dispatcher),
        );
        match scheduler.run_dispatch().await {
            DispatchOutcome::Completed(summary) => assert_eq!(summary.created, 0),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_dispatch_holds_the_gate_for_the_backoff() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(OfflineStore),
            Arc::new(SystemClock),
            Arc::new(RecordingNotifier::default()),
        ));
        let mut scheduler = PipelineScheduler::new(
            &config(),
            Arc::new(pipeline(store, None, Duration::ZERO)),
            Some(dispatcher),
        );
        scheduler.dispatch_backoff = Duration::from_millis(200);
        let scheduler = Arc::new(scheduler);

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.run_dispatch().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(scheduler.run_dispatch().await, DispatchOutcome::Skipped));

        match first.await.expect("join") {
            DispatchOutcome::Failed(reason) => assert!(reason.contains("database unavailable")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(scheduler.run_dispatch().await, DispatchOutcome::Failed(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_and_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(PipelineScheduler::new(
            &config(),
            Arc::new(pipeline(store, None, Duration::ZERO)),
            None,
        ));
        scheduler.start().await.expect("start");
        assert!(scheduler.is_running().await);
        scheduler.shutdown().await.expect("shutdown");
        assert!(!scheduler.is_running().await);
    }
}
