//! Crawl batch orchestration: job bookkeeping, per-candidate isolation,
//! pacing between writes, and the settings the CLI assembles components
//! from.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use unirank_core::{JobCounters, JobStatus, JobSummary, ReconcileOutcome};
use unirank_feed::CandidateSource;
use unirank_fetch::{RetryPolicy, TransportConfig};
use unirank_reconcile::{FillPolicy, ReconcileEngine};
use unirank_store::RecordStore;
use uuid::Uuid;

/// Application-level pacing between candidate writes, independent of the
/// transport's inter-request gate. Randomized inside `[min, max]` so
/// repeated batches do not write on a fixed cadence.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1000),
            max: Duration::from_millis(2000),
        }
    }
}

impl Pacing {
    /// No delay at all; tests and dry runs.
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    fn delay(&self) -> Duration {
        let span = self.max.saturating_sub(self.min);
        self.min + span.mul_f64(jitter_unit())
    }
}

/// Jitter factor in [0, 1) from timestamp entropy. Enough to spread writes;
/// nothing here needs a real RNG.
fn jitter_unit() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// One crawl batch: pulls candidates from a source, reconciles each, and
/// records the run in the job table.
///
/// The job record is best-effort bookkeeping: a store that refuses the job
/// row does not stop the batch.
pub struct CrawlJob {
    store: Arc<dyn RecordStore>,
    engine: ReconcileEngine,
    name: String,
    policy: FillPolicy,
    pacing: Pacing,
    limit: Option<usize>,
    metadata: Value,
}

impl CrawlJob {
    pub fn new(store: Arc<dyn RecordStore>, name: impl Into<String>) -> Self {
        let engine = ReconcileEngine::new(store.clone());
        Self {
            store,
            engine,
            name: name.into(),
            policy: FillPolicy::IfEmpty,
            pacing: Pacing::default(),
            limit: None,
            metadata: json!({}),
        }
    }

    /// Free-form metadata recorded on the job row.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_policy(mut self, policy: FillPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Stop after this many candidates, leaving the rest of the source
    /// unconsumed.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Run one batch to completion. Per-candidate failures are counted and
    /// the batch continues; a failure in candidate production marks the job
    /// failed and aborts.
    pub async fn run(&self, source: &mut dyn CandidateSource) -> Result<JobSummary> {
        let job_id = match self.store.create_job(&self.name, self.metadata.clone()).await {
            Ok(id) => {
                info!(%id, job = %self.name, "created crawl job");
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, job = %self.name, "job record creation failed, continuing");
                None
            }
        };

        let mut summary = JobSummary::default();
        loop {
            if let Some(limit) = self.limit {
                if summary.processed as usize >= limit {
                    debug!(limit, "candidate limit reached");
                    break;
                }
            }

            let candidate = match source.next_candidate().await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => break,
                Err(err) => {
                    error!(error = ?err, job = %self.name, "candidate production failed");
                    self.finish(job_id, JobStatus::Failed, &summary).await;
                    return Err(err.context("candidate production failed"));
                }
            };

            summary.processed += 1;
            match self.engine.reconcile(&candidate, self.policy).await {
                Ok(ReconcileOutcome::Inserted(id)) => {
                    summary.inserted += 1;
                    info!(%id, name = %candidate.name, "inserted");
                }
                Ok(ReconcileOutcome::Enriched(id)) => {
                    summary.enriched += 1;
                    info!(%id, name = %candidate.name, "enriched");
                }
                Ok(ReconcileOutcome::Skipped(id)) => {
                    summary.skipped += 1;
                    debug!(?id, name = %candidate.name, "skipped");
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(error = %err, name = %candidate.name, "reconcile failed");
                }
            }

            let delay = self.pacing.delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        self.finish(job_id, JobStatus::Completed, &summary).await;
        info!(
            processed = summary.processed,
            inserted = summary.inserted,
            enriched = summary.enriched,
            skipped = summary.skipped,
            failed = summary.failed,
            job = %self.name,
            "batch finished"
        );
        Ok(summary)
    }

    async fn finish(&self, job_id: Option<Uuid>, status: JobStatus, summary: &JobSummary) {
        let Some(id) = job_id else {
            return;
        };
        let counters = JobCounters {
            total_items: summary.processed,
            successful_items: summary.inserted + summary.enriched,
            failed_items: summary.failed,
        };
        if let Err(err) = self.store.update_job(id, status, counters).await {
            warn!(error = %err, %id, "job record update failed");
        }
    }
}

/// Runtime configuration from the environment, with the conservative
/// defaults the upstream source tolerates.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_url: String,
    pub store_key: String,
    pub user_agent: String,
    pub min_interval: Duration,
    pub timeout: Duration,
    pub max_retries: usize,
    pub pacing: Pacing,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            store_url: std::env::var("UNIRANK_STORE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            store_key: std::env::var("UNIRANK_STORE_KEY").unwrap_or_default(),
            user_agent: std::env::var("UNIRANK_USER_AGENT")
                .unwrap_or_else(|_| "unirank-bot/0.1".to_string()),
            min_interval: env_secs("UNIRANK_MIN_INTERVAL_SECS", 5),
            timeout: env_secs("UNIRANK_HTTP_TIMEOUT_SECS", 60),
            max_retries: std::env::var("UNIRANK_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            pacing: Pacing::default(),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            min_interval: self.min_interval,
            timeout: self.timeout,
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            },
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
