//! Per (camera, tier) sweep loop.
//!
//! Each worker owns exactly one tier of one chain for one camera. It wakes on
//! its poll interval or an explicit trigger, asks the policy which files must
//! leave, and hands them to the [`TierHandler`] one at a time. A file moved to
//! the next tier becomes the next tier's worker's business; cascading comes from
//! the workers running independently, not from chaining calls.

use crate::catalog::CatalogError;
use crate::file_ops::FileOutcome;
use crate::handler::{HandleError, TierHandler};
use crate::health::{HealthRegistry, WorkerKey};
use crate::policy::{self, TierSnapshot};
use crate::tier::Tier;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that abort a whole sweep pass
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Catalog error during sweep: {0}")]
    Catalog(#[from] CatalogError),
}

/// Normal passes obey the tier's limits; forced passes empty the tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    Normal,
    Forced,
}

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub selected: usize,
    pub moved: usize,
    pub deleted: usize,
    pub already_gone: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Stopped early because the worker is shutting down
    pub interrupted: bool,
}

/// Wakes one sweeper ahead of its poll interval
#[derive(Clone, Default)]
pub struct SweepTrigger {
    notify: Arc<Notify>,
}

impl SweepTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the worker. A wake with no waiting worker is kept for its next wait.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    async fn woken(&self) {
        self.notify.notified().await;
    }
}

/// Backoff bounds after a failed pass
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Background worker for one (camera, tier)
pub struct TierSweeper {
    key: WorkerKey,
    tier: Tier,
    next: Option<Tier>,
    handler: TierHandler,
    health: HealthRegistry,
    trigger: SweepTrigger,
    next_trigger: Option<SweepTrigger>,
    retry: RetrySettings,
}

impl TierSweeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera_id: impl Into<String>,
        category: impl Into<String>,
        tier: Tier,
        next: Option<Tier>,
        handler: TierHandler,
        health: HealthRegistry,
        trigger: SweepTrigger,
        next_trigger: Option<SweepTrigger>,
    ) -> Self {
        let key = WorkerKey {
            camera_id: camera_id.into(),
            category: category.into(),
            tier: tier.index,
        };

        Self {
            key,
            tier,
            next,
            handler,
            health,
            trigger,
            next_trigger,
            retry: RetrySettings::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn trigger(&self) -> SweepTrigger {
        self.trigger.clone()
    }

    /// Measure the tier, evaluate it, and evict what the policy selected.
    ///
    /// Per-file failures are counted and skipped. A catalog failure aborts the
    /// pass. In [`SweepMode::Normal`] cancellation is checked between files.
    #[instrument(skip(self, cancel), fields(worker = %self.key))]
    pub async fn sweep_pass(
        &self,
        mode: SweepMode,
        cancel: &CancellationToken,
    ) -> Result<SweepReport, SweepError> {
        let files = self
            .handler
            .catalog()
            .list_tier(&self.key.category, Some(&self.key.camera_id), self.tier.index)
            .await?;

        let snapshot = TierSnapshot::new(files);
        let evictions = match mode {
            SweepMode::Normal => policy::evaluate(&self.tier.limits, &snapshot, Utc::now()),
            SweepMode::Forced => policy::evaluate_forced(&snapshot),
        };

        let mut report = SweepReport {
            evaluated: snapshot.files().len(),
            selected: evictions.len(),
            ..Default::default()
        };

        if evictions.is_empty() {
            debug!(
                files = report.evaluated,
                total_bytes = snapshot.total_bytes(),
                "Tier within limits"
            );
            return Ok(report);
        }

        debug!(
            files = report.evaluated,
            total_bytes = snapshot.total_bytes(),
            selected = report.selected,
            "Evicting files"
        );

        for eviction in evictions {
            if mode == SweepMode::Normal && cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }

            match self
                .handler
                .handle_file(&eviction.recording, &self.tier, self.next.as_ref())
                .await
            {
                Ok(FileOutcome::Moved(_)) => report.moved += 1,
                Ok(FileOutcome::Deleted) => report.deleted += 1,
                Ok(FileOutcome::AlreadyGone) => report.already_gone += 1,
                Ok(FileOutcome::Conflict) => report.conflicts += 1,
                Err(HandleError::Retryable(_)) => report.failed += 1,
                Err(HandleError::Catalog(e)) => return Err(e.into()),
            }
        }

        info!(
            moved = report.moved,
            deleted = report.deleted,
            already_gone = report.already_gone,
            conflicts = report.conflicts,
            failed = report.failed,
            "Sweep pass complete"
        );

        Ok(report)
    }

    /// Run until cancelled, then make the final forced pass if the tier asks for one.
    pub async fn run(self, cancel: CancellationToken) {
        self.health.register(&self.key);
        info!(worker = %self.key, interval = ?self.tier.poll_interval, "Tier sweeper started");

        let mut ticker = tokio::time::interval(self.tier.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut backoff = ExponentialBackoff {
            initial_interval: self.retry.base_delay,
            max_interval: self.retry.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.trigger.woken() => {}
                _ = ticker.tick() => {}
            }

            match self.sweep_pass(SweepMode::Normal, &cancel).await {
                Ok(report) => {
                    metrics::counter!("tiering.passes.completed").increment(1);
                    self.health.record_success(&self.key);
                    backoff.reset();

                    if report.moved > 0 {
                        if let Some(next) = &self.next_trigger {
                            next.wake();
                        }
                    }
                }
                Err(e) => {
                    metrics::counter!("tiering.passes.failed").increment(1);
                    let degraded = self.health.record_failure(&self.key, &e.to_string());
                    let delay = backoff.next_backoff().unwrap_or(self.retry.max_delay);

                    if degraded {
                        error!(worker = %self.key, error = %e, retry_in = ?delay, "Sweep pass failed, worker degraded");
                    } else {
                        warn!(worker = %self.key, error = %e, retry_in = ?delay, "Sweep pass failed");
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if self.tier.move_on_shutdown {
            info!(worker = %self.key, "Evicting tier before shutdown");
            match self.sweep_pass(SweepMode::Forced, &cancel).await {
                Ok(report) => {
                    if report.moved > 0 {
                        if let Some(next) = &self.next_trigger {
                            next.wake();
                        }
                    }
                }
                Err(e) => {
                    error!(worker = %self.key, error = %e, "Shutdown eviction failed");
                }
            }
        }

        info!(worker = %self.key, "Tier sweeper stopped");
    }
}
