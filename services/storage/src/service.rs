use crate::catalog::{Catalog, CatalogError, NewRecording, Recording};
use crate::events::EventPublisher;
use crate::handler::TierHandler;
use crate::health::{HealthRegistry, WorkerKey};
use crate::reconcile::{self, ReconcileError, ReconcileReport};
use crate::sweeper::{RetrySettings, SweepTrigger, TierSweeper};
use crate::tier::SharedChain;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Errors from the service entry points
#[derive(Debug, Error)]
pub enum TieringError {
    #[error("No tier chain for category {0}")]
    UnknownCategory(String),

    #[error("{path} is not under the first tier of chain {category}")]
    OutsideFirstTier { path: String, category: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Runtime knobs shared by every worker
#[derive(Debug, Clone, Copy)]
pub struct TieringSettings {
    pub retry: RetrySettings,
    pub orphan_grace: Duration,
}

impl Default for TieringSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            orphan_grace: Duration::from_secs(3600),
        }
    }
}

struct Worker {
    key: WorkerKey,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct CameraWorkers {
    triggers: HashMap<(String, i32), SweepTrigger>,
    /// One entry per chain, workers in tier order
    chains: Vec<Vec<Worker>>,
}

/// Owns the sweepers of every running camera
pub struct TieringService {
    chains: Vec<SharedChain>,
    handler: TierHandler,
    health: HealthRegistry,
    settings: TieringSettings,
    cameras: Mutex<HashMap<String, CameraWorkers>>,
}

impl TieringService {
    pub fn new(
        chains: Vec<SharedChain>,
        catalog: Arc<dyn Catalog>,
        publisher: Arc<dyn EventPublisher>,
        health: HealthRegistry,
        settings: TieringSettings,
    ) -> Self {
        Self {
            chains,
            handler: TierHandler::new(catalog, publisher),
            health,
            settings,
            cameras: Mutex::new(HashMap::new()),
        }
    }

    pub fn chains(&self) -> &[SharedChain] {
        &self.chains
    }

    pub fn chain(&self, category: &str) -> Option<&SharedChain> {
        self.chains.iter().find(|c| c.category == category)
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        self.handler.catalog()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn running_cameras(&self) -> Vec<String> {
        let mut cameras: Vec<_> = self.cameras.lock().keys().cloned().collect();
        cameras.sort();
        cameras
    }

    /// Clean up orphan rows and files. Refused while any camera is running.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        if !self.cameras.lock().is_empty() {
            return Err(ReconcileError::WorkersRunning);
        }
        reconcile::reconcile(
            self.handler.catalog().as_ref(),
            &self.chains,
            self.settings.orphan_grace,
        )
        .await
    }

    /// Spawn one sweeper per tier of every chain. Returns false if already running.
    #[instrument(skip(self))]
    pub fn start_camera(&self, camera_id: &str) -> bool {
        let mut cameras = self.cameras.lock();
        if cameras.contains_key(camera_id) {
            return false;
        }

        let mut workers = CameraWorkers {
            triggers: HashMap::new(),
            chains: Vec::with_capacity(self.chains.len()),
        };

        for chain in &self.chains {
            let triggers: Vec<SweepTrigger> = chain.tiers().iter().map(|_| SweepTrigger::new()).collect();
            let mut chain_workers = Vec::with_capacity(chain.len());

            for (i, tier) in chain.tiers().iter().enumerate() {
                let sweeper = TierSweeper::new(
                    camera_id,
                    chain.category.clone(),
                    tier.clone(),
                    chain.next(tier.index).cloned(),
                    self.handler.clone(),
                    self.health.clone(),
                    triggers[i].clone(),
                    triggers.get(i + 1).cloned(),
                )
                .with_retry(self.settings.retry);

                workers
                    .triggers
                    .insert((chain.category.clone(), tier.index), triggers[i].clone());

                let cancel = CancellationToken::new();
                chain_workers.push(Worker {
                    key: sweeper.key().clone(),
                    cancel: cancel.clone(),
                    handle: tokio::spawn(sweeper.run(cancel)),
                });
            }

            workers.chains.push(chain_workers);
        }

        let count: usize = workers.chains.iter().map(Vec::len).sum();
        info!(workers = count, "Camera tiering started");
        cameras.insert(camera_id.to_string(), workers);
        true
    }

    /// Stop a camera's sweepers and wait for their shutdown passes.
    /// Returns false if the camera was not running.
    ///
    /// Within a chain, tiers stop in order: each tier's forced shutdown pass
    /// finishes before the next tier is cancelled, so the next pass sees the
    /// files it received.
    #[instrument(skip(self))]
    pub async fn stop_camera(&self, camera_id: &str) -> bool {
        let removed = self.cameras.lock().remove(camera_id);
        let Some(workers) = removed else {
            return false;
        };

        join_all(workers.chains.into_iter().map(|chain| self.stop_chain(chain))).await;

        info!("Camera tiering stopped");
        true
    }

    async fn stop_chain(&self, workers: Vec<Worker>) {
        for worker in workers {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                error!(worker = %worker.key, error = %e, "Tier sweeper task panicked");
            }
            self.health.deregister(&worker.key);
        }
    }

    /// Stop every camera
    pub async fn shutdown(&self) {
        for camera_id in self.running_cameras() {
            self.stop_camera(&camera_id).await;
        }
    }

    /// Wake one worker ahead of its poll interval
    pub fn trigger(&self, camera_id: &str, category: &str, tier: i32) -> bool {
        let cameras = self.cameras.lock();
        match cameras
            .get(camera_id)
            .and_then(|w| w.triggers.get(&(category.to_string(), tier)))
        {
            Some(trigger) => {
                trigger.wake();
                true
            }
            None => false,
        }
    }

    /// Register a finalized segment in the first tier and wake that tier's worker
    #[instrument(skip(self, recording), fields(camera_id = %recording.camera_id, category = %recording.category))]
    pub async fn register_recording(&self, recording: NewRecording) -> Result<Recording, TieringError> {
        let chain = self
            .chain(&recording.category)
            .ok_or_else(|| TieringError::UnknownCategory(recording.category.clone()))?;

        let in_first_tier = chain
            .first()
            .is_some_and(|tier| tier.contains(Path::new(&recording.path)));
        if !in_first_tier {
            return Err(TieringError::OutsideFirstTier {
                path: recording.path,
                category: recording.category,
            });
        }

        let row = self.handler.catalog().insert(recording).await?;
        self.trigger(&row.camera_id, &row.category, 0);

        Ok(row)
    }
}
