use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity of one sweeper worker
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WorkerKey {
    pub camera_id: String,
    pub category: String,
    pub tier: i32,
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/tier{}", self.camera_id, self.category, self.tier)
    }
}

/// Last known state of one worker
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerHealth {
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Per-worker health, read by the HTTP health endpoint.
///
/// Each worker only writes its own entry.
#[derive(Clone)]
pub struct HealthRegistry {
    workers: Arc<RwLock<BTreeMap<WorkerKey, WorkerHealth>>>,
    degraded_after: u32,
}

impl HealthRegistry {
    pub fn new(degraded_after: u32) -> Self {
        Self {
            workers: Arc::new(RwLock::new(BTreeMap::new())),
            degraded_after: degraded_after.max(1),
        }
    }

    pub fn register(&self, key: &WorkerKey) {
        self.workers.write().entry(key.clone()).or_default();
    }

    pub fn deregister(&self, key: &WorkerKey) {
        self.workers.write().remove(key);
    }

    pub fn record_success(&self, key: &WorkerKey) {
        let mut workers = self.workers.write();
        let health = workers.entry(key.clone()).or_default();
        health.consecutive_failures = 0;
        health.degraded = false;
        health.last_success = Some(Utc::now());
        health.last_error = None;
    }

    /// Record a failed pass; returns true if the worker is now degraded
    pub fn record_failure(&self, key: &WorkerKey, error: &str) -> bool {
        let mut workers = self.workers.write();
        let health = workers.entry(key.clone()).or_default();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.degraded = health.consecutive_failures >= self.degraded_after;
        health.last_error = Some(error.to_string());
        health.degraded
    }

    pub fn get(&self, key: &WorkerKey) -> Option<WorkerHealth> {
        self.workers.read().get(key).cloned()
    }

    pub fn degraded(&self) -> Vec<(WorkerKey, WorkerHealth)> {
        self.workers
            .read()
            .iter()
            .filter(|(_, h)| h.degraded)
            .map(|(k, h)| (k.clone(), h.clone()))
            .collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.workers.read().values().all(|h| !h.degraded)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }
}
