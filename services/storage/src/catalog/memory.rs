use super::{
    Catalog, CatalogClaim, CatalogError, CatalogResult, NewRecording, Recording, TierUsage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct State {
    rows: HashMap<Uuid, Recording>,
    claimed: HashSet<Uuid>,
    offline: bool,
}

impl State {
    fn check_online(&self) -> CatalogResult<()> {
        if self.offline {
            return Err(CatalogError::Unavailable("catalog is offline".to_string()));
        }
        Ok(())
    }
}

/// In-process catalog with the same claim semantics as [`super::PgCatalog`].
///
/// Used by embedded deployments without a database and by tests.
#[derive(Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<State>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the database connection
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Insert a fully formed row, keeping its tier and id
    pub fn insert_row(&self, recording: Recording) -> CatalogResult<()> {
        let mut state = self.state.lock();
        if state.rows.values().any(|r| r.path == recording.path) {
            return Err(CatalogError::DuplicatePath(recording.path));
        }
        state.rows.insert(recording.id, recording);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every row, ordered by `(created_at, id)`
    pub fn all(&self) -> Vec<Recording> {
        let mut rows: Vec<_> = self.state.lock().rows.values().cloned().collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        rows
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn insert(&self, recording: NewRecording) -> CatalogResult<Recording> {
        self.state.lock().check_online()?;

        let row = Recording {
            id: Uuid::now_v7(),
            camera_id: recording.camera_id,
            category: recording.category,
            tier: 0,
            path: recording.path,
            size_bytes: recording.size_bytes,
            created_at: recording.created_at,
            ended_at: recording.ended_at,
        };
        self.insert_row(row.clone())?;
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> CatalogResult<Option<Recording>> {
        let state = self.state.lock();
        state.check_online()?;
        Ok(state.rows.get(&id).cloned())
    }

    async fn list_tier(
        &self,
        category: &str,
        camera_id: Option<&str>,
        tier: i32,
    ) -> CatalogResult<Vec<Recording>> {
        let state = self.state.lock();
        state.check_online()?;

        let mut rows: Vec<Recording> = state
            .rows
            .values()
            .filter(|r| r.category == category && r.tier == tier)
            .filter(|r| camera_id.map_or(true, |c| r.camera_id == c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        Ok(rows)
    }

    async fn tier_usage(
        &self,
        category: &str,
        camera_id: &str,
        tier: i32,
    ) -> CatalogResult<TierUsage> {
        let rows = self.list_tier(category, Some(camera_id), tier).await?;

        Ok(TierUsage {
            file_count: rows.len() as i64,
            total_bytes: rows.iter().map(|r| r.size_bytes).sum(),
            oldest: rows.first().map(|r| r.created_at),
            newest: rows.iter().map(|r| r.created_at).max(),
        })
    }

    async fn claim(&self, expected: &Recording) -> CatalogResult<Option<Box<dyn CatalogClaim>>> {
        let mut state = self.state.lock();
        state.check_online()?;

        let matches = state.rows.get(&expected.id).is_some_and(|row| {
            row.category == expected.category
                && row.tier == expected.tier
                && row.path == expected.path
        });
        if !matches || state.claimed.contains(&expected.id) {
            return Ok(None);
        }

        state.claimed.insert(expected.id);
        let recording = state.rows[&expected.id].clone();

        Ok(Some(Box::new(MemoryClaim {
            state: Arc::clone(&self.state),
            recording,
        })))
    }

    async fn ping(&self) -> CatalogResult<()> {
        self.state.lock().check_online()
    }
}

struct MemoryClaim {
    state: Arc<Mutex<State>>,
    recording: Recording,
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        // Commit and rollback both end here
        self.state.lock().claimed.remove(&self.recording.id);
    }
}

#[async_trait]
impl CatalogClaim for MemoryClaim {
    fn recording(&self) -> &Recording {
        &self.recording
    }

    async fn relocate(self: Box<Self>, tier: i32, path: &str) -> CatalogResult<Recording> {
        let mut state = self.state.lock();
        state.check_online()?;

        if state
            .rows
            .values()
            .any(|r| r.id != self.recording.id && r.path == path)
        {
            return Err(CatalogError::DuplicatePath(path.to_string()));
        }

        let row = state
            .rows
            .get_mut(&self.recording.id)
            .ok_or_else(|| CatalogError::Unavailable("claimed row vanished".to_string()))?;
        row.tier = tier;
        row.path = path.to_string();

        Ok(row.clone())
    }

    async fn remove(self: Box<Self>) -> CatalogResult<()> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.rows.remove(&self.recording.id);
        Ok(())
    }
}
