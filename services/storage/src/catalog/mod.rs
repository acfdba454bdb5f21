//! Recording catalog.
//!
//! The catalog is the only handle other subsystems use to locate a recording.
//! Every mutation of a row's `tier`/`path` or its deletion happens through a
//! [`CatalogClaim`], which is held for exactly the duration of one file's
//! filesystem operation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryCatalog;
pub use postgres::PgCatalog;

/// Catalog errors. All of them are fatal to the sweep pass that hit them.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),

    #[error("A recording already exists at {0}")]
    DuplicatePath(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// One recorded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Recording {
    /// Unique recording ID (UUIDv7, so ID order follows insertion order)
    pub id: Uuid,
    /// Owning camera
    pub camera_id: String,
    /// Tier chain the file belongs to
    pub category: String,
    /// Position of the current tier in the chain
    pub tier: i32,
    /// Absolute path of the file
    pub path: String,
    /// File size in bytes
    pub size_bytes: i64,
    /// When the segment started
    pub created_at: DateTime<Utc>,
    /// When the segment was finalized
    pub ended_at: Option<DateTime<Utc>>,
}

impl Recording {
    pub fn size(&self) -> u64 {
        self.size_bytes.max(0) as u64
    }
}

/// A finalized segment about to be registered in the first tier
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub camera_id: String,
    pub category: String,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Aggregate state of one tier for one camera
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TierUsage {
    pub file_count: i64,
    pub total_bytes: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Exclusive hold on one catalog row.
///
/// Committing consumes the claim; dropping it without committing rolls back and
/// leaves the row untouched.
#[async_trait]
pub trait CatalogClaim: Send {
    /// The row as it was when claimed
    fn recording(&self) -> &Recording;

    /// Point the row at a new tier and path, then commit
    async fn relocate(self: Box<Self>, tier: i32, path: &str) -> CatalogResult<Recording>;

    /// Delete the row, then commit
    async fn remove(self: Box<Self>) -> CatalogResult<()>;
}

/// Storage for recording rows
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Register a new recording in tier 0 of its chain
    async fn insert(&self, recording: NewRecording) -> CatalogResult<Recording>;

    async fn get(&self, id: Uuid) -> CatalogResult<Option<Recording>>;

    /// Recordings currently in a tier, ordered by `(created_at, id)`.
    /// `camera_id = None` lists every camera.
    async fn list_tier(
        &self,
        category: &str,
        camera_id: Option<&str>,
        tier: i32,
    ) -> CatalogResult<Vec<Recording>>;

    async fn tier_usage(&self, category: &str, camera_id: &str, tier: i32)
        -> CatalogResult<TierUsage>;

    /// Claim a row for one file operation.
    ///
    /// Returns `None` if the row no longer matches `expected` (already moved or
    /// deleted) or another worker holds it.
    async fn claim(&self, expected: &Recording) -> CatalogResult<Option<Box<dyn CatalogClaim>>>;

    /// Connectivity check
    async fn ping(&self) -> CatalogResult<()>;
}
