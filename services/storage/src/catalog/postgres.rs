use super::{
    Catalog, CatalogClaim, CatalogError, CatalogResult, NewRecording, Recording, TierUsage,
};
use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const RECORDING_COLUMNS: &str =
    "id, camera_id, category, tier, path, size_bytes, created_at, ended_at";

/// Recording catalog in PostgreSQL
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Create a new catalog with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema. Production schemas are managed externally.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    #[instrument(skip(self, recording), fields(camera_id = %recording.camera_id, path = %recording.path))]
    async fn insert(&self, recording: NewRecording) -> CatalogResult<Recording> {
        let sql = format!(
            r#"
            INSERT INTO recordings (
                id, camera_id, category, tier, path, size_bytes, created_at, ended_at
            ) VALUES ($1, $2, $3, 0, $4, $5, $6, $7)
            RETURNING {RECORDING_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, Recording>(&sql)
            .bind(Uuid::now_v7())
            .bind(&recording.camera_id)
            .bind(&recording.category)
            .bind(&recording.path)
            .bind(recording.size_bytes)
            .bind(recording.created_at)
            .bind(recording.ended_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| path_conflict(e, &recording.path))?;

        debug!(recording_id = %row.id, "Recording registered");
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> CatalogResult<Option<Recording>> {
        let sql = format!("SELECT {RECORDING_COLUMNS} FROM recordings WHERE id = $1");

        let row = sqlx::query_as::<_, Recording>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn list_tier(
        &self,
        category: &str,
        camera_id: Option<&str>,
        tier: i32,
    ) -> CatalogResult<Vec<Recording>> {
        let sql = format!(
            r#"
            SELECT {RECORDING_COLUMNS}
            FROM recordings
            WHERE category = $1
              AND tier = $2
              AND ($3::text IS NULL OR camera_id = $3)
            ORDER BY created_at ASC, id ASC
            "#
        );

        let rows = sqlx::query_as::<_, Recording>(&sql)
            .bind(category)
            .bind(tier)
            .bind(camera_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn tier_usage(
        &self,
        category: &str,
        camera_id: &str,
        tier: i32,
    ) -> CatalogResult<TierUsage> {
        let usage = sqlx::query_as::<_, TierUsage>(
            r#"
            SELECT
                COUNT(*) AS file_count,
                COALESCE(SUM(size_bytes), 0)::BIGINT AS total_bytes,
                MIN(created_at) AS oldest,
                MAX(created_at) AS newest
            FROM recordings
            WHERE category = $1 AND camera_id = $2 AND tier = $3
            "#,
        )
        .bind(category)
        .bind(camera_id)
        .bind(tier)
        .fetch_one(&self.pool)
        .await?;

        Ok(usage)
    }

    async fn claim(&self, expected: &Recording) -> CatalogResult<Option<Box<dyn CatalogClaim>>> {
        let mut tx = self.pool.begin().await?;

        // SKIP LOCKED: a row held by another worker reads as absent
        let sql = format!(
            r#"
            SELECT {RECORDING_COLUMNS}
            FROM recordings
            WHERE id = $1 AND category = $2 AND tier = $3 AND path = $4
            FOR UPDATE SKIP LOCKED
            "#
        );

        let row = sqlx::query_as::<_, Recording>(&sql)
            .bind(expected.id)
            .bind(&expected.category)
            .bind(expected.tier)
            .bind(&expected.path)
            .fetch_optional(&mut *tx)
            .await?;

        match row {
            Some(recording) => Ok(Some(Box::new(PgClaim { tx, recording }))),
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn ping(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Report a violation of the unique `path` constraint the same way
/// [`super::MemoryCatalog`] does
fn path_conflict(err: sqlx::Error, path: &str) -> CatalogError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return CatalogError::DuplicatePath(path.to_string());
        }
    }
    err.into()
}

/// Row lock held inside an open transaction
struct PgClaim {
    tx: Transaction<'static, Postgres>,
    recording: Recording,
}

#[async_trait]
impl CatalogClaim for PgClaim {
    fn recording(&self) -> &Recording {
        &self.recording
    }

    async fn relocate(self: Box<Self>, tier: i32, path: &str) -> CatalogResult<Recording> {
        let PgClaim { mut tx, recording } = *self;

        let sql = format!(
            "UPDATE recordings SET tier = $2, path = $3 WHERE id = $1 RETURNING {RECORDING_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, Recording>(&sql)
            .bind(recording.id)
            .bind(tier)
            .bind(path)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| path_conflict(e, path))?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn remove(self: Box<Self>) -> CatalogResult<()> {
        let PgClaim { mut tx, recording } = *self;

        sqlx::query("DELETE FROM recordings WHERE id = $1")
            .bind(recording.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
