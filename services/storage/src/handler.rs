use crate::catalog::{Catalog, CatalogError, Recording};
use crate::events::{EventPublisher, TierEvent};
use crate::file_ops::{self, FileOpError, FileOutcome};
use crate::tier::Tier;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};

/// Errors from handling one file
#[derive(Debug, Error)]
pub enum HandleError {
    /// Left for the next sweep cycle
    #[error("Retryable file error: {0}")]
    Retryable(FileOpError),

    /// Aborts the sweep pass
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl From<FileOpError> for HandleError {
    fn from(err: FileOpError) -> Self {
        match err {
            FileOpError::Catalog(e) => HandleError::Catalog(e),
            other => HandleError::Retryable(other),
        }
    }
}

/// Executes one eviction step: delete from a terminal tier, move otherwise.
///
/// Whether a file should leave is decided by [`crate::policy`]; this only knows how.
#[derive(Clone)]
pub struct TierHandler {
    catalog: Arc<dyn Catalog>,
    publisher: Arc<dyn EventPublisher>,
}

impl TierHandler {
    pub fn new(catalog: Arc<dyn Catalog>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { catalog, publisher }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Delete or move `recording` out of `tier`
    #[instrument(skip_all, fields(recording_id = %recording.id, tier = tier.index, terminal = next.is_none()))]
    pub async fn handle_file(
        &self,
        recording: &Recording,
        tier: &Tier,
        next: Option<&Tier>,
    ) -> Result<FileOutcome, HandleError> {
        let result = match next {
            None => file_ops::delete_file(self.catalog.as_ref(), recording).await,
            Some(next) => file_ops::move_file(self.catalog.as_ref(), recording, tier, next).await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, path = %recording.path, "File operation failed, will retry next cycle");
                    metrics::counter!("tiering.files.failed").increment(1);
                }
                return Err(e.into());
            }
        };

        match &outcome {
            FileOutcome::Moved(moved) => {
                metrics::counter!("tiering.files.moved").increment(1);
                self.publisher.publish(TierEvent::Moved {
                    recording_id: recording.id,
                    camera_id: recording.camera_id.clone(),
                    category: recording.category.clone(),
                    from_tier: recording.tier,
                    to_tier: moved.tier,
                    path: moved.path.clone(),
                    at: Utc::now(),
                });
            }
            FileOutcome::Deleted | FileOutcome::AlreadyGone => {
                if outcome == FileOutcome::Deleted {
                    metrics::counter!("tiering.files.deleted").increment(1);
                } else {
                    metrics::counter!("tiering.files.already_gone").increment(1);
                }
                self.publisher.publish(TierEvent::Deleted {
                    recording_id: recording.id,
                    camera_id: recording.camera_id.clone(),
                    category: recording.category.clone(),
                    from_tier: recording.tier,
                    at: Utc::now(),
                });
            }
            FileOutcome::Conflict => {
                metrics::counter!("tiering.files.conflicts").increment(1);
            }
        }

        Ok(outcome)
    }
}
