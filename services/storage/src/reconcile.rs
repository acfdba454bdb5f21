//! Startup reconciliation between the catalog and the tier roots.
//!
//! Must not run while sweepers for the same chains are active: a file that is
//! mid-move is briefly untracked under its destination root.

use crate::catalog::{Catalog, CatalogError};
use crate::file_ops::{self, FileOpError, FileOutcome};
use crate::tier::SharedChain;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Sweepers are running; stop all cameras before reconciling")]
    WorkersRunning,
}

/// What a reconciliation pass cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Rows whose file was missing, now deleted
    pub orphan_rows: usize,
    /// Untracked files past the grace period, now deleted
    pub orphan_files: usize,
    /// Rows repointed at a file an interrupted move left in the next tier
    pub adopted: usize,
}

/// Remove rows without files and files without rows in every tier of `chains`.
///
/// Tiers are walked in chain order, so a row adopted into the next tier is
/// tracked by the time that tier's files are scanned.
///
/// Untracked files modified within `grace` are kept; the segment writer may
/// still be finalizing them.
#[instrument(skip_all)]
pub async fn reconcile(
    catalog: &dyn Catalog,
    chains: &[SharedChain],
    grace: Duration,
) -> Result<ReconcileReport, ReconcileError> {
    let mut report = ReconcileReport::default();
    let cutoff = SystemTime::now().checked_sub(grace).unwrap_or(SystemTime::UNIX_EPOCH);

    for chain in chains {
        for tier in chain.tiers() {
            let rows = catalog.list_tier(&chain.category, None, tier.index).await?;
            let mut tracked = HashSet::with_capacity(rows.len());

            for row in rows {
                let exists = fs::try_exists(&row.path).await.unwrap_or(true);
                if exists {
                    tracked.insert(PathBuf::from(&row.path));
                    continue;
                }

                // An interrupted move may have left the file under the next tier
                let result = match chain.next(tier.index) {
                    Some(next) => file_ops::move_file(catalog, &row, tier, next).await,
                    None => file_ops::delete_file(catalog, &row).await,
                };

                match result {
                    Ok(FileOutcome::AlreadyGone) | Ok(FileOutcome::Deleted) => {
                        report.orphan_rows += 1;
                    }
                    Ok(FileOutcome::Moved(_)) => report.adopted += 1,
                    Ok(FileOutcome::Conflict) => {}
                    Err(FileOpError::Catalog(e)) => return Err(e.into()),
                    Err(e) => warn!(error = %e, path = %row.path, "Failed to reconcile row"),
                }
            }

            report.orphan_files += remove_untracked(&tier.path, &tracked, cutoff).await;
        }
    }

    metrics::counter!("tiering.reconcile.orphan_rows").increment(report.orphan_rows as u64);
    metrics::counter!("tiering.reconcile.orphan_files").increment(report.orphan_files as u64);

    info!(
        orphan_rows = report.orphan_rows,
        orphan_files = report.orphan_files,
        adopted = report.adopted,
        "Reconciliation complete"
    );

    Ok(report)
}

async fn remove_untracked(root: &Path, tracked: &HashSet<PathBuf>, cutoff: SystemTime) -> usize {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(error = %e, dir = %dir.display(), "Failed to read tier directory");
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, dir = %dir.display(), "Failed to list tier directory");
                    break;
                }
            };

            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || tracked.contains(&path) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified > cutoff {
                debug!(path = %path.display(), "Untracked file within grace period, keeping");
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), "Removed untracked file");
                    removed += 1;
                }
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to remove untracked file"),
            }
        }
    }

    removed
}
