//! Crash-safe move and delete of a single recording.
//!
//! These are the only functions that touch both the filesystem and the catalog.
//! Each one claims the row first, performs the filesystem work while the claim is
//! open, and commits the catalog change last. A failed filesystem step drops the
//! claim, which rolls the catalog back.

use crate::catalog::{Catalog, CatalogClaim, CatalogError, Recording};
use crate::tier::Tier;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Suffix of an in-progress cross-filesystem copy
pub const PARTIAL_SUFFIX: &str = "partial";

/// Errors from a single file operation
#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not under tier root {root}")]
    OutsideTier { path: PathBuf, root: PathBuf },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl FileOpError {
    /// Retry next cycle; the catalog was not changed
    pub fn is_transient(&self) -> bool {
        !matches!(self, FileOpError::Catalog(_))
    }

    fn io(path: &Path, source: io::Error) -> Self {
        FileOpError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outcome of a successful file operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// The file now lives in the destination tier
    Moved(Recording),
    /// The file and its row are gone
    Deleted,
    /// The file was already missing; only the row was removed
    AlreadyGone,
    /// The row changed or is held by another worker; nothing was done
    Conflict,
}

/// Destination of `source` when re-rooted from `from_root` to `to_root`
pub fn reroot(source: &Path, from_root: &Path, to_root: &Path) -> Result<PathBuf, FileOpError> {
    let relative = source
        .strip_prefix(from_root)
        .map_err(|_| FileOpError::OutsideTier {
            path: source.to_path_buf(),
            root: from_root.to_path_buf(),
        })?;
    Ok(to_root.join(relative))
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Remove the file, then the row, under one claim.
#[instrument(skip(catalog, recording), fields(recording_id = %recording.id, camera_id = %recording.camera_id, tier = recording.tier))]
pub async fn delete_file(
    catalog: &dyn Catalog,
    recording: &Recording,
) -> Result<FileOutcome, FileOpError> {
    let Some(claim) = catalog.claim(recording).await? else {
        debug!(path = %recording.path, "Recording changed since it was read, skipping");
        return Ok(FileOutcome::Conflict);
    };

    let path = Path::new(&recording.path);
    let outcome = match fs::remove_file(path).await {
        Ok(()) => FileOutcome::Deleted,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %recording.path, "File already missing, removing catalog row");
            FileOutcome::AlreadyGone
        }
        // Claim dropped here: nothing committed
        Err(e) => return Err(FileOpError::io(path, e)),
    };

    // A failed commit leaves a row without a file; reconciliation removes it
    claim.remove().await?;

    info!(path = %recording.path, "Recording deleted");
    Ok(outcome)
}

/// Move the file under `destination`'s root and repoint the row, under one claim.
///
/// Same-filesystem moves are a rename. Across filesystems the file is copied to a
/// `.partial` sibling, renamed into place, the row is committed, and only then is
/// the source removed.
///
/// A move interrupted after the file reached the destination but before the
/// commit is finished here: a destination file with no source is adopted, and a
/// destination of the recorded size next to the source is a completed copy.
#[instrument(skip(catalog, recording, from, destination), fields(recording_id = %recording.id, camera_id = %recording.camera_id, from_tier = from.index, to_tier = destination.index))]
pub async fn move_file(
    catalog: &dyn Catalog,
    recording: &Recording,
    from: &Tier,
    destination: &Tier,
) -> Result<FileOutcome, FileOpError> {
    let source = PathBuf::from(&recording.path);
    let target = reroot(&source, &from.path, &destination.path)?;

    let Some(claim) = catalog.claim(recording).await? else {
        debug!(path = %recording.path, "Recording changed since it was read, skipping");
        return Ok(FileOutcome::Conflict);
    };

    let source_len = file_len(&source).await?;
    let target_len = file_len(&target).await?;

    match (source_len, target_len) {
        (None, None) => {
            warn!(path = %recording.path, "File already missing, removing catalog row");
            claim.remove().await?;
            return Ok(FileOutcome::AlreadyGone);
        }
        (None, Some(_)) => {
            warn!(path = %target.display(), "Adopting file left at destination by an interrupted move");
            let moved = commit_move(claim, destination.index, &target).await?;
            return Ok(FileOutcome::Moved(moved));
        }
        (Some(_), Some(len)) if len == recording.size() => {
            warn!(path = %target.display(), "Completing interrupted copy");
            let moved = commit_move(claim, destination.index, &target).await?;
            remove_source(&source).await;
            return Ok(FileOutcome::Moved(moved));
        }
        // rename would silently replace another recording
        (Some(_), Some(_)) => {
            return Err(FileOpError::io(
                &target,
                io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
            ));
        }
        (Some(_), None) => {}
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| FileOpError::io(parent, e))?;
    }

    let moved = match fs::rename(&source, &target).await {
        Ok(()) => match commit_move(claim, destination.index, &target).await {
            Ok(moved) => moved,
            Err(e) => {
                // Put the file back where the row still points
                if let Err(undo) = fs::rename(&target, &source).await {
                    warn!(error = %undo, path = %target.display(), "Failed to undo rename after catalog failure");
                }
                return Err(e);
            }
        },
        Err(e) if is_cross_device(&e) => {
            debug!("Destination is on another filesystem, copying");
            copy_and_commit(claim, &source, &target, destination.index).await?
        }
        Err(e) => return Err(FileOpError::io(&target, e)),
    };

    info!(from = %recording.path, to = %moved.path, "Recording moved");
    Ok(FileOutcome::Moved(moved))
}

/// Length of the file at `path`, `None` if it does not exist
async fn file_len(path: &Path) -> Result<Option<u64>, FileOpError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FileOpError::io(path, e)),
    }
}

/// Point the claimed row at `target`. A path already owned by another row is
/// a destination collision, not a catalog failure.
async fn commit_move(
    claim: Box<dyn CatalogClaim>,
    tier: i32,
    target: &Path,
) -> Result<Recording, FileOpError> {
    let target_str = target.to_string_lossy();
    match claim.relocate(tier, &target_str).await {
        Ok(moved) => Ok(moved),
        Err(CatalogError::DuplicatePath(_)) => Err(FileOpError::io(
            target,
            io::Error::new(io::ErrorKind::AlreadyExists, "destination tracked by another recording"),
        )),
        Err(e) => Err(e.into()),
    }
}

async fn copy_and_commit(
    claim: Box<dyn CatalogClaim>,
    source: &Path,
    target: &Path,
    tier: i32,
) -> Result<Recording, FileOpError> {
    copy_into_place(source, target).await?;

    let moved = match commit_move(claim, tier, target).await {
        Ok(moved) => moved,
        Err(e) => {
            let _ = fs::remove_file(target).await;
            return Err(e);
        }
    };

    // Row already points at the copy; a leftover source is an orphan file
    remove_source(source).await;
    Ok(moved)
}

async fn remove_source(source: &Path) {
    if let Err(e) = fs::remove_file(source).await {
        warn!(error = %e, path = %source.display(), "Failed to remove source after copy");
    }
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
fn is_cross_device(err: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    err.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_err: &io::Error) -> bool {
    false
}

async fn copy_into_place(source: &Path, target: &Path) -> Result<(), FileOpError> {
    let partial = partial_path(target);

    if let Err(e) = fs::copy(source, &partial).await {
        let _ = fs::remove_file(&partial).await;
        return Err(FileOpError::io(source, e));
    }
    if let Err(e) = fs::rename(&partial, target).await {
        let _ = fs::remove_file(&partial).await;
        return Err(FileOpError::io(target, e));
    }

    Ok(())
}
