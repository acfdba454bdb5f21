//! Tier policy evaluation.
//!
//! Pure classification: given a snapshot of the files in one tier and the tier's
//! limits, decide which files must leave and in what order. Nothing here touches
//! the catalog or the filesystem.
//!
//! Precedence:
//! 1. Files older than `max_age` leave, unless still inside `min_age`.
//! 2. While the remaining aggregate exceeds `max_size`, the oldest remaining
//!    files leave, stopping at the first file inside `min_age` or the first one
//!    whose removal would take the tier below `min_size`.
//!
//! Files are ordered by `(created_at, id)` so repeated evaluations of the same
//! snapshot return the same list.

use crate::catalog::Recording;
use crate::tier::TierLimits;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

/// Why a file was selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Older than the tier's `max_age`
    MaxAge,
    /// The tier is over its `max_size` budget
    MaxSize,
    /// Shutdown pass on a `move_on_shutdown` tier
    Forced,
}

/// One file that must leave the tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub recording: Recording,
    pub reason: EvictionReason,
}

/// Files currently in one tier for one camera
#[derive(Debug, Clone, Default)]
pub struct TierSnapshot {
    files: Vec<Recording>,
    total_bytes: u64,
}

impl TierSnapshot {
    /// Build a snapshot; files are sorted oldest-first regardless of input order
    pub fn new(mut files: Vec<Recording>) -> Self {
        files.sort_by(oldest_first);
        let total_bytes = files.iter().map(Recording::size).sum();
        Self { files, total_bytes }
    }

    pub fn files(&self) -> &[Recording] {
        &self.files
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn oldest(&self) -> Option<&Recording> {
        self.files.first()
    }

    pub fn newest(&self) -> Option<&Recording> {
        self.files.last()
    }
}

fn oldest_first(a: &Recording, b: &Recording) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Files that must leave the tier, oldest first
pub fn evaluate(limits: &TierLimits, snapshot: &TierSnapshot, now: DateTime<Utc>) -> Vec<Eviction> {
    let files = snapshot.files();
    let mut reasons: Vec<Option<EvictionReason>> = vec![None; files.len()];
    let mut remaining = snapshot.total_bytes();

    for (i, file) in files.iter().enumerate() {
        if limits.is_expired(file.created_at, now) && !limits.is_protected(file.created_at, now) {
            reasons[i] = Some(EvictionReason::MaxAge);
            remaining = remaining.saturating_sub(file.size());
        }
    }

    if let Some(max_size) = limits.max_size {
        let min_size = limits.min_size.unwrap_or(0);

        for (i, file) in files.iter().enumerate() {
            if remaining <= max_size {
                break;
            }
            if reasons[i].is_some() {
                continue;
            }
            // Sorted oldest-first, so every later file is protected too
            if limits.is_protected(file.created_at, now) {
                break;
            }
            let after = remaining.saturating_sub(file.size());
            if after < min_size {
                break;
            }
            reasons[i] = Some(EvictionReason::MaxSize);
            remaining = after;
        }
    }

    files
        .iter()
        .zip(reasons)
        .filter_map(|(file, reason)| {
            reason.map(|reason| Eviction {
                recording: file.clone(),
                reason,
            })
        })
        .collect()
}

/// Every file in the tier, oldest first, ignoring all limits
pub fn evaluate_forced(snapshot: &TierSnapshot) -> Vec<Eviction> {
    snapshot
        .files()
        .iter()
        .map(|file| Eviction {
            recording: file.clone(),
            reason: EvictionReason::Forced,
        })
        .collect()
}
