//! Runtime tier chain model.
//!
//! A [`TierChain`] is built once from validated configuration and shared
//! read-only between every worker. The terminal tier is the one whose
//! [`TierChain::next`] is `None`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Retention limits for one tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierLimits {
    /// Files older than this must leave the tier
    pub max_age: Option<ChronoDuration>,
    /// Aggregate byte budget for the tier
    pub max_size: Option<u64>,
    /// Files younger than this are never evicted
    pub min_age: Option<ChronoDuration>,
    /// Size-pressure eviction never takes the tier below this many bytes
    pub min_size: Option<u64>,
}

impl TierLimits {
    /// True when the file is still inside its `min_age` protection window
    pub fn is_protected(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.min_age {
            Some(min_age) => now.signed_duration_since(created_at) < min_age,
            None => false,
        }
    }

    /// True when the file has outlived `max_age`
    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(max_age) => now.signed_duration_since(created_at) > max_age,
            None => false,
        }
    }
}

/// One configured storage location in a chain
#[derive(Debug, Clone)]
pub struct Tier {
    /// Position in the chain, also the `tier` column value in the catalog
    pub index: i32,
    /// Filesystem root
    pub path: PathBuf,
    pub limits: TierLimits,
    /// Force-evict everything when the owning camera stops
    pub move_on_shutdown: bool,
    pub poll_interval: Duration,
}

impl Tier {
    /// True if `path` lives under this tier's root
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

/// Ordered tiers for one storage category
#[derive(Debug, Clone)]
pub struct TierChain {
    pub category: String,
    tiers: Vec<Tier>,
}

impl TierChain {
    /// Build a chain from tiers in order. Indexes are reassigned to match position.
    pub fn new(category: impl Into<String>, tiers: Vec<Tier>) -> Self {
        let tiers = tiers
            .into_iter()
            .enumerate()
            .map(|(i, mut tier)| {
                tier.index = i as i32;
                tier
            })
            .collect();

        Self {
            category: category.into(),
            tiers,
        }
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn get(&self, index: i32) -> Option<&Tier> {
        usize::try_from(index).ok().and_then(|i| self.tiers.get(i))
    }

    /// First tier, where new recordings land
    pub fn first(&self) -> Option<&Tier> {
        self.tiers.first()
    }

    /// Successor of the tier at `index`, `None` for the terminal tier
    pub fn next(&self, index: i32) -> Option<&Tier> {
        self.get(index + 1)
    }

    pub fn is_terminal(&self, index: i32) -> bool {
        self.get(index).is_some() && self.next(index).is_none()
    }

    /// Tier whose root contains `path`
    pub fn tier_for_path(&self, path: &Path) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.contains(path))
    }
}

/// Shared handle to an immutable chain
pub type SharedChain = Arc<TierChain>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(path: &str) -> Tier {
        Tier {
            index: 99,
            path: PathBuf::from(path),
            limits: TierLimits::default(),
            move_on_shutdown: false,
            poll_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_chain_successors() {
        let chain = TierChain::new("recorder", vec![tier("/tmp/tier1"), tier("/tmp/tier2")]);

        assert_eq!(chain.get(0).unwrap().index, 0);
        assert_eq!(chain.next(0).unwrap().path, PathBuf::from("/tmp/tier2"));
        assert!(chain.next(1).is_none());
        assert!(chain.is_terminal(1));
        assert!(!chain.is_terminal(0));
        assert!(!chain.is_terminal(2));
        assert!(chain.get(-1).is_none());
    }

    #[test]
    fn test_tier_for_path() {
        let chain = TierChain::new("recorder", vec![tier("/tmp/tier1"), tier("/tmp/tier2")]);

        let found = chain.tier_for_path(Path::new("/tmp/tier2/cam1/seg1.mp4"));
        assert_eq!(found.map(|t| t.index), Some(1));
        assert!(chain.tier_for_path(Path::new("/tmp/tier10/seg.mp4")).is_none());
    }

    #[test]
    fn test_limits_windows() {
        let now = Utc::now();
        let limits = TierLimits {
            max_age: Some(ChronoDuration::hours(1)),
            min_age: Some(ChronoDuration::minutes(10)),
            ..Default::default()
        };

        assert!(limits.is_expired(now - ChronoDuration::hours(2), now));
        assert!(!limits.is_expired(now - ChronoDuration::minutes(30), now));
        assert!(limits.is_protected(now - ChronoDuration::minutes(5), now));
        assert!(!limits.is_protected(now - ChronoDuration::minutes(15), now));
    }
}
