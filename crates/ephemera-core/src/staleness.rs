//! Staleness policy anchored to the merkle root's ctime.
//!
//! Two thresholds: an entry older than `max_lifetime` is stale (dropped from
//! future statements, purged by stores), an entry older than
//! `rotation_interval` calls for a new generation. Age is always
//! `root.ctime - ctime`; the local clock is never consulted.

use std::time::Duration;

use crate::types::{EkMetadata, EkStatement, MerkleRoot, UnixSecs};

/// Lifetime and rotation thresholds for ephemeral keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    max_lifetime: Duration,
    rotation_interval: Duration,
}

impl StalenessPolicy {
    /// Policy where a key is rotated exactly when it expires.
    #[must_use]
    pub fn new(max_lifetime: Duration) -> Self {
        Self { max_lifetime, rotation_interval: max_lifetime }
    }

    /// Rotate after `interval`, before the key expires. Clamped to the
    /// maximum lifetime.
    #[must_use]
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval.min(self.max_lifetime);
        self
    }

    /// Age past which a key is stale.
    pub fn max_lifetime(&self) -> Duration {
        self.max_lifetime
    }

    /// Age past which a new generation is minted.
    pub fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    /// True if a key created at `ctime` has outlived its lifetime.
    pub fn ctime_is_stale(&self, ctime: UnixSecs, root: &MerkleRoot) -> bool {
        age(ctime, root) >= self.max_lifetime.as_secs()
    }

    /// True if a key created at `ctime` is due for rotation.
    pub fn keygen_needed(&self, ctime: UnixSecs, root: &MerkleRoot) -> bool {
        age(ctime, root) >= self.rotation_interval.as_secs()
    }

    /// Still-active metadata of a prior statement, `existing` first then
    /// `current`, order preserved.
    pub fn filter_active(
        &self,
        prior: Option<&EkStatement>,
        root: &MerkleRoot,
    ) -> Vec<EkMetadata> {
        let Some(prior) = prior else {
            return Vec::new();
        };

        prior
            .existing_metadata
            .iter()
            .chain(std::iter::once(&prior.current_metadata))
            .filter(|m| !self.ctime_is_stale(m.ctime, root))
            .copied()
            .collect()
    }
}

// Keys stamped after the root (clock skew between servers) count as new.
fn age(ctime: UnixSecs, root: &MerkleRoot) -> u64 {
    root.ctime.saturating_sub(ctime)
}
