//! Orchestrator configuration.

use std::time::Duration;

use crate::staleness::StalenessPolicy;

/// How long a cached team generation is trusted without re-checking the
/// server.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Number of teams kept in the generation cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 200;

/// Maximum age of a merkle root accepted for rotation decisions.
pub const DEFAULT_MERKLE_FRESHNESS: Duration = Duration::from_secs(60);

/// Configuration for [`EkLib`](crate::EkLib).
///
/// There is no default staleness policy: key lifetimes are a deployment
/// decision and must be supplied.
#[derive(Debug, Clone)]
pub struct EkConfig {
    /// Lifetime and rotation thresholds
    pub staleness: StalenessPolicy,
    /// Validity of a generation cache entry
    pub cache_ttl: Duration,
    /// Generation cache capacity (LRU eviction beyond it)
    pub cache_capacity: usize,
    /// Freshness required of merkle roots
    pub merkle_freshness: Duration,
}

impl EkConfig {
    /// Configuration with the given staleness policy and default cache and
    /// merkle settings.
    #[must_use]
    pub fn new(staleness: StalenessPolicy) -> Self {
        Self {
            staleness,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            merkle_freshness: DEFAULT_MERKLE_FRESHNESS,
        }
    }
}
