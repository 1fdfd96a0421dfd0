//! Team key generation cache.
//!
//! Remembers the latest team key generation per team for a short TTL so the
//! hot path (encrypting to a team) skips the merkle fetch, statement fetch
//! and rotation check. Eviction is LRU over a fixed capacity; an evicted or
//! expired entry is just a miss.
//!
//! Timed with the injected [`Environment`] clock, never the merkle root.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::{
    env::Environment,
    types::{EkGeneration, TeamId},
};

#[derive(Debug, Clone, Copy)]
struct Entry<I> {
    generation: EkGeneration,
    ctime: I,
}

#[derive(Debug)]
struct Inner<I> {
    entries: HashMap<TeamId, Entry<I>>,
    /// Front is least recently used
    lru_order: VecDeque<TeamId>,
}

impl<I> Inner<I> {
    fn touch(&mut self, team: &TeamId) {
        if let Some(pos) = self.lru_order.iter().position(|t| t == team) {
            self.lru_order.remove(pos);
        }
        self.lru_order.push_back(team.clone());
    }

    fn remove(&mut self, team: &TeamId) {
        self.entries.remove(team);
        if let Some(pos) = self.lru_order.iter().position(|t| t == team) {
            self.lru_order.remove(pos);
        }
    }
}

/// Bounded TTL cache of team id to latest team key generation.
pub struct GenerationCache<E: Environment> {
    env: E,
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Inner<E::Instant>>,
}

impl<E: Environment> GenerationCache<E> {
    /// Create an empty cache.
    pub fn new(env: E, ttl: Duration, capacity: usize) -> Self {
        Self {
            env,
            ttl,
            capacity,
            inner: Mutex::new(Inner { entries: HashMap::new(), lru_order: VecDeque::new() }),
        }
    }

    // Nothing in `Inner` can be left half-updated by a panic that matters:
    // the worst case is a stale LRU position.
    fn lock(&self) -> MutexGuard<'_, Inner<E::Instant>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_valid(&self, entry: &Entry<E::Instant>) -> bool {
        self.env.now() - entry.ctime < self.ttl
    }

    /// Cached generation for `team`, if present and within TTL.
    pub fn get(&self, team: &TeamId) -> Option<EkGeneration> {
        let mut inner = self.lock();
        let entry = *inner.entries.get(team)?;
        if !self.is_valid(&entry) {
            return None;
        }
        inner.touch(team);
        Some(entry.generation)
    }

    /// Record `generation` as the latest for `team`, starting a new TTL.
    pub fn put(&self, team: TeamId, generation: EkGeneration) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.lock();
        if !inner.entries.contains_key(&team) {
            while inner.entries.len() >= self.capacity {
                let Some(oldest) = inner.lru_order.pop_front() else {
                    break;
                };
                inner.entries.remove(&oldest);
            }
        }

        inner.touch(&team);
        inner.entries.insert(team, Entry { generation, ctime: self.env.now() });
    }

    /// Drop the entry for `team` if it is still valid but names a generation
    /// other than `expected`.
    ///
    /// Returns true if an entry was removed.
    pub fn invalidate_if_stale(&self, team: &TeamId, expected: EkGeneration) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get(team).copied() else {
            return false;
        };
        if self.is_valid(&entry) && entry.generation != expected {
            inner.remove(team);
            tracing::debug!(
                team_id = %team,
                cached = entry.generation,
                expected,
                "purged team ek generation cache entry"
            );
            return true;
        }
        false
    }

    /// Entries occupying capacity. Expired entries count until they are
    /// evicted or overwritten, so this is not the number of valid hits.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True if no entries occupy capacity.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.lru_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use proptest::prelude::*;

    use super::*;

    /// Clock advanced by hand, RNG unused.
    #[derive(Clone, Default)]
    struct ManualClock {
        millis: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn advance(&self, by: Duration) {
            self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    impl Environment for ManualClock {
        type Instant = Duration;

        fn now(&self) -> Duration {
            Duration::from_millis(self.millis.load(Ordering::SeqCst))
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0);
        }
    }

    const TTL: Duration = Duration::from_secs(300);

    fn team(n: usize) -> TeamId {
        TeamId::new(format!("team-{n}"))
    }

    #[test]
    fn entry_expires_after_ttl() {
        let clock = ManualClock::default();
        let cache = GenerationCache::new(clock.clone(), TTL, 10);

        cache.put(team(1), 4);
        clock.advance(TTL - Duration::from_secs(1));
        assert_eq!(cache.get(&team(1)), Some(4));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&team(1)), None);
    }

    #[test]
    fn put_restarts_ttl() {
        let clock = ManualClock::default();
        let cache = GenerationCache::new(clock.clone(), TTL, 10);

        cache.put(team(1), 1);
        clock.advance(Duration::from_secs(200));
        cache.put(team(1), 2);
        clock.advance(Duration::from_secs(200));
        assert_eq!(cache.get(&team(1)), Some(2));
    }

    #[test]
    fn invalidate_only_removes_valid_mismatching_entry() {
        let clock = ManualClock::default();
        let cache = GenerationCache::new(clock.clone(), TTL, 10);

        cache.put(team(1), 3);
        assert!(!cache.invalidate_if_stale(&team(1), 3));
        assert_eq!(cache.get(&team(1)), Some(3));

        assert!(cache.invalidate_if_stale(&team(1), 4));
        assert_eq!(cache.get(&team(1)), None);

        cache.put(team(2), 3);
        clock.advance(TTL);
        assert!(!cache.invalidate_if_stale(&team(2), 4));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = GenerationCache::new(ManualClock::default(), TTL, 2);

        cache.put(team(1), 1);
        cache.put(team(2), 1);
        assert_eq!(cache.get(&team(1)), Some(1));
        cache.put(team(3), 1);

        assert_eq!(cache.get(&team(1)), Some(1));
        assert_eq!(cache.get(&team(2)), None);
        assert_eq!(cache.get(&team(3)), Some(1));
    }

    #[test]
    fn expired_entry_occupies_capacity_until_evicted() {
        let clock = ManualClock::default();
        let cache = GenerationCache::new(clock.clone(), TTL, 1);

        cache.put(team(1), 1);
        clock.advance(TTL);
        assert_eq!(cache.get(&team(1)), None);
        assert_eq!(cache.len(), 1);

        cache.put(team(2), 5);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&team(2)), Some(5));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let cache = GenerationCache::new(ManualClock::default(), TTL, 0);
        cache.put(team(1), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get(&team(1)), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_capacity_never_exceeded(
            capacity in 1usize..8,
            ops in prop::collection::vec((0usize..16, 1u64..100), 0..64),
        ) {
            let cache = GenerationCache::new(ManualClock::default(), TTL, capacity);
            for (t, generation) in ops {
                cache.put(team(t), generation);
                prop_assert!(cache.len() <= capacity);
                prop_assert_eq!(cache.get(&team(t)), Some(generation));
            }
        }
    }
}
