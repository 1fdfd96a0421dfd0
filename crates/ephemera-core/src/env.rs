//! Clock and entropy source for the key lifecycle.
//!
//! Everything that mints seeds or times a cache goes through
//! [`Environment`], so tests run on a virtual clock with seeded randomness
//! and production runs on the OS.
//!
//! Key *lifetime* is never judged with this clock. Staleness always comes
//! from the merkle root's ctime; this clock only times local caches.

use std::time::Duration;

/// Time and randomness for the key lifecycle.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` is monotonic
/// - `random_bytes()` draws from a cryptographically secure source outside
///   of simulation, since every seed, box sender secret and nonce comes from
///   it
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type of this environment's clock (`std::time::Instant` in
    /// production, virtual time in simulation).
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time.
    fn now(&self) -> Self::Instant;

    /// Fill `buffer` with random bytes.
    ///
    /// A simulated environment replays the same bytes for the same seed.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random fixed-size array: seeds, one-time sender secrets, nonces.
    fn random_array<const N: usize>(&self) -> [u8; N] {
        let mut bytes = [0u8; N];
        self.random_bytes(&mut bytes);
        bytes
    }
}
