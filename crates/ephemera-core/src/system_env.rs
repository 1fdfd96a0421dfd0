//! Production [`Environment`]: `std::time::Instant` and the OS RNG.

use crate::env::Environment;

/// Environment backed by the system clock and `getrandom`.
///
/// # Panics
///
/// `random_bytes` panics if the OS RNG fails. Minting a key from anything
/// else would produce a guessable seed.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// System environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure leaves no safe way to mint keys");
    }
}
