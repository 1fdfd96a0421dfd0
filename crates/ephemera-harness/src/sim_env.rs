//! Simulation environment: virtual clock and seeded RNG.
//!
//! Time only moves when a test calls [`SimEnv::advance`]. Randomness comes
//! from a `ChaCha20Rng` seeded by the test, so every seed, box and nonce is
//! reproducible from the seed alone.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::{
    ops::Sub,
    sync::{Arc, Mutex},
    time::Duration,
};

use ephemera_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Point on the virtual timeline, measured from simulation start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Deterministic environment for simulation tests.
///
/// Clones share the clock and the RNG stream.
#[derive(Clone)]
pub struct SimEnv {
    clock: Arc<Mutex<Duration>>,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            clock: Arc::new(Mutex::new(Duration::ZERO)),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
        }
    }

    /// Move the virtual clock forward.
    pub fn advance(&self, by: Duration) {
        #[allow(clippy::expect_used)]
        let mut clock = self.clock.lock().expect("SimEnv clock mutex poisoned");
        *clock += by;
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        #[allow(clippy::expect_used)]
        SimInstant(*self.clock.lock().expect("SimEnv clock mutex poisoned"))
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        #[allow(clippy::expect_used)]
        self.rng.lock().expect("SimEnv rng mutex poisoned").fill_bytes(buffer);
    }
}
