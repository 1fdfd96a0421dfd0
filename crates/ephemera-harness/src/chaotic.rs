//! Chaotic API wrapper for fault injection testing
//!
//! Wraps an [`EkApi`] and randomly fails calls to exercise the publication
//! failure semantics. Two failure shapes are injected:
//!
//! - the request never reaches the server (nothing changes server side)
//! - the server applies the request but the response is lost (the caller
//!   sees an error although the new generation is live)
//!
//! Device posts are only ever dropped. The device store holds the only copy
//! of a device seed, so a device statement that went live without its seed
//! is a lost key rather than a recoverable fault.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use ephemera_core::{
    DeviceId, EkApi, TeamEkBoxMetadata, TeamId, TransportError, Uid, UserEkBoxMetadata,
};

/// Chaotic API wrapper that randomly injects failures
///
/// Uses `Arc<Mutex<>>` for the RNG state, making it Clone and thread-safe.
#[derive(Clone)]
pub struct ChaoticApi<A: EkApi> {
    inner: A,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// Share of failed posts that still reach the server
    lost_response_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
    injected_failures: Arc<AtomicUsize>,
}

/// Simple deterministic RNG for chaos injection
///
/// Linear congruential generator: fast, and reproducible from the seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate next random value [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // LCG constants from Numerical Recipes
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

/// Outcome drawn for one call.
enum Fault {
    None,
    Dropped,
    LostResponse,
}

impl<A: EkApi> ChaoticApi<A> {
    /// Create a new chaotic API wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: A, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: A, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            lost_response_rate: 0.5,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
            injected_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Share of injected post failures that still reach the server.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not in [0.0, 1.0]
    #[must_use]
    pub fn with_lost_response_rate(mut self, rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "lost_response_rate must be in [0.0, 1.0], got {rate}");
        self.lost_response_rate = rate;
        self
    }

    /// Underlying API (for checking invariants after chaos).
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Total number of API calls attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::SeqCst)
    }

    /// Number of calls that returned an injected error.
    pub fn injected_failures(&self) -> usize {
        self.injected_failures.load(Ordering::SeqCst)
    }

    fn draw(&self) -> Fault {
        self.operation_count.fetch_add(1, Ordering::SeqCst);

        #[allow(clippy::expect_used)]
        let mut rng = self.rng.lock().expect("ChaoticRng mutex poisoned");
        if rng.next() >= self.failure_rate {
            return Fault::None;
        }
        self.injected_failures.fetch_add(1, Ordering::SeqCst);
        if rng.next() < self.lost_response_rate { Fault::LostResponse } else { Fault::Dropped }
    }

    fn chaos_error() -> TransportError {
        TransportError::Network("chaotic failure injection".to_string())
    }

    /// Run a state-changing call under the drawn fault.
    async fn post<F>(&self, call: F) -> Result<(), TransportError>
    where
        F: Future<Output = Result<(), TransportError>> + Send,
    {
        match self.draw() {
            Fault::None => call.await,
            Fault::Dropped => Err(Self::chaos_error()),
            Fault::LostResponse => {
                let _ = call.await;
                Err(Self::chaos_error())
            },
        }
    }

    /// Run a call that must not be half-applied, or a read. A lost response
    /// is just a failure.
    async fn drop_only<T, F>(&self, call: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>> + Send,
    {
        match self.draw() {
            Fault::None => call.await,
            Fault::Dropped | Fault::LostResponse => Err(Self::chaos_error()),
        }
    }
}

#[async_trait]
impl<A: EkApi> EkApi for ChaoticApi<A> {
    async fn post_device_ek(&self, device: &DeviceId, sig: &str) -> Result<(), TransportError> {
        self.drop_only(self.inner.post_device_ek(device, sig)).await
    }

    async fn post_user_ek(
        &self,
        sig: &str,
        boxes: &[UserEkBoxMetadata],
    ) -> Result<(), TransportError> {
        self.post(self.inner.post_user_ek(sig, boxes)).await
    }

    async fn get_user_ek_statement(&self, uid: &Uid) -> Result<Option<String>, TransportError> {
        self.drop_only(self.inner.get_user_ek_statement(uid)).await
    }

    async fn post_team_ek(
        &self,
        team: &TeamId,
        sig: &str,
        boxes: &[TeamEkBoxMetadata],
    ) -> Result<(), TransportError> {
        self.post(self.inner.post_team_ek(team, sig, boxes)).await
    }

    async fn get_team_ek_statement(
        &self,
        team: &TeamId,
    ) -> Result<Option<String>, TransportError> {
        self.drop_only(self.inner.get_team_ek_statement(team)).await
    }
}
