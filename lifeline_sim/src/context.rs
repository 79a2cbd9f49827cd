//! Simulation context implementing LifelineContext for deterministic testing.

use async_trait::async_trait;
use lifeline_env::LifelineContext;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `LifelineContext` using:
/// - A virtual clock that only moves when the runner advances it
/// - A seeded ChaCha8 RNG for backoff jitter and message ids
/// - Simulated sleep that advances virtual time
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Deterministic RNG for jitter and ids
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time += duration.as_nanos() as u64;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap()
    }

    /// Virtual wall-clock time in Unix milliseconds (sample timestamps).
    pub fn unix_ms(&self) -> i64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl LifelineContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.virtual_time_ns.lock().unwrap())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // In simulation, sleep advances virtual time
        self.advance_time(duration);
    }

    fn random_unit(&self) -> f64 {
        self.rng.lock().unwrap().gen::<f64>()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buf);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.unix_ms(), 1_704_067_201_500);
    }

    #[test]
    fn test_sim_context_deterministic_randomness() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);

        let a: Vec<f64> = (0..8).map(|_| ctx1.random_unit()).collect();
        let b: Vec<f64> = (0..8).map(|_| ctx2.random_unit()).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|u| (0.0..1.0).contains(u)));

        let mut id1 = [0u8; 16];
        let mut id2 = [0u8; 16];
        ctx1.fill_random(&mut id1);
        ctx2.fill_random(&mut id2);
        assert_eq!(id1, id2);

        let other = SimContext::new(43);
        assert_ne!(a[0], other.random_unit());
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_time() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_secs(3)).await;
        assert_eq!(ctx.now(), Duration::from_secs(3));
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
    }
}
