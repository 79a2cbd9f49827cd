//! Core environment context trait for Lifeline engines.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the connection machine,
/// the replay engine and the fusion session can run in both production
/// (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `thread_rng`
/// - **Simulation**: `SimContext` - manual virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// For DST, all methods that would normally introduce non-determinism
/// (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait LifelineContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Every timer deadline (heartbeat, watchdog, reconnect, typing,
    /// replay) is expressed on this clock.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time, used to stamp samples produced
    /// inside the core (IP estimates).
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Returns a uniformly distributed value in `[0, 1)`.
    ///
    /// Drives backoff jitter. In simulation this is derived from the
    /// master seed so reconnect schedules are reproducible.
    fn random_unit(&self) -> f64;

    /// Fills `buf` with random bytes (client message ids).
    fn fill_random(&self, buf: &mut [u8]);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the master seed.
    fn seed(&self) -> u64;
}
