//! Production implementation of LifelineContext using Tokio.

use crate::LifelineContext;
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Production context backed by Tokio and the thread-local RNG.
///
/// This is the "real" implementation used in production deployments.
/// Time comes from the system clock, randomness from `thread_rng`.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LifelineContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_unit(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        rand::thread_rng().fill(buf);
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_tokio_context_random_unit_range() {
        let ctx = TokioContext::new();
        for _ in 0..100 {
            let u = ctx.random_unit();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_tokio_context_fill_random() {
        let ctx = TokioContext::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        ctx.fill_random(&mut a);
        ctx.fill_random(&mut b);

        // In production, ids should be different (random)
        assert_ne!(a, b);
    }

    #[test]
    fn test_tokio_context_seed() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
