//! Time and randomness providers for the negotiation protocol.
//!
//! The negotiator never reads ambient time or randomness directly. Production
//! code uses [`TokioClock`] and [`RandomJitter`] over an entropy-seeded RNG;
//! tests run on tokio's paused clock and seed or script the jitter so
//! elections and timeouts are reproducible.

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tokio::time::Instant;

use crate::config::BackoffWindow;

/// Provider for monotonic time and timer waits.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Suspends for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer.
///
/// Under `tokio::time::pause` this clock is virtual and auto-advances while
/// every task is idle.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Source of randomized backoff delays.
pub trait Jitter: Send {
    /// Picks a delay inside the window (inclusive).
    fn delay(&mut self, window: BackoffWindow) -> Duration;
}

/// Uniform jitter drawn from any RNG.
#[derive(Debug, Clone)]
pub struct RandomJitter<R = StdRng> {
    rng: R,
}

impl RandomJitter<StdRng> {
    /// Creates jitter seeded from OS entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Creates deterministic jitter from a seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl<R: RngCore> RandomJitter<R> {
    /// Wraps an existing RNG.
    #[must_use]
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl<R: RngCore + Send> Jitter for RandomJitter<R> {
    fn delay(&mut self, window: BackoffWindow) -> Duration {
        let min = duration_millis(window.min);
        let max = duration_millis(window.max).max(min);
        Duration::from_millis(self.rng.gen_range(min..=max))
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_inside_window() {
        let window = BackoffWindow::new(Duration::from_millis(100), Duration::from_millis(300));
        let mut jitter = RandomJitter::seeded(7);
        for _ in 0..200 {
            let d = jitter.delay(window);
            assert!(d >= window.min && d <= window.max, "{d:?} outside window");
        }
    }

    #[test]
    fn seeded_jitter_is_reproducible() {
        let window = BackoffWindow::new(Duration::from_secs(1), Duration::from_secs(3));
        let mut a = RandomJitter::seeded(42);
        let mut b = RandomJitter::seeded(42);
        for _ in 0..10 {
            assert_eq!(a.delay(window), b.delay(window));
        }
    }

    #[test]
    fn degenerate_window_returns_min() {
        let window = BackoffWindow::new(Duration::from_millis(250), Duration::from_millis(250));
        assert_eq!(
            RandomJitter::seeded(1).delay(window),
            Duration::from_millis(250)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_advances_virtually() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(30));
    }
}
