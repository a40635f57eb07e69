//! Abstraction over wall-clock time and sleeping, so the scheduler's
//! due-detection loop can be driven by simulated time in tests instead of
//! real delays.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A source of the current time and a way to suspend for a duration.
///
/// Production code uses [`RealTimeProvider`]; tests use [`MockTimeProvider`]
/// to collapse sleeps so a scheduler loop can be exercised through many
/// cycles without the test actually waiting.
#[async_trait]
pub trait TimeProvider: Send + Sync {
    /// Returns the current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the caller for approximately `duration`.
    async fn sleep(&self, duration: Duration);

    /// Whether this provider is configured to collapse real delays.
    /// Defaults to `false`.
    fn should_skip_delays(&self) -> bool {
        false
    }
}

/// Production time provider backed by the system clock and `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealTimeProvider;

#[async_trait]
impl TimeProvider for RealTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test time provider that can report an arbitrary "current" time and
/// optionally collapse sleeps to near-zero so loops run quickly.
#[derive(Debug, Clone)]
pub struct MockTimeProvider {
    now: Arc<std::sync::Mutex<DateTime<Utc>>>,
    skip_delays: bool,
}

impl MockTimeProvider {
    /// Creates a mock fixed at `start`, collapsing sleeps to at most 1ms.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(start)),
            skip_delays: true,
        }
    }

    /// Creates a mock fixed at `start` that sleeps for the real duration.
    /// Useful for timeout-boundary tests that must observe real elapsed
    /// time.
    #[must_use]
    pub fn with_real_delays(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(start)),
            skip_delays: false,
        }
    }

    /// Advances the mock clock by `duration`.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut guard = self.now.lock().expect("mock time mutex poisoned");
        *guard += duration;
    }

    /// Sets the mock clock to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().expect("mock time mutex poisoned") = at;
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("mock time mutex poisoned")
    }

    async fn sleep(&self, duration: Duration) {
        if self.skip_delays {
            tokio::time::sleep(Duration::from_millis(1)).await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }

    fn should_skip_delays(&self) -> bool {
        self.skip_delays
    }
}

/// Shared, type-erased time provider handle passed into every component that
/// needs the clock.
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Builds the time provider used by production binaries.
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider)
}

/// Builds a fast, delay-skipping time provider for unit tests.
#[must_use]
pub fn test_time_provider() -> SharedTimeProvider {
    Arc::new(MockTimeProvider::new(Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_sleep_is_fast_by_default() {
        let provider = MockTimeProvider::new(Utc::now());
        let start = std::time::Instant::now();
        provider.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn real_delay_mock_actually_waits() {
        let provider = MockTimeProvider::with_real_delays(Utc::now());
        let start = std::time::Instant::now();
        provider.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn advance_moves_clock_forward() {
        let start = Utc::now();
        let provider = MockTimeProvider::new(start);
        provider.advance(chrono::Duration::seconds(10));
        assert!(provider.now() >= start + chrono::Duration::seconds(10));
    }
}
