//! Time sources for window math and eviction.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock.
///
/// Clones share the same time, so a test can hand one clone to a limiter and
/// its counter store and move time forward through another.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock starting `secs` seconds after the Unix epoch.
    pub fn at_unix(secs: i64) -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(secs))
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock();
        *current += chrono::Duration::milliseconds(duration.as_millis() as i64);
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.current.lock() = instant;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now() > t1);
    }

    #[test]
    fn test_mock_clock_shared_between_clones() {
        let clock = MockClock::at_unix(1_000);
        let other = clock.clone();

        other.advance(Duration::from_secs(10));
        assert_eq!(clock.now().timestamp(), 1_010);

        clock.set(DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(other.now().timestamp(), 0);
    }
}
