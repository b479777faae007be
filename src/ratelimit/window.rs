//! Fixed-length time windows and the sliding estimate built on them.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// A window boundary: an instant truncated to a multiple of the window length.
///
/// Windows are aligned to the Unix epoch and tracked in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    start_ms: i64,
    length_ms: i64,
}

impl Window {
    /// The window of `length` containing `now`.
    pub fn containing(now: DateTime<Utc>, length: Duration) -> Self {
        let length_ms = (length.as_millis() as i64).max(1);
        let now_ms = now.timestamp_millis();
        Self {
            start_ms: now_ms - now_ms.rem_euclid(length_ms),
            length_ms,
        }
    }

    /// The window immediately preceding this one.
    pub fn previous(&self) -> Self {
        Self {
            start_ms: self.start_ms - self.length_ms,
            length_ms: self.length_ms,
        }
    }

    /// Window start, in Unix seconds.
    pub fn start_unix(&self) -> i64 {
        self.start_ms.div_euclid(1000)
    }

    /// Start of the following window, in Unix seconds.
    pub fn reset_unix(&self) -> i64 {
        (self.start_ms + self.length_ms).div_euclid(1000)
    }

    /// Length of this window.
    pub fn length(&self) -> Duration {
        Duration::from_millis(self.length_ms as u64)
    }

    /// Time elapsed since the window started, clamped to `[0, length]`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = (now.timestamp_millis() - self.start_ms).clamp(0, self.length_ms);
        Duration::from_millis(elapsed as u64)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}ms", self.start_unix(), self.length_ms)
    }
}

/// Interpolated request count for a sliding window spanning two buckets.
///
/// The previous bucket is weighted by the fraction of the current window
/// still to run, so it decays linearly from full weight at the window start
/// to nothing at its end.
pub fn sliding_estimate(previous: u64, current: u64, elapsed: Duration, length: Duration) -> f64 {
    let length = length.as_secs_f64();
    if length <= 0.0 {
        return current as f64;
    }
    let remaining = (length - elapsed.as_secs_f64()).max(0.0);
    previous as f64 * remaining / length + current as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    #[test]
    fn test_window_truncates_to_boundary() {
        let window = Window::containing(at_millis(1_234_567), Duration::from_secs(10));
        assert_eq!(window.start_unix(), 1_230);
        assert_eq!(window.reset_unix(), 1_240);
        assert_eq!(window.elapsed(at_millis(1_234_567)), Duration::from_millis(4_567));
    }

    #[test]
    fn test_previous_window() {
        let window = Window::containing(at_millis(60_000), Duration::from_secs(60));
        let previous = window.previous();
        assert_eq!(window.start_unix(), 60);
        assert_eq!(previous.start_unix(), 0);
        assert_eq!(previous.length(), Duration::from_secs(60));
    }

    #[test]
    fn test_estimate_at_window_start_is_previous_count() {
        let length = Duration::from_secs(10);
        assert_eq!(sliding_estimate(7, 0, Duration::ZERO, length), 7.0);
    }

    #[test]
    fn test_estimate_decays_towards_window_end() {
        let length = Duration::from_secs(10);
        let halfway = sliding_estimate(10, 2, Duration::from_secs(5), length);
        assert!((halfway - 7.0).abs() < f64::EPSILON);

        let almost_over = sliding_estimate(10, 2, Duration::from_millis(9_999), length);
        assert!(almost_over - 2.0 < 0.01);
    }

    #[test]
    fn test_elapsed_is_clamped() {
        let window = Window::containing(at_millis(10_000), Duration::from_secs(10));
        assert_eq!(window.elapsed(at_millis(9_000)), Duration::ZERO);
        assert_eq!(window.elapsed(at_millis(25_000)), Duration::from_secs(10));
    }
}
