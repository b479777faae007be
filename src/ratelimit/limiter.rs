//! Core rate limiter implementation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};
use super::key::KeyFn;
use super::memory::InMemoryCounter;
use super::store::CounterStore;
use super::window::{sliding_estimate, Window};
use crate::error::{Result, SpeedbumpError};

/// Number of lock shards serializing check-and-increment per key.
const LOCK_SHARDS: usize = 64;

/// Configuration for a rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum requests admitted per window
    pub request_limit: u64,
    /// Length of one window; at least one second
    pub window_length: Duration,
    /// How the rate limit key is derived from a request
    pub key_fn: KeyFn,
}

impl RateLimiterConfig {
    /// A configuration using the global key.
    pub fn new(request_limit: u64, window_length: Duration) -> Self {
        Self {
            request_limit,
            window_length,
            key_fn: KeyFn::global(),
        }
    }

    /// Replace the key function.
    pub fn with_key_fn(mut self, key_fn: impl Into<KeyFn>) -> Self {
        self.key_fn = key_fn.into();
        self
    }

    /// Check the configuration.
    ///
    /// Bucket identities and store expiry are second-granular, so windows
    /// shorter than a second are rejected.
    pub fn validate(&self) -> Result<()> {
        if self.window_length < Duration::from_secs(1) {
            return Err(SpeedbumpError::Config(format!(
                "window length must be at least 1s, got {:?}",
                self.window_length
            )));
        }
        Ok(())
    }
}

/// Read-only view of a key's current rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    /// Whether a request arriving now would be admitted
    pub allowed: bool,
    /// Interpolated request count over the sliding window
    pub estimate: f64,
    /// The window containing the observation instant
    pub window: Window,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request was admitted (and counted)
    pub allowed: bool,
    /// The configured request limit
    pub limit: u64,
    /// Requests still available, counting this one if it was admitted
    pub remaining: u64,
    /// Start of the next window, in Unix seconds
    pub reset: i64,
    /// How long a rejected caller should wait
    pub retry_after: Option<Duration>,
    /// The interpolated estimate the decision was based on
    pub estimate: f64,
}

/// A sliding-window rate limiter over a pluggable counter store.
///
/// The window is approximated with two fixed buckets: the previous bucket's
/// count is weighted by how much of the current window remains, and the
/// current bucket's count is added in full. Rejected requests are not
/// counted.
///
/// Read, decide and increment run as one unit per key: keys hash onto a fixed
/// set of async locks, so requests for the same key are serialized while
/// unrelated keys proceed in parallel, even across store round trips.
pub struct RateLimiter {
    request_limit: u64,
    window_length: Duration,
    key_fn: KeyFn,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    locks: Vec<Mutex<()>>,
}

impl RateLimiter {
    /// Create a rate limiter over a fresh in-memory counter.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(InMemoryCounter::new()))
    }

    /// Create a rate limiter over the given counter store.
    pub fn with_store(config: RateLimiterConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;
        store.configure(config.window_length);

        info!(
            limit = config.request_limit,
            window = ?config.window_length,
            keys = ?config.key_fn,
            "Rate limiter initialized"
        );

        Ok(Self {
            request_limit: config.request_limit,
            window_length: config.window_length,
            key_fn: config.key_fn,
            store,
            clock: Arc::new(SystemClock::new()),
            locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The configured request limit.
    pub fn request_limit(&self) -> u64 {
        self.request_limit
    }

    /// The configured window length.
    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    /// The key function requests are resolved with.
    pub fn key_fn(&self) -> &KeyFn {
        &self.key_fn
    }

    /// Estimate the current rate for `key` without counting anything.
    pub async fn status(&self, key: &str) -> Result<Status> {
        let now = self.clock.now();
        let window = Window::containing(now, self.window_length);
        let previous = window.previous();

        let (current_count, previous_count) = self.store.get(key, &window, &previous).await?;
        let estimate = sliding_estimate(
            previous_count,
            current_count,
            window.elapsed(now),
            self.window_length,
        );

        trace!(
            key = %key,
            window = %window,
            current = current_count,
            previous = previous_count,
            estimate,
            "Computed sliding estimate"
        );

        Ok(Status {
            allowed: (estimate.round() as u64) < self.request_limit,
            estimate,
            window,
        })
    }

    /// Check a single request for `key`, counting it if admitted.
    pub async fn check(&self, key: &str) -> Result<Decision> {
        self.check_weighted(key, 1).await
    }

    /// Check a request of the given weight for `key`.
    ///
    /// Admission depends only on the current estimate being below the
    /// limit; an admitted request then adds `weight` to the current bucket.
    pub async fn check_weighted(&self, key: &str, weight: u64) -> Result<Decision> {
        let _guard = self.lock_for(key).lock().await;

        let status = self.status(key).await?;
        let rounded = status.estimate.round() as u64;
        let reset = status.window.reset_unix();

        if !status.allowed {
            debug!(
                key = %key,
                estimate = status.estimate,
                limit = self.request_limit,
                "Rate limit exceeded"
            );
            return Ok(Decision {
                allowed: false,
                limit: self.request_limit,
                remaining: 0,
                reset,
                retry_after: Some(self.window_length),
                estimate: status.estimate,
            });
        }

        self.store.increment(key, &status.window, weight).await?;

        Ok(Decision {
            allowed: true,
            limit: self.request_limit,
            remaining: self
                .request_limit
                .saturating_sub(rounded.saturating_add(weight)),
            reset,
            retry_after: None,
            estimate: status.estimate,
        })
    }

    fn lock_for(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }
}
