//! Counter store trait for abstracting local and shared implementations.

use async_trait::async_trait;
use std::time::Duration;

use super::window::Window;
use crate::error::Result;

/// Storage for per-key, per-window hit counts.
///
/// This trait abstracts over the in-process `InMemoryCounter` and the shared
/// `RedisCounter` so a `RateLimiter` works with either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Set the window length used for housekeeping. Idempotent.
    fn configure(&self, window_length: Duration);

    /// Add `delta` hits to the bucket for `key` in `window`.
    ///
    /// Missing buckets start at zero. Concurrent increments of the same
    /// bucket must not lose updates.
    async fn increment(&self, key: &str, window: &Window, delta: u64) -> Result<()>;

    /// Read the counts of the current and previous buckets for `key`.
    ///
    /// Missing buckets read as zero. Reading never mutates the store.
    async fn get(&self, key: &str, current: &Window, previous: &Window) -> Result<(u64, u64)>;
}
