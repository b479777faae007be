//! In-process counter store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::bucket::BucketId;
use super::clock::{Clock, SystemClock};
use super::store::CounterStore;
use super::window::Window;
use crate::error::Result;

/// Entries idle for this many windows are dropped.
const EVICTION_WINDOWS: u32 = 3;

/// A single bucket's count.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: u64,
    updated_at: DateTime<Utc>,
    /// Idle time after which the entry is dead, from its own window length
    horizon: chrono::Duration,
}

impl CounterEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        now - self.updated_at <= self.horizon
    }
}

fn horizon_for(window_length: Duration) -> chrono::Duration {
    let horizon = window_length * EVICTION_WINDOWS;
    chrono::Duration::milliseconds(horizon.as_millis() as i64)
}

struct MemoryState {
    counters: HashMap<BucketId, CounterEntry>,
    sweep_interval: chrono::Duration,
    last_evict: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Drop idle entries, at most once per sweep interval.
    fn evict(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_evict {
            if now - last < self.sweep_interval {
                return;
            }
        }
        self.last_evict = Some(now);

        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.is_live(now));

        let evicted = before - self.counters.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.counters.len(), "Evicted idle counters");
        }
    }

    fn read(&self, id: &BucketId, now: DateTime<Utc>) -> u64 {
        self.counters
            .get(id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value)
            .unwrap_or(0)
    }
}

/// Counter store keeping buckets in a process-local map.
///
/// All operations go through one lock. Before each increment, entries that
/// have not been touched for three lengths of their own window are swept, no
/// more often than once per three configured window lengths.
pub struct InMemoryCounter {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounter {
    /// Create an empty store reading time from the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                counters: HashMap::new(),
                sweep_interval: horizon_for(Duration::from_secs(60)),
                last_evict: None,
            }),
            clock,
        }
    }

    /// Number of buckets currently held, including idle ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.lock().counters.len()
    }

    /// Whether the store holds no buckets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounter {
    fn configure(&self, window_length: Duration) {
        self.state.lock().sweep_interval = horizon_for(window_length);
    }

    async fn increment(&self, key: &str, window: &Window, delta: u64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        let now = self.clock.now();
        let id = BucketId::new(key, window);

        let mut state = self.state.lock();
        state.evict(now);

        let horizon = horizon_for(window.length());
        let entry = state.counters.entry(id).or_insert(CounterEntry {
            value: 0,
            updated_at: now,
            horizon,
        });
        if !entry.is_live(now) {
            entry.value = 0;
        }
        entry.value = entry.value.saturating_add(delta);
        entry.horizon = horizon;
        entry.updated_at = now;

        Ok(())
    }

    async fn get(&self, key: &str, current: &Window, previous: &Window) -> Result<(u64, u64)> {
        let now = self.clock.now();
        let current_id = BucketId::new(key, current);
        let previous_id = BucketId::new(key, previous);

        let state = self.state.lock();
        Ok((state.read(&current_id, now), state.read(&previous_id, now)))
    }
}
