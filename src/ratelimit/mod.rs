//! Rate accounting: sliding-window math, counter stores and key extraction.

mod bucket;
mod clock;
mod key;
mod limiter;
mod memory;
mod redis_counter;
mod rules;
mod store;
mod window;

pub use bucket::BucketId;
pub use clock::{Clock, MockClock, SystemClock};
pub use key::{CustomKeyFn, KeyExtractor, KeyFn, GLOBAL_KEY, KEY_SEPARATOR};
pub use limiter::{Decision, RateLimiter, RateLimiterConfig, Status};
pub use memory::InMemoryCounter;
pub use redis_counter::{RedisConfig, RedisCounter};
pub use rules::{KeySpec, RuleConfig};
pub use store::CounterStore;
pub use window::{sliding_estimate, Window};
