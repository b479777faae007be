//! Redis-backed counter store.
//!
//! Lets several serving processes share one view of the counts. Each bucket
//! is a plain integer key, `<prefix><bucket digest>`, updated with `INCRBY`
//! and given a fresh `EXPIRE` of three window lengths on every increment, so
//! idle keys clean themselves up without a sweeper.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::bucket::BucketId;
use super::store::CounterStore;
use super::window::Window;
use crate::error::{Result, SpeedbumpError};

/// Keys idle for this many windows expire.
const EXPIRY_WINDOWS: u64 = 3;

/// Connection settings for the Redis counter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db_index: i64,

    /// Number of multiplexed connections to spread commands over
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Prefix applied to every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password: None,
            db_index: 0,
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    50
}

fn default_key_prefix() -> String {
    "speedbump:".to_string()
}

impl RedisConfig {
    /// Check the settings before dialing.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(SpeedbumpError::Config("redis host must not be empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(SpeedbumpError::Config("redis pool_size must be at least 1".to_string()));
        }
        Ok(())
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db_index,
                username: None,
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

/// Counter store backed by a shared Redis server.
///
/// Clones made with `scoped` share the connection pool but write under their
/// own key namespace, so several limiters can use one server without their
/// buckets colliding.
pub struct RedisCounter {
    connections: Arc<[ConnectionManager]>,
    next: Arc<AtomicUsize>,
    key_prefix: String,
}

impl fmt::Debug for RedisCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounter")
            .field("connections", &self.connections.len())
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCounter {
    /// Dial Redis with the given settings.
    ///
    /// # Errors
    /// Returns `BackendConstruction` if the server cannot be reached or does
    /// not answer `PING`. There is no fallback store.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::open(config.connection_info())
            .map_err(|e| SpeedbumpError::BackendConstruction(e.to_string()))?;
        Self::from_client(client, config).await
    }

    /// Build the store around a pre-built client.
    ///
    /// Only `pool_size` and `key_prefix` are read from `config`.
    pub async fn from_client(client: Client, config: &RedisConfig) -> Result<Self> {
        config.validate()?;
        probe(&client).await?;

        let mut connections = Vec::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            let connection = ConnectionManager::new(client.clone())
                .await
                .map_err(|e| SpeedbumpError::BackendConstruction(e.to_string()))?;
            connections.push(connection);
        }

        info!(
            pool_size = config.pool_size,
            key_prefix = %config.key_prefix,
            "Redis counter store connected"
        );

        Ok(Self {
            connections: connections.into(),
            next: Arc::new(AtomicUsize::new(0)),
            key_prefix: config.key_prefix.clone(),
        })
    }

    /// A store over the same connections whose keys live under
    /// `<prefix><namespace>:`.
    pub fn scoped(&self, namespace: &str) -> Self {
        Self {
            connections: self.connections.clone(),
            next: self.next.clone(),
            key_prefix: format!("{}{}:", self.key_prefix, namespace),
        }
    }

    /// The prefix applied to this store's bucket keys.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// The Redis key holding the bucket for `key` in `window`.
    pub fn bucket_key(&self, key: &str, window: &Window) -> String {
        BucketId::new(key, window).namespaced(&self.key_prefix)
    }

    /// Expiry applied to bucket keys written in `window`, in whole seconds
    /// rounded up.
    pub fn expiry_secs(window: &Window) -> u64 {
        let secs = window.length().as_secs_f64() * EXPIRY_WINDOWS as f64;
        (secs.ceil() as u64).max(1)
    }

    fn connection(&self) -> ConnectionManager {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}

/// Fail unless the server answers `PING`.
async fn probe(client: &Client) -> Result<()> {
    let mut connection = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| {
            warn!(error = %e, "Unable to dial redis");
            SpeedbumpError::BackendConstruction(format!("unable to dial redis: {}", e))
        })?;

    let pong: String = redis::cmd("PING")
        .query_async(&mut connection)
        .await
        .map_err(|e| SpeedbumpError::BackendConstruction(format!("redis PING failed: {}", e)))?;

    debug!(reply = %pong, "Redis probe succeeded");
    Ok(())
}

#[async_trait]
impl CounterStore for RedisCounter {
    fn configure(&self, window_length: Duration) {
        // Expiry is taken from each written window; nothing to set up.
        debug!(window = ?window_length, prefix = %self.key_prefix, "Redis counter configured");
    }

    async fn increment(&self, key: &str, window: &Window, delta: u64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        let bucket = self.bucket_key(key, window);
        let mut connection = self.connection();

        redis::pipe()
            .atomic()
            .cmd("INCRBY")
            .arg(&bucket)
            .arg(delta)
            .ignore()
            .cmd("EXPIRE")
            .arg(&bucket)
            .arg(Self::expiry_secs(window))
            .ignore()
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(|e| {
                SpeedbumpError::StoreWrite(format!("unable to increment key {}: {}", bucket, e))
            })
    }

    async fn get(&self, key: &str, current: &Window, previous: &Window) -> Result<(u64, u64)> {
        let current_key = self.bucket_key(key, current);
        let previous_key = self.bucket_key(key, previous);
        let mut connection = self.connection();

        let values: Vec<Option<u64>> = redis::cmd("MGET")
            .arg(&current_key)
            .arg(&previous_key)
            .query_async(&mut connection)
            .await
            .map_err(|e| SpeedbumpError::StoreRead(format!("unable to read counters: {}", e)))?;

        match values.as_slice() {
            [current, previous] => Ok((current.unwrap_or(0), previous.unwrap_or(0))),
            other => Err(SpeedbumpError::StoreRead(format!(
                "expected 2 values from MGET, got {}",
                other.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert_eq!(config.pool_size, 50);
        assert_eq!(config.db_index, 0);
        assert_eq!(config.key_prefix, "speedbump:");
    }

    #[test]
    fn test_config_from_partial_yaml() {
        let config: RedisConfig = serde_yaml::from_str("host: cache.internal\npool_size: 4\n").unwrap();
        assert_eq!(config.host, "cache.internal");
        assert_eq!(config.port, 6379);
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let config = RedisConfig {
            pool_size: 0,
            ..RedisConfig::default()
        };
        assert!(matches!(config.validate(), Err(SpeedbumpError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_construction() {
        let config = RedisConfig {
            port: 1,
            pool_size: 1,
            ..RedisConfig::default()
        };

        let result = RedisCounter::connect(&config).await;
        assert!(matches!(result, Err(SpeedbumpError::BackendConstruction(_))));
    }

    #[test]
    fn test_expiry_rounds_up_fractional_windows() {
        let at = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH + chrono::Duration::seconds(1_000);
        let fractional = Window::containing(at, Duration::from_millis(1_900));
        assert_eq!(RedisCounter::expiry_secs(&fractional), 6);

        let whole = Window::containing(at, Duration::from_secs(10));
        assert_eq!(RedisCounter::expiry_secs(&whole), 30);
    }
}
