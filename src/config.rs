//! Configuration management for speedbump.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{Result, SpeedbumpError};
use crate::http::FailurePolicy;
use crate::ratelimit::{KeySpec, RedisConfig, RuleConfig};

/// Main configuration for the speedbump service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedbumpConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store backing every rule
    #[serde(default)]
    pub store: StoreConfig,

    /// Behaviour when the counter store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Per-route rate limit rules
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
}

impl Default for SpeedbumpConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            failure_policy: FailurePolicy::default(),
            rules: default_rules(),
        }
    }
}

fn default_rules() -> Vec<RuleConfig> {
    vec![RuleConfig {
        path: "/".to_string(),
        request_limit: 100,
        window_secs: 60,
        keys: vec![KeySpec::RemoteAddr],
        enabled: true,
    }]
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store to use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis(RedisConfig),
}

impl SpeedbumpConfig {
    /// Load configuration from a YAML file, overlaid with `SPEEDBUMP__*`
    /// environment variables (e.g. `SPEEDBUMP__SERVER__LISTEN_ADDR`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let config: SpeedbumpConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("SPEEDBUMP").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SpeedbumpError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SpeedbumpConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SpeedbumpError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if let StoreConfig::Redis(redis) = &self.store {
            redis.validate()?;
        }

        let mut paths = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !paths.insert(rule.path.as_str()) {
                return Err(SpeedbumpError::Config(format!(
                    "duplicate rule for path {}",
                    rule.path
                )));
            }
        }
        Ok(())
    }
}
