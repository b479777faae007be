//! Rate limit rule configuration.
//!
//! A rule binds a route path to a limit, a window and a key recipe. Rules are
//! loaded as part of the service configuration and turned into
//! `RateLimiterConfig`s at startup.

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::key::{KeyExtractor, KeyFn};
use super::limiter::RateLimiterConfig;
use crate::error::{Result, SpeedbumpError};

/// A rate limit rule for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Route path the rule governs
    pub path: String,
    /// Requests admitted per window
    pub request_limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Key recipe, evaluated in order; empty means one global key
    #[serde(default)]
    pub keys: Vec<KeySpec>,
    /// Disabled rules serve their route without a limiter
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Serializable form of a key extractor.
///
/// Written as `remote_addr`, `path` or `header:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeySpec {
    /// Peer IP address
    RemoteAddr,
    /// Request path
    Path,
    /// Named request header
    Header(String),
}

impl TryFrom<String> for KeySpec {
    type Error = SpeedbumpError;

    fn try_from(value: String) -> Result<Self> {
        match value.as_str() {
            "remote_addr" => Ok(KeySpec::RemoteAddr),
            "path" => Ok(KeySpec::Path),
            other => match other.strip_prefix("header:") {
                Some(name) if !name.trim().is_empty() => Ok(KeySpec::Header(name.trim().to_string())),
                _ => Err(SpeedbumpError::Config(format!("unknown key extractor {:?}", other))),
            },
        }
    }
}

impl From<KeySpec> for String {
    fn from(spec: KeySpec) -> Self {
        match spec {
            KeySpec::RemoteAddr => "remote_addr".to_string(),
            KeySpec::Path => "path".to_string(),
            KeySpec::Header(name) => format!("header:{}", name),
        }
    }
}

impl KeySpec {
    /// Build the extractor this spec names.
    pub fn to_extractor(&self) -> Result<KeyExtractor> {
        match self {
            KeySpec::RemoteAddr => Ok(KeyExtractor::RemoteAddr),
            KeySpec::Path => Ok(KeyExtractor::Path),
            KeySpec::Header(name) => HeaderName::try_from(name.as_str())
                .map(KeyExtractor::Header)
                .map_err(|e| SpeedbumpError::Config(format!("invalid header name {:?}: {}", name, e))),
        }
    }
}

impl RuleConfig {
    /// Check the rule in isolation.
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(SpeedbumpError::Config(format!(
                "rule path {:?} must start with '/'",
                self.path
            )));
        }
        if self.window_secs == 0 {
            return Err(SpeedbumpError::Config(format!(
                "rule {} has a zero-length window",
                self.path
            )));
        }
        for key in &self.keys {
            key.to_extractor()?;
        }
        Ok(())
    }

    /// Build the limiter configuration for this rule.
    pub fn limiter_config(&self) -> Result<RateLimiterConfig> {
        self.validate()?;
        let extractors = self
            .keys
            .iter()
            .map(KeySpec::to_extractor)
            .collect::<Result<Vec<_>>>()?;

        Ok(RateLimiterConfig::new(self.request_limit, Duration::from_secs(self.window_secs))
            .with_key_fn(KeyFn::new(extractors)))
    }
}
