//! Rate limit key extraction.
//!
//! A `KeyFn` is an ordered list of extractors. Each extractor derives one
//! string from the request; the results are joined with `:` in order. If any
//! extractor fails the whole key fails, so no partial key is ever used.

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderName;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Result, SpeedbumpError};

/// Key used when no extractor is configured: every caller shares one bucket.
pub const GLOBAL_KEY: &str = "*";

/// Separator between the parts of a composed key.
pub const KEY_SEPARATOR: char = ':';

/// Signature of a caller-supplied extractor.
pub type CustomKeyFn = dyn Fn(&Request) -> Result<String> + Send + Sync;

/// One way of deriving part of a rate limit key from a request.
#[derive(Clone)]
pub enum KeyExtractor {
    /// The peer IP address, taken from axum's `ConnectInfo<SocketAddr>`.
    RemoteAddr,
    /// The request path.
    Path,
    /// The value of a request header; fails when the header is absent.
    Header(HeaderName),
    /// A caller-supplied function.
    Custom(Arc<CustomKeyFn>),
}

impl KeyExtractor {
    /// Wrap a closure as an extractor.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Request) -> Result<String> + Send + Sync + 'static,
    {
        KeyExtractor::Custom(Arc::new(f))
    }

    /// Derive this extractor's part of the key.
    pub fn extract(&self, req: &Request) -> Result<String> {
        match self {
            KeyExtractor::RemoteAddr => key_by_ip(req),
            KeyExtractor::Path => Ok(req.uri().path().to_string()),
            KeyExtractor::Header(name) => {
                let value = req.headers().get(name).ok_or_else(|| {
                    SpeedbumpError::KeyResolution(format!("missing header {}", name))
                })?;
                value.to_str().map(str::to_string).map_err(|_| {
                    SpeedbumpError::KeyResolution(format!("header {} is not valid text", name))
                })
            }
            KeyExtractor::Custom(f) => f(req),
        }
    }
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyExtractor::RemoteAddr => write!(f, "RemoteAddr"),
            KeyExtractor::Path => write!(f, "Path"),
            KeyExtractor::Header(name) => write!(f, "Header({})", name),
            KeyExtractor::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

fn key_by_ip(req: &Request) -> Result<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .ok_or_else(|| SpeedbumpError::KeyResolution("remote address unavailable".to_string()))
}

/// An ordered composition of key extractors.
#[derive(Debug, Clone, Default)]
pub struct KeyFn {
    extractors: Vec<KeyExtractor>,
}

impl KeyFn {
    /// Compose `extractors`, evaluated in the given order.
    pub fn new(extractors: Vec<KeyExtractor>) -> Self {
        Self { extractors }
    }

    /// The single global key.
    pub fn global() -> Self {
        Self::default()
    }

    /// Key by peer address.
    pub fn by_ip() -> Self {
        Self::new(vec![KeyExtractor::RemoteAddr])
    }

    /// Key by request path.
    pub fn by_endpoint() -> Self {
        Self::new(vec![KeyExtractor::Path])
    }

    /// The configured extractors.
    pub fn extractors(&self) -> &[KeyExtractor] {
        &self.extractors
    }

    /// Resolve the rate limit key for a request.
    pub fn resolve(&self, req: &Request) -> Result<String> {
        if self.extractors.is_empty() {
            return Ok(GLOBAL_KEY.to_string());
        }

        let mut key = String::new();
        for (i, extractor) in self.extractors.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(&extractor.extract(req)?);
        }
        Ok(key)
    }
}

impl From<Vec<KeyExtractor>> for KeyFn {
    fn from(extractors: Vec<KeyExtractor>) -> Self {
        Self::new(extractors)
    }
}
