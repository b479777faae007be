//! HTTP server hosting rate-limited routes.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::{FailurePolicy, RateLimitLayer};
use crate::config::{SpeedbumpConfig, StoreConfig};
use crate::error::Result;
use crate::ratelimit::{CounterStore, InMemoryCounter, RateLimiter, RedisCounter, RuleConfig};

/// JSON rejection used by the hosted routes.
fn json_rejection(retry_after: u64) -> impl Fn(Request) -> Response + Send + Sync + 'static {
    move |_req| {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "rate_limited",
                "retry_after": retry_after,
            })),
        )
            .into_response()
    }
}

/// Where each rule's counters live.
///
/// Every rule gets a store of its own: a fresh in-process map, or a view of
/// the shared Redis pool namespaced by the rule's path. Two rules never count
/// into the same buckets, whatever their keys or windows.
#[derive(Debug)]
pub enum CounterBackend {
    /// One in-memory counter per rule
    Memory,
    /// One Redis connection pool, one key namespace per rule
    Redis(RedisCounter),
}

impl CounterBackend {
    /// Set up the backend named by the configuration.
    ///
    /// An unreachable Redis server fails here; there is no fallback store.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        match config {
            StoreConfig::Memory => {
                info!("Using in-memory counter stores");
                Ok(CounterBackend::Memory)
            }
            StoreConfig::Redis(redis) => {
                info!(host = %redis.host, port = redis.port, db = redis.db_index, "Using redis counter store");
                Ok(CounterBackend::Redis(RedisCounter::connect(redis).await?))
            }
        }
    }

    /// The store backing `rule`.
    pub fn store_for(&self, rule: &RuleConfig) -> Arc<dyn CounterStore> {
        match self {
            CounterBackend::Memory => Arc::new(InMemoryCounter::new()),
            CounterBackend::Redis(redis) => Arc::new(redis.scoped(&rule.path)),
        }
    }
}

/// The layer enforcing one rule over its own store.
pub fn rule_layer(
    rule: &RuleConfig,
    store: Arc<dyn CounterStore>,
    failure_policy: FailurePolicy,
) -> Result<RateLimitLayer> {
    let limiter = RateLimiter::with_store(rule.limiter_config()?, store)?;
    Ok(RateLimitLayer::new(Arc::new(limiter))
        .with_rejection_handler(json_rejection(rule.window_secs))
        .with_failure_policy(failure_policy))
}

/// Build a router with one route per rule, each behind its own limiter.
pub fn build_router(config: &SpeedbumpConfig, backend: &CounterBackend) -> Result<Router> {
    let mut router = Router::new();

    for rule in &config.rules {
        let body = format!("{}\n", rule.path);
        let mut route = get(move || async move { body });

        if rule.enabled {
            let store = backend.store_for(rule);
            route = route.layer(rule_layer(rule, store, config.failure_policy)?);
        } else {
            info!(path = %rule.path, "Rule disabled; serving route without a limiter");
        }

        router = router.route(&rule.path, route);
    }

    Ok(router)
}

/// HTTP server for rate-limited routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Serve until `signal` resolves.
    ///
    /// Connections carry their peer address so remote-address keys resolve.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}
