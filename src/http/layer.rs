//! Rate limit middleware layer.

use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::Result;
use crate::ratelimit::{Decision, KeyFn, RateLimiter, RateLimiterConfig};

/// Header carrying the configured limit.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Header carrying the remaining-request estimate.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Header carrying the start of the next window, in Unix seconds.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Response produced for a rejected request.
pub type RejectionHandler = Arc<dyn Fn(Request) -> Response + Send + Sync>;

/// What to do when the counter store cannot be read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Answer with a server error and do not forward the request.
    #[default]
    Closed,
    /// Log the failure and forward the request uncounted.
    Open,
}

/// Weight a request counts for, set as a request extension by an earlier layer.
///
/// Requests without it count as 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestWeight(pub u64);

/// The default rejection: 429 with a plain-text body.
pub fn too_many_requests(_req: Request) -> Response {
    (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response()
}

/// Rate limit layer.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    on_limit: RejectionHandler,
    failure_policy: FailurePolicy,
}

impl RateLimitLayer {
    /// Wrap services with `limiter`.
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            on_limit: Arc::new(too_many_requests),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Replace the response produced for rejected requests.
    pub fn with_rejection_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Request) -> Response + Send + Sync + 'static,
    {
        self.on_limit = Arc::new(handler);
        self
    }

    /// Choose how counter store failures are handled.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// The limiter behind this layer.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("limit", &self.limiter.request_limit())
            .field("window", &self.limiter.window_length())
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: self.limiter.clone(),
            on_limit: self.on_limit.clone(),
            failure_policy: self.failure_policy,
        }
    }
}

/// Service produced by `RateLimitLayer`.
#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    on_limit: RejectionHandler,
    failure_policy: FailurePolicy,
}

impl<S> Service<Request> for RateLimitMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let limiter = self.limiter.clone();
        let on_limit = self.on_limit.clone();
        let failure_policy = self.failure_policy;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let key = match limiter.key_fn().resolve(&req) {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, path = %req.uri().path(), "Rejecting request without a rate limit key");
                    return Ok(e.into_response());
                }
            };

            let weight = req
                .extensions()
                .get::<RequestWeight>()
                .map(|w| w.0)
                .unwrap_or(1);

            let decision = match limiter.check_weighted(&key, weight).await {
                Ok(decision) => decision,
                Err(e) => match failure_policy {
                    FailurePolicy::Closed => {
                        warn!(key = %key, error = %e, "Counter store failed; rejecting request");
                        let mut response = e.into_response();
                        add_limit_header(response.headers_mut(), limiter.request_limit());
                        return Ok(response);
                    }
                    FailurePolicy::Open => {
                        warn!(key = %key, error = %e, "Counter store failed; admitting request uncounted");
                        let mut response = inner.call(req).await?;
                        add_limit_header(response.headers_mut(), limiter.request_limit());
                        return Ok(response);
                    }
                },
            };

            if !decision.allowed {
                debug!(key = %key, estimate = decision.estimate, "Request rejected by rate limiter");
                let mut response = on_limit(req);
                add_rate_limit_headers(response.headers_mut(), &decision);
                return Ok(response);
            }

            let mut response = inner.call(req).await?;
            add_rate_limit_headers(response.headers_mut(), &decision);
            Ok(response)
        })
    }
}

/// Without a decision only the limit is known.
fn add_limit_header(headers: &mut HeaderMap, limit: u64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
}

fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    add_limit_header(headers, decision.limit);
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset));

    if let Some(retry_after) = decision.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
    }
}

/// A layer limiting requests per window, keyed by `key_fn`, over an in-memory store.
pub fn limit(request_limit: u64, window: Duration, key_fn: impl Into<KeyFn>) -> Result<RateLimitLayer> {
    let config = RateLimiterConfig::new(request_limit, window).with_key_fn(key_fn);
    Ok(RateLimitLayer::new(Arc::new(RateLimiter::new(config)?)))
}

/// A layer limiting all requests together.
pub fn limit_all(request_limit: u64, window: Duration) -> Result<RateLimitLayer> {
    limit(request_limit, window, KeyFn::global())
}

/// A layer limiting requests per peer IP address.
pub fn limit_by_ip(request_limit: u64, window: Duration) -> Result<RateLimitLayer> {
    limit(request_limit, window, KeyFn::by_ip())
}

/// A layer limiting requests per path.
pub fn limit_by_endpoint(request_limit: u64, window: Duration) -> Result<RateLimitLayer> {
    limit(request_limit, window, KeyFn::by_endpoint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpeedbumpError;
    use crate::ratelimit::{
        CounterStore, InMemoryCounter, KeyExtractor, MockClock, Window,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    const WINDOW: Duration = Duration::from_secs(10);

    fn limiter(limit: u64, key_fn: KeyFn, clock: &MockClock) -> Arc<RateLimiter> {
        let store = Arc::new(InMemoryCounter::with_clock(Arc::new(clock.clone())));
        let config = RateLimiterConfig::new(limit, WINDOW).with_key_fn(key_fn);
        Arc::new(
            RateLimiter::with_store(config, store)
                .unwrap()
                .with_clock(Arc::new(clock.clone())),
        )
    }

    fn app(layer: RateLimitLayer) -> Router {
        Router::new()
            .route("/", get(|| async { "home" }))
            .route("/admin", get(|| async { "admin" }))
            .layer(layer)
    }

    fn request(path: &str, addr: Option<&str>) -> Request {
        let mut req = axum::http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap();
        if let Some(addr) = addr {
            let addr: SocketAddr = addr.parse().unwrap();
            req.extensions_mut().insert(ConnectInfo(addr));
        }
        req
    }

    fn header(response: &Response, name: &str) -> String {
        response.headers()[name].to_str().unwrap().to_string()
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        fn configure(&self, _window_length: Duration) {}

        async fn increment(&self, _key: &str, _window: &Window, _delta: u64) -> Result<()> {
            Err(SpeedbumpError::StoreWrite("unavailable".to_string()))
        }

        async fn get(&self, _key: &str, _current: &Window, _previous: &Window) -> Result<(u64, u64)> {
            Err(SpeedbumpError::StoreRead("unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_documented_scenario() {
        let clock = MockClock::at_unix(1_005);
        let app = app(RateLimitLayer::new(limiter(2, KeyFn::global(), &clock)));

        let a = app.clone().oneshot(request("/", None)).await.unwrap();
        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(header(&a, "x-ratelimit-limit"), "2");
        assert_eq!(header(&a, "x-ratelimit-remaining"), "1");
        assert_eq!(header(&a, "x-ratelimit-reset"), "1010");

        clock.advance(Duration::from_secs(1));
        let b = app.clone().oneshot(request("/", None)).await.unwrap();
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(header(&b, "x-ratelimit-remaining"), "0");

        clock.advance(Duration::from_secs(1));
        let c = app.clone().oneshot(request("/", None)).await.unwrap();
        assert_eq!(c.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&c, "retry-after"), "10");
        assert_eq!(header(&c, "x-ratelimit-remaining"), "0");

        clock.advance(Duration::from_secs(9));
        let d = app.clone().oneshot(request("/", None)).await.unwrap();
        assert_eq!(d.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admitted_request_reaches_handler() {
        let clock = MockClock::at_unix(1_000);
        let app = app(RateLimitLayer::new(limiter(5, KeyFn::global(), &clock)));

        let response = app.oneshot(request("/admin", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"admin");
    }

    #[tokio::test]
    async fn test_key_failure_is_precondition_required() {
        let clock = MockClock::at_unix(1_000);
        let limiter = limiter(5, KeyFn::by_ip(), &clock);
        let app = app(RateLimitLayer::new(limiter.clone()));

        let response = app.oneshot(request("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_REQUIRED);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[tokio::test]
    async fn test_address_and_path_are_accounted_separately() {
        let clock = MockClock::at_unix(1_000);
        let key_fn = KeyFn::new(vec![KeyExtractor::RemoteAddr, KeyExtractor::Path]);
        let app = app(RateLimitLayer::new(limiter(1, key_fn, &clock)));

        let home = app.clone().oneshot(request("/", Some("10.0.0.1:4000"))).await.unwrap();
        let admin = app.clone().oneshot(request("/admin", Some("10.0.0.1:4000"))).await.unwrap();
        assert_eq!(home.status(), StatusCode::OK);
        assert_eq!(admin.status(), StatusCode::OK);

        let again = app.clone().oneshot(request("/", Some("10.0.0.1:4001"))).await.unwrap();
        assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_custom_rejection_handler() {
        let clock = MockClock::at_unix(1_000);
        let layer = RateLimitLayer::new(limiter(0, KeyFn::global(), &clock)).with_rejection_handler(|_req| {
            (StatusCode::SERVICE_UNAVAILABLE, "slow down").into_response()
        });

        let response = app(layer).oneshot(request("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(header(&response, "retry-after"), "10");
    }

    #[tokio::test]
    async fn test_request_weight_extension() {
        let clock = MockClock::at_unix(1_000);
        let app = app(RateLimitLayer::new(limiter(10, KeyFn::global(), &clock)));

        let mut heavy = request("/", None);
        heavy.extensions_mut().insert(RequestWeight(8));
        let response = app.clone().oneshot(heavy).await.unwrap();
        assert_eq!(header(&response, "x-ratelimit-remaining"), "2");
    }

    #[tokio::test]
    async fn test_store_failure_closed_returns_server_error() {
        let config = RateLimiterConfig::new(5, WINDOW);
        let limiter = Arc::new(RateLimiter::with_store(config, Arc::new(BrokenStore)).unwrap());
        let app = app(RateLimitLayer::new(limiter));

        let response = app.oneshot(request("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(header(&response, "x-ratelimit-limit"), "5");
        assert!(response.headers().get("x-ratelimit-remaining").is_none());
    }

    #[tokio::test]
    async fn test_store_failure_open_forwards() {
        let config = RateLimiterConfig::new(5, WINDOW);
        let limiter = Arc::new(RateLimiter::with_store(config, Arc::new(BrokenStore)).unwrap());
        let app = app(RateLimitLayer::new(limiter).with_failure_policy(FailurePolicy::Open));

        let response = app.oneshot(request("/", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "5");
        assert!(response.headers().get("x-ratelimit-reset").is_none());
    }

    #[tokio::test]
    async fn test_convenience_constructors() {
        let layer = limit_by_endpoint(1, WINDOW).unwrap();
        let app = app(layer);

        assert_eq!(app.clone().oneshot(request("/", None)).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.clone().oneshot(request("/admin", None)).await.unwrap().status(), StatusCode::OK);
        assert_eq!(
            app.clone().oneshot(request("/", None)).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        assert!(limit_all(1, Duration::from_millis(10)).is_err());
        assert_eq!(limit_by_ip(3, WINDOW).unwrap().limiter().request_limit(), 3);
    }
}
