//! HTTP admission: the rate limit middleware and the server hosting it.

mod layer;
mod server;

pub use layer::{
    limit, limit_all, limit_by_endpoint, limit_by_ip, too_many_requests, FailurePolicy,
    RateLimitLayer, RateLimitMiddleware, RejectionHandler, RequestWeight, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{build_router, rule_layer, CounterBackend, HttpServer};
