//! Speedbump - Sliding-Window Rate Limiting
//!
//! This crate implements a request admission layer for HTTP services. Each
//! request is mapped to a key, its rate is estimated over a sliding window
//! built from two fixed-window counters, and requests over the limit are
//! rejected with 429. Counters live in process memory or in Redis so several
//! instances can share one budget.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
