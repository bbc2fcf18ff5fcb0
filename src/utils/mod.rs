//! # Utility Modules
//!
//! Supporting utilities for timing, logging and observability.
//!
//! ## Components
//! - **Backoff**: Exponential backoff with jitter for reconnects
//! - **Rate Limiter**: Coalesces bursts of activations into bounded-rate actions
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Timeout defaults and async timeout wrappers
//! - **Metrics**: Thread-safe observability counters

pub mod backoff;
pub mod logging;
pub mod metrics;
pub mod rate_limiter;
pub mod timeout;

pub use backoff::ExponentialBackoff;
pub use rate_limiter::RateLimiter;
