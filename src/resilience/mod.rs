// src/resilience/mod.rs
pub mod breaker;
pub mod client;
pub mod limiter;

pub use breaker::{
    Admission, BreakerEvent, BreakerObserver, BreakerState, CircuitBreaker, CircuitBreakerState,
};
pub use client::{sample_cache_key, Fetch, ResilientClient};
pub use limiter::{RateLimitBudget, RateLimiter};
