//! Reliability patterns guarding the scheduler and recovery loops (§4.7, §4.8).

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
