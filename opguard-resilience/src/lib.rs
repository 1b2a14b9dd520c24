//! Reliability layers for operations against messaging and key-value backends.
//!
//! Each layer is usable on its own:
//!
//! - [`timeout::TimeoutManager`]: per-category deadlines
//! - [`retry::RetryManager`]: exponential backoff with jitter, plus
//!   [`idempotency::IdempotencyManager`] result caching
//! - [`backpressure::BackpressureManager`]: token-bucket rate limiting per
//!   tenant and bounded queues with drop policies
//! - [`circuit_breaker::CircuitBreakerManager`]: per-service breakers
//!
//! [`guard::Guard`] owns one of each and runs an operation through all of
//! them. Every layer reports notable events to the injected
//! [`opguard_core::AuditEmitter`], logs through `tracing` and records
//! Prometheus metrics through the `metrics` facade.

pub mod backpressure;
pub mod circuit_breaker;
pub mod config;
pub mod guard;
pub mod idempotency;
pub mod observability;
pub mod retry;
pub mod timeout;

pub use backpressure::{
    BackpressureAction, BackpressureManager, BackpressureStats, BackpressureStatus, BoundedQueue,
    BucketConfig, DropPolicy, QueueConfig, QueueSettings, RateLimitConfig, TenantRateLimiter,
    TokenBucket,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStats,
    CircuitBreakersConfig,
};
pub use config::{ConfigError, ReliabilityConfig};
pub use guard::{Guard, GuardedCall};
pub use idempotency::{
    IdempotencyError, IdempotencyManager, IdempotencyRecord, IdempotencyStore,
    InMemoryIdempotencyStore,
};
pub use retry::{RetryConfig, RetryManager, RetryPolicy, RetryPolicyConfig};
pub use timeout::{TimeoutConfig, TimeoutManager};
