use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::category::OperationCategory;

// ===== Failure classification =====

/// Tagged view of a failure used by retry policies to decide whether an error
/// is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RetryExhausted,
    RateLimited,
    QueueFull,
    CircuitOpen,
    /// Failure of the wrapped operation itself, tagged by the caller
    Operation(&'static str),
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::RetryExhausted => "retry_exhausted",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::QueueFull => "queue_full",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Operation(kind) => kind,
        }
    }

    /// True for admission rejections, where the operation was never invoked.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited | FailureKind::QueueFull | FailureKind::CircuitOpen
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can describe themselves as a [`FailureKind`].
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            std::io::ErrorKind::TimedOut => FailureKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => FailureKind::Operation("connection"),
            _ => FailureKind::Operation("io"),
        }
    }
}

// ===== Timeout =====

/// Operation exceeded its deadline
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Operation '{operation_name}' ({category}) timed out after {timeout:?}")]
pub struct TimeoutError {
    pub category: OperationCategory,
    pub timeout: Duration,
    pub operation_name: String,
}

impl TimeoutError {
    pub fn timeout_seconds(&self) -> f64 {
        self.timeout.as_secs_f64()
    }
}

impl Classify for TimeoutError {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Timeout
    }
}

// ===== Retry =====

/// One failed attempt inside a retry sequence
#[derive(Debug, Clone)]
pub struct RetryAttempt<E> {
    pub attempt_number: u32,
    pub category: OperationCategory,
    pub operation: String,
    pub failure_kind: FailureKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// The original error, kept for diagnostics
    pub error: E,
}

/// All retry attempts were exhausted. Carries every attempt, not only the last.
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    pub category: OperationCategory,
    pub operation: String,
    pub attempts: Vec<RetryAttempt<E>>,
}

impl<E> RetryError<E> {
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn last_attempt(&self) -> Option<&RetryAttempt<E>> {
        self.attempts.last()
    }

    pub fn last_error(&self) -> Option<&E> {
        self.attempts.last().map(|a| &a.error)
    }

    pub fn into_errors(self) -> Vec<E> {
        self.attempts.into_iter().map(|a| a.error).collect()
    }
}

impl<E> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operation '{}' ({}) failed after {} attempts",
            self.operation,
            self.category,
            self.attempts.len()
        )?;
        if let Some(last) = self.attempts.last() {
            write!(f, ": {}", last.message)?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug> std::error::Error for RetryError<E> {}

impl<E> Classify for RetryError<E> {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::RetryExhausted
    }
}

// ===== Rate limiting =====

/// Which bucket denied admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitType {
    Global,
    Tenant,
}

impl fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitType::Global => write!(f, "global"),
            RateLimitType::Tenant => write!(f, "tenant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Rate limit exceeded for tenant {tenant_id} ({limit_type}): {current_rate:.2}/s against limit {limit}/s")]
pub struct RateLimitExceeded {
    pub tenant_id: String,
    pub limit_type: RateLimitType,
    /// Observed admissions per second over the trailing second
    pub current_rate: f64,
    /// Configured refill rate
    pub limit: f64,
}

impl Classify for RateLimitExceeded {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::RateLimited
    }
}

// ===== Queues =====

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Queue '{queue_name}' is full ({current_size}/{capacity})")]
pub struct QueueFullError {
    pub queue_name: String,
    pub capacity: usize,
    pub current_size: usize,
}

impl Classify for QueueFullError {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::QueueFull
    }
}

/// Admission rejected by the backpressure layer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackpressureError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error(transparent)]
    QueueFull(#[from] QueueFullError),
}

impl Classify for BackpressureError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            BackpressureError::RateLimited(_) => FailureKind::RateLimited,
            BackpressureError::QueueFull(_) => FailureKind::QueueFull,
        }
    }
}

// ===== Circuit breaking =====

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Too many failures, calls are rejected
    Open,
    /// Probing whether the service has recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Call fast-failed by a circuit breaker; the operation was never invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker for '{service_name}' is {state} ({failure_count} consecutive failures)")]
pub struct CircuitBreakerError {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
}

impl Classify for CircuitBreakerError {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::CircuitOpen
    }
}

// ===== Composite caller error =====

/// Caller-facing error for operations run through the substrate.
///
/// Wraps the domain error `E` of the underlying operation and absorbs every
/// substrate error through `From`, so all layers compose on a single error
/// type.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("{0}")]
    RetryExhausted(RetryError<GuardError<E>>),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error(transparent)]
    QueueFull(#[from] QueueFullError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),

    #[error("Operation failed: {0}")]
    Operation(#[source] E),
}

impl<E> GuardError<E> {
    /// True when the operation was never invoked.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GuardError::RateLimited(_) | GuardError::QueueFull(_) | GuardError::CircuitOpen(_)
        )
    }

    pub fn operation_error(&self) -> Option<&E> {
        match self {
            GuardError::Operation(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_operation_error(self) -> Option<E> {
        match self {
            GuardError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<RetryError<GuardError<E>>> for GuardError<E> {
    fn from(err: RetryError<GuardError<E>>) -> Self {
        GuardError::RetryExhausted(err)
    }
}

impl<E> From<BackpressureError> for GuardError<E> {
    fn from(err: BackpressureError) -> Self {
        match err {
            BackpressureError::RateLimited(e) => GuardError::RateLimited(e),
            BackpressureError::QueueFull(e) => GuardError::QueueFull(e),
        }
    }
}

impl<E: Classify> Classify for GuardError<E> {
    fn failure_kind(&self) -> FailureKind {
        match self {
            GuardError::Timeout(_) => FailureKind::Timeout,
            GuardError::RetryExhausted(_) => FailureKind::RetryExhausted,
            GuardError::RateLimited(_) => FailureKind::RateLimited,
            GuardError::QueueFull(_) => FailureKind::QueueFull,
            GuardError::CircuitOpen(_) => FailureKind::CircuitOpen,
            GuardError::Operation(e) => e.failure_kind(),
        }
    }
}

pub type GuardResult<T, E> = std::result::Result<T, GuardError<E>>;
