//! Composition root running an operation through every reliability layer.
//!
//! Layers apply outermost first: backpressure admission, retry (with
//! idempotent result caching for [`Guard::execute_idempotent`]), the
//! per-attempt timeout and finally the circuit breaker for the downstream
//! service. A rejected admission never reaches the retry loop, and every
//! retry attempt gets its own deadline and its own breaker call. An open
//! circuit is returned to the caller as a rejection instead of being retried.
//!
//! # Example
//!
//! ```no_run
//! use opguard_core::{AuditEmitter, GuardError, OperationCategory, OperationContext};
//! use opguard_resilience::config::ReliabilityConfig;
//! use opguard_resilience::guard::{Guard, GuardedCall};
//!
//! # async fn example() -> Result<(), GuardError<std::io::Error>> {
//! let guard = Guard::new(&ReliabilityConfig::default(), AuditEmitter::disabled());
//!
//! let call = GuardedCall::new(OperationCategory::KvGet, "kv.get orders/42")
//!     .with_service("kv")
//!     .with_context(OperationContext::for_tenant("acme"));
//!
//! let value: u64 = guard
//!     .execute(&call, || async { Ok::<_, std::io::Error>(42) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use opguard_core::{
    AuditEmitter, Classify, FailureKind, GuardError, OperationCategory, OperationContext,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::backpressure::BackpressureManager;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerManager};
use crate::config::ReliabilityConfig;
use crate::idempotency::IdempotencyManager;
use crate::retry::{RetryConfig, RetryManager};
use crate::timeout::TimeoutManager;

/// Describes one guarded invocation
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedCall {
    pub category: OperationCategory,
    pub operation_name: String,
    /// Circuit breaker key. Defaults to the category name.
    pub service_name: String,
    /// Queue whose fullness gates admission
    pub queue_name: Option<String>,
    pub idempotency_key: Option<String>,
    /// Per-attempt deadline overriding the category timeout
    pub timeout: Option<Duration>,
    pub context: OperationContext,
}

impl GuardedCall {
    pub fn new(category: OperationCategory, operation_name: impl Into<String>) -> Self {
        Self {
            service_name: category.as_str().to_string(),
            category,
            operation_name: operation_name.into(),
            queue_name: None,
            idempotency_key: None,
            timeout: None,
            context: OperationContext::default(),
        }
    }

    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: OperationContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Derive the idempotency key from the operation name, the context's
    /// tenant and `correlation_id`. The correlation id is also recorded on
    /// the context.
    pub fn idempotent(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        let key = IdempotencyManager::compute_key(
            &self.operation_name,
            self.context.tenant_or_default(),
            &correlation_id,
        );
        self.context.correlation_id = Some(correlation_id);
        self.idempotency_key = Some(key);
        self
    }

    pub fn tenant_id(&self) -> &str {
        self.context.tenant_or_default()
    }
}

/// Owns one instance of every manager, built from a single configuration and
/// sharing one audit emitter.
#[derive(Debug, Clone)]
pub struct Guard {
    timeouts: Arc<TimeoutManager>,
    retries: Arc<RetryManager>,
    backpressure: Arc<BackpressureManager>,
    circuit_breakers: Arc<CircuitBreakerManager>,
}

impl Guard {
    /// Build every manager from `config`, with an in-memory idempotency store
    pub fn new(config: &ReliabilityConfig, audit: AuditEmitter) -> Self {
        Self::with_idempotency(config, Arc::new(IdempotencyManager::in_memory()), audit)
    }

    pub fn with_idempotency(
        config: &ReliabilityConfig,
        idempotency: Arc<IdempotencyManager>,
        audit: AuditEmitter,
    ) -> Self {
        Self {
            timeouts: Arc::new(TimeoutManager::new(config.timeouts.clone(), audit.clone())),
            retries: Arc::new(RetryManager::new(
                &guard_retry_config(&config.retry),
                idempotency,
                audit.clone(),
            )),
            backpressure: Arc::new(BackpressureManager::new(
                config.rate_limits.clone(),
                config.queues.clone(),
                audit.clone(),
            )),
            circuit_breakers: Arc::new(CircuitBreakerManager::new(
                config.circuit_breakers.clone(),
                audit,
            )),
        }
    }

    /// Assemble from managers built elsewhere. The retry manager's policies
    /// are used as given.
    pub fn from_parts(
        timeouts: Arc<TimeoutManager>,
        retries: Arc<RetryManager>,
        backpressure: Arc<BackpressureManager>,
        circuit_breakers: Arc<CircuitBreakerManager>,
    ) -> Self {
        Self {
            timeouts,
            retries,
            backpressure,
            circuit_breakers,
        }
    }

    pub fn timeouts(&self) -> &Arc<TimeoutManager> {
        &self.timeouts
    }

    pub fn retries(&self) -> &Arc<RetryManager> {
        &self.retries
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        self.retries.idempotency()
    }

    pub fn backpressure(&self) -> &Arc<BackpressureManager> {
        &self.backpressure
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.circuit_breakers
    }

    /// Run `operation` through backpressure, retry, timeout and circuit
    /// breaker, in that order. `operation` is invoked once per attempt.
    ///
    /// The result is not cached and `call.idempotency_key` is not consulted;
    /// see [`execute_idempotent`](Self::execute_idempotent).
    pub async fn execute<T, E, F, Fut>(
        &self,
        call: &GuardedCall,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.log_start(call);
        let breaker = self.circuit_breakers.get_breaker(&call.service_name, None);
        let attempt = || self.attempt(call, &breaker, &operation);

        self.backpressure
            .execute_with_backpressure(
                call.tenant_id(),
                call.queue_name.as_deref(),
                &call.operation_name,
                || {
                    self.retries.execute_with_retry(
                        &call.category,
                        &call.operation_name,
                        attempt,
                        &call.context,
                    )
                },
                &call.context,
            )
            .await
    }

    /// [`execute`](Self::execute), returning the recorded result for
    /// `call.idempotency_key` when there is one and recording fresh
    /// successes. Without a key this is plain `execute`.
    pub async fn execute_idempotent<T, E, F, Fut>(
        &self,
        call: &GuardedCall,
        operation: F,
    ) -> Result<T, GuardError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: Classify + fmt::Display,
    {
        let Some(key) = call.idempotency_key.as_deref() else {
            return self.execute(call, operation).await;
        };

        self.log_start(call);
        let breaker = self.circuit_breakers.get_breaker(&call.service_name, None);
        let attempt = || self.attempt(call, &breaker, &operation);

        self.backpressure
            .execute_with_backpressure(
                call.tenant_id(),
                call.queue_name.as_deref(),
                &call.operation_name,
                || {
                    self.retries.execute_with_retry_idempotent(
                        &call.category,
                        &call.operation_name,
                        attempt,
                        key,
                        &call.context,
                    )
                },
                &call.context,
            )
            .await
    }

    /// One attempt: the breaker call under the per-attempt deadline
    async fn attempt<T, E, F, Fut>(
        &self,
        call: &GuardedCall,
        breaker: &CircuitBreaker,
        operation: &F,
    ) -> Result<T, GuardError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guarded = breaker.call(|| async { operation().await.map_err(GuardError::Operation) });
        self.timeouts
            .execute_with_timeout(
                &call.category,
                &call.operation_name,
                guarded,
                call.timeout,
                &call.context,
            )
            .await
    }

    fn log_start(&self, call: &GuardedCall) {
        debug!(
            operation = %call.operation_name,
            category = %call.category,
            service = %call.service_name,
            tenant_id = call.tenant_id(),
            "Executing guarded operation"
        );
    }
}

/// Retry settings applied under the guard. An open circuit is not retried
/// unless a policy lists `circuit_open` as retryable.
fn guard_retry_config(config: &RetryConfig) -> RetryConfig {
    let mut config = config.clone();
    let circuit_open = FailureKind::CircuitOpen.as_str();
    let policies =
        std::iter::once(&mut config.default_policy).chain(config.categories.values_mut());
    for policy in policies {
        let listed = policy
            .retryable
            .iter()
            .chain(&policy.non_retryable)
            .any(|kind| kind == circuit_open);
        if !listed {
            policy.non_retryable.push(circuit_open.to_string());
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BucketConfig;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::retry::RetryPolicyConfig;
    use opguard_core::{AuditEventType, CircuitState, FailureKind, MemoryAuditSink};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    #[derive(Debug, thiserror::Error)]
    enum KvError {
        #[error("kv unavailable")]
        Unavailable,
        #[error("key not found")]
        NotFound,
    }

    impl Classify for KvError {
        fn failure_kind(&self) -> FailureKind {
            match self {
                KvError::Unavailable => FailureKind::Operation("unavailable"),
                KvError::NotFound => FailureKind::Operation("not_found"),
            }
        }
    }

    fn fast_retries(max_attempts: u32) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_attempts,
            base_delay_secs: 0.01,
            max_delay_secs: 0.05,
            jitter_enabled: false,
            ..RetryPolicyConfig::default()
        }
    }

    fn guard_with(config: ReliabilityConfig) -> (Guard, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (Guard::new(&config, AuditEmitter::new(sink.clone())), sink)
    }

    fn kv_call() -> GuardedCall {
        GuardedCall::new(OperationCategory::KvGet, "kv.get orders/42")
            .with_service("kv")
            .with_context(OperationContext::for_tenant("acme"))
    }

    #[test]
    fn test_call_defaults() {
        let call = GuardedCall::new(OperationCategory::NatsPublish, "publish");
        assert_eq!(call.service_name, "NATS_PUBLISH");
        assert_eq!(call.tenant_id(), "default");
        assert!(call.idempotency_key.is_none());
    }

    #[test]
    fn test_idempotent_call_key() {
        let call = kv_call().idempotent("corr-1");
        assert_eq!(
            call.idempotency_key.as_deref(),
            Some(IdempotencyManager::compute_key("kv.get orders/42", "acme", "corr-1").as_str())
        );
        assert_eq!(call.context.correlation_id.as_deref(), Some("corr-1"));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let (guard, sink) = guard_with(ReliabilityConfig::default());

        let value: u64 = guard
            .execute(&kv_call(), || async { Ok::<_, KvError>(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(sink.records().is_empty());
        assert_eq!(
            guard.circuit_breakers().get_breaker("kv", None).state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let mut config = ReliabilityConfig::default();
        config
            .retry
            .categories
            .insert(OperationCategory::KvGet, fast_retries(3));
        let (guard, sink) = guard_with(config);
        let calls = &AtomicU32::new(0);

        let value: u32 = guard
            .execute(&kv_call(), || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(KvError::Unavailable)
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(sink.count(AuditEventType::RetryAttempt), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_returned_unchanged() {
        let mut config = ReliabilityConfig::default();
        config.retry.categories.insert(
            OperationCategory::KvGet,
            RetryPolicyConfig {
                non_retryable: vec!["not_found".to_string()],
                ..fast_retries(3)
            },
        );
        let (guard, _) = guard_with(config);
        let calls = &AtomicU32::new(0);

        let err = guard
            .execute(&kv_call(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(KvError::NotFound)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::Operation(KvError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_its_own_deadline() {
        let mut config = ReliabilityConfig::default();
        config
            .retry
            .categories
            .insert(OperationCategory::KvGet, fast_retries(2));
        let (guard, sink) = guard_with(config);
        let call = kv_call().with_timeout(Duration::from_millis(100));

        let err = guard
            .execute(&call, || async {
                sleep(Duration::from_secs(5)).await;
                Ok::<(), KvError>(())
            })
            .await
            .unwrap_err();

        match err {
            GuardError::RetryExhausted(retry) => {
                assert_eq!(retry.attempt_count(), 2);
                assert!(retry
                    .attempts
                    .iter()
                    .all(|a| a.failure_kind == FailureKind::Timeout));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(sink.count(AuditEventType::TimeoutOccurred), 2);
        let breaker = guard.circuit_breakers().get_breaker("kv", None);
        assert_eq!(breaker.get_stats().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_a_rejection_not_retried() {
        let mut config = ReliabilityConfig::default();
        config
            .retry
            .categories
            .insert(OperationCategory::KvGet, fast_retries(4));
        config.circuit_breakers = config
            .circuit_breakers
            .with_service("kv", CircuitBreakerConfig::new(2, Duration::from_secs(60), 1));
        let (guard, sink) = guard_with(config);
        let calls = &AtomicU32::new(0);
        let op = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(KvError::Unavailable)
        };

        let err = guard.execute(&kv_call(), op).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.is_rejection());
        assert!(matches!(err, GuardError::CircuitOpen(ref e) if e.service_name == "kv"));
        assert_eq!(sink.count(AuditEventType::RetryAttempt), 2);
        assert_eq!(sink.count(AuditEventType::RetryExhausted), 0);
        assert_eq!(sink.count(AuditEventType::CircuitStateChange), 1);

        let started = tokio::time::Instant::now();
        let err = guard.execute(&kv_call(), op).await.unwrap_err();
        assert!(matches!(err, GuardError::CircuitOpen(_)));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_explicit_circuit_open_retry_is_kept() {
        let mut retry = RetryConfig::default();
        retry.default_policy.retryable = vec!["circuit_open".to_string()];

        let adjusted = guard_retry_config(&retry);
        assert!(adjusted.default_policy.non_retryable.is_empty());
        assert!(adjusted
            .categories
            .values()
            .all(|policy| policy.non_retryable == vec!["circuit_open".to_string()]));
    }

    #[tokio::test]
    async fn test_result_need_not_be_serializable() {
        #[derive(Debug)]
        struct Connection {
            id: u32,
        }

        let (guard, _) = guard_with(ReliabilityConfig::default());
        let call = GuardedCall::new(OperationCategory::NatsConnect, "connect");

        let conn = guard
            .execute(&call, || async { Ok::<_, KvError>(Arc::new(Connection { id: 9 })) })
            .await
            .unwrap();
        assert_eq!(conn.id, 9);
    }

    #[tokio::test]
    async fn test_rate_limited_call_is_never_invoked() {
        let mut config = ReliabilityConfig::default();
        config.rate_limits.tenant_default = BucketConfig::new(0.001, 1.0);
        let (guard, sink) = guard_with(config);
        let calls = &AtomicU32::new(0);
        let op = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, KvError>(1u8)
        };

        assert!(guard.execute(&kv_call(), op).await.is_ok());
        let err = guard.execute(&kv_call(), op).await.unwrap_err();

        assert!(err.is_rejection());
        assert!(matches!(err, GuardError::RateLimited(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(AuditEventType::Backpressure), 1);
        assert_eq!(sink.count(AuditEventType::RetryAttempt), 0);
    }

    #[tokio::test]
    async fn test_idempotent_result_is_reused() {
        let (guard, sink) = guard_with(ReliabilityConfig::default());
        let call = kv_call().idempotent("corr-7");
        let calls = &AtomicU32::new(0);
        let op = || async move { Ok::<_, KvError>(calls.fetch_add(1, Ordering::SeqCst) + 100) };

        let first: u32 = guard.execute_idempotent(&call, op).await.unwrap();
        let second: u32 = guard.execute_idempotent(&call, op).await.unwrap();

        assert_eq!(first, 100);
        assert_eq!(second, 100);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(AuditEventType::IdempotencyHit), 1);

        let third: u32 = guard.execute(&call, op).await.unwrap();
        assert_eq!(third, 101);
    }
}
