//! Retry with exponential backoff, jitter and idempotent result caching.
//!
//! The delay before retry `n` (1-based) is
//! `min(base_delay * backoff_multiplier^(n-1), max_delay)`, optionally scaled
//! by a random factor in `[1 - jitter_factor, 1 + jitter_factor]` and clamped
//! to `max_delay` again.
//!
//! Which failures are retried is decided from the error's [`FailureKind`]:
//! a policy may carry an allow-list, a deny-list, or a custom predicate.

use chrono::Utc;
use futures::future::BoxFuture;
use opguard_core::{
    AuditEmitter, AuditEventType, AuditRecord, Classify, FailureKind, OperationCategory,
    OperationContext, RetryAttempt, RetryError,
};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use validator::{Validate, ValidationError};

use crate::idempotency::IdempotencyManager;
use crate::observability::metrics::ReliabilityMetrics;

/// Custom retry predicate over failure kinds
pub type RetryPredicate = Arc<dyn Fn(&FailureKind) -> bool + Send + Sync>;

/// Serializable retry policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryPolicyConfig {
    /// Total attempts, including the first
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    #[validate(range(min = 0.0))]
    pub base_delay_secs: f64,
    #[validate(range(min = 0.0))]
    pub max_delay_secs: f64,
    #[validate(range(min = 1.0))]
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter_factor: f64,
    /// Failure kinds that are retried; when non-empty, anything else is not
    pub retryable: Vec<String>,
    /// Failure kinds that are never retried
    pub non_retryable: Vec<String>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 60.0,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.1,
            retryable: Vec::new(),
            non_retryable: Vec::new(),
        }
    }
}

impl RetryPolicyConfig {
    fn preset(max_attempts: u32, base_delay_secs: f64, max_delay_secs: f64) -> Self {
        Self {
            max_attempts,
            base_delay_secs,
            max_delay_secs,
            ..Self::default()
        }
    }

    /// Cross-field check: every float is finite and the cap may not be
    /// below the base delay.
    pub fn validate_delays(&self) -> Result<(), ValidationError> {
        let floats = [
            ("base_delay_secs", self.base_delay_secs),
            ("max_delay_secs", self.max_delay_secs),
            ("backoff_multiplier", self.backoff_multiplier),
            ("jitter_factor", self.jitter_factor),
        ];
        if let Some((field, _)) = floats.iter().find(|(_, value)| !value.is_finite()) {
            let mut err = ValidationError::new("not_finite");
            err.message = Some(format!("{} must be a finite number", field).into());
            return Err(err);
        }
        if self.max_delay_secs < self.base_delay_secs {
            let mut err = ValidationError::new("max_delay_below_base_delay");
            err.message = Some("max_delay_secs must be >= base_delay_secs".into());
            return Err(err);
        }
        Ok(())
    }
}

/// Retry settings for all categories
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default_policy: RetryPolicyConfig,
    pub categories: HashMap<OperationCategory, RetryPolicyConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let quick = RetryPolicyConfig::preset(3, 0.1, 2.0);
        let categories = [
            (OperationCategory::NatsConnect, RetryPolicyConfig::preset(5, 1.0, 30.0)),
            (OperationCategory::NatsPublish, quick.clone()),
            (OperationCategory::NatsRequest, quick.clone()),
            (OperationCategory::KvGet, quick.clone()),
            (OperationCategory::KvPut, quick.clone()),
            (OperationCategory::KvDelete, quick),
            (OperationCategory::ExecutionIntent, RetryPolicyConfig::preset(2, 0.5, 5.0)),
            (OperationCategory::ApprovalCheck, RetryPolicyConfig::preset(2, 0.5, 5.0)),
        ]
        .into_iter()
        .collect();

        Self {
            default_policy: RetryPolicyConfig::default(),
            categories,
        }
    }
}

fn secs(value: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(fallback)
}

/// Jitter factor in `[0, 1]`; non-finite input means no jitter.
fn jitter_factor(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Runtime retry policy
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    pub jitter_factor: f64,
    retryable: Vec<String>,
    non_retryable: Vec<String>,
    predicate: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryPolicyConfig::default())
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter_enabled", &self.jitter_enabled)
            .field("jitter_factor", &self.jitter_factor)
            .field("retryable", &self.retryable)
            .field("non_retryable", &self.non_retryable)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: secs(config.base_delay_secs, Duration::from_secs(1)),
            max_delay: secs(config.max_delay_secs, Duration::from_secs(60)),
            backoff_multiplier: config.backoff_multiplier,
            jitter_enabled: config.jitter_enabled,
            jitter_factor: jitter_factor(config.jitter_factor),
            retryable: config.retryable.clone(),
            non_retryable: config.non_retryable.clone(),
            predicate: None,
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_enabled = true;
        self.jitter_factor = jitter_factor(factor);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    /// Only retry failures of these kinds
    pub fn retry_only(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable = kinds.into_iter().map(|k| k.as_str().to_string()).collect();
        self
    }

    /// Never retry failures of these kinds
    pub fn never_retry(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.non_retryable = kinds.into_iter().map(|k| k.as_str().to_string()).collect();
        self
    }

    /// Replace the list-based decision with a custom predicate
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&FailureKind) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Whether a failure of this kind should be retried.
    ///
    /// A custom predicate decides alone. Otherwise an allow-list match
    /// retries, a deny-list match does not, and a failure matching neither
    /// list is retried only when no allow-list is configured.
    pub fn is_retryable(&self, kind: &FailureKind) -> bool {
        if let Some(predicate) = &self.predicate {
            return predicate(kind);
        }

        let name = kind.as_str();
        if self.retryable.iter().any(|k| k == name) {
            return true;
        }
        if self.non_retryable.iter().any(|k| k == name) {
            return false;
        }
        self.retryable.is_empty()
    }

    /// Backoff delay before retry `attempt` (1-based), without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        secs(capped, self.max_delay)
    }

    /// Backoff delay before retry `attempt` (1-based), with jitter applied
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let spread = jitter_factor(self.jitter_factor);
        if !self.jitter_enabled || spread <= 0.0 {
            return delay;
        }

        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        let jittered = (delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        secs(jittered.max(0.0), delay)
    }
}

/// Runs operations under per-category retry policies.
#[derive(Debug)]
pub struct RetryManager {
    default_policy: RetryPolicy,
    policies: HashMap<OperationCategory, RetryPolicy>,
    idempotency: Arc<IdempotencyManager>,
    audit: AuditEmitter,
}

impl RetryManager {
    pub fn new(
        config: &RetryConfig,
        idempotency: Arc<IdempotencyManager>,
        audit: AuditEmitter,
    ) -> Self {
        let policies = config
            .categories
            .iter()
            .map(|(category, policy)| (category.clone(), RetryPolicy::from_config(policy)))
            .collect();

        Self {
            default_policy: RetryPolicy::from_config(&config.default_policy),
            policies,
            idempotency,
            audit,
        }
    }

    /// Install a policy for a category, replacing any configured one
    pub fn with_policy(mut self, category: OperationCategory, policy: RetryPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Policy for a category; unknown categories get the default policy
    pub fn get_policy(&self, category: &OperationCategory) -> &RetryPolicy {
        self.policies.get(category).unwrap_or(&self.default_policy)
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        &self.idempotency
    }

    /// Run the operation produced by `operation` until it succeeds, fails
    /// with a non-retryable error, or the policy's attempts are used up.
    ///
    /// Non-retryable errors propagate unchanged. Exhaustion yields a
    /// [`RetryError`] carrying every attempt. Dropping the returned future
    /// (including during a backoff sleep) abandons the remaining attempts.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        category: &OperationCategory,
        operation_name: &str,
        mut operation: F,
        context: &OperationContext,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display + From<RetryError<E>>,
    {
        let policy = self.get_policy(category);
        let max_attempts = policy.max_attempts.max(1);
        let mut attempts: Vec<RetryAttempt<E>> = Vec::new();

        for attempt in 1..=max_attempts {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt = attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let failure_kind = err.failure_kind();
            if !policy.is_retryable(&failure_kind) {
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    failure_kind = %failure_kind,
                    error = %err,
                    "Non-retryable error, giving up"
                );
                return Err(err);
            }

            let message = err.to_string();
            attempts.push(RetryAttempt {
                attempt_number: attempt,
                category: category.clone(),
                operation: operation_name.to_string(),
                failure_kind,
                message: message.clone(),
                timestamp: Utc::now(),
                error: err,
            });

            if attempt < max_attempts {
                let delay = policy.compute_delay(attempt);
                debug!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Retrying after error"
                );
                ReliabilityMetrics::retry_attempt(category);
                self.emit(
                    AuditRecord::new(AuditEventType::RetryAttempt)
                        .with_context(context)
                        .with_audit_code(category.audit_code("retry"))
                        .with_detail("retry_category", category.as_str())
                        .with_detail("operation", operation_name)
                        .with_detail("attempt_number", attempt)
                        .with_detail("max_attempts", max_attempts)
                        .with_detail("delay_seconds", delay.as_secs_f64())
                        .with_detail("exception_type", failure_kind.as_str())
                        .with_detail("exception_message", message),
                )
                .await;
                sleep(delay).await;
            }
        }

        let last = attempts.last();
        warn!(
            operation = operation_name,
            attempts = attempts.len(),
            last_error = last.map(|a| a.message.as_str()).unwrap_or_default(),
            "Max retry attempts exhausted"
        );
        ReliabilityMetrics::retry_exhausted(category);
        self.emit(
            AuditRecord::new(AuditEventType::RetryExhausted)
                .with_context(context)
                .with_audit_code(category.audit_code("retry_exhausted"))
                .with_detail("retry_category", category.as_str())
                .with_detail("operation", operation_name)
                .with_detail("total_attempts", attempts.len())
                .with_detail(
                    "last_exception_type",
                    last.map(|a| a.failure_kind.as_str()).unwrap_or_default(),
                )
                .with_detail(
                    "last_exception_message",
                    last.map(|a| a.message.clone()).unwrap_or_default(),
                ),
        )
        .await;

        Err(E::from(RetryError {
            category: category.clone(),
            operation: operation_name.to_string(),
            attempts,
        }))
    }

    /// [`execute_with_retry`](Self::execute_with_retry) keyed by an
    /// idempotency key.
    ///
    /// A previously recorded result for `idempotency_key` is returned without
    /// invoking the operation. A fresh success is recorded; failures are not.
    pub async fn execute_with_retry_idempotent<T, E, F, Fut>(
        &self,
        category: &OperationCategory,
        operation_name: &str,
        operation: F,
        idempotency_key: &str,
        context: &OperationContext,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: Classify + fmt::Display + From<RetryError<E>>,
    {
        if let Some(cached) = self.idempotency.check_as::<T>(idempotency_key).await {
            debug!(
                idempotency_key = idempotency_key,
                operation = operation_name,
                "Returning cached idempotent result"
            );
            ReliabilityMetrics::idempotency_hit(category);
            self.emit(
                AuditRecord::new(AuditEventType::IdempotencyHit)
                    .with_context(context)
                    .with_detail("idempotency_key", idempotency_key)
                    .with_detail("operation", operation_name)
                    .with_detail("retry_category", category.as_str()),
            )
            .await;
            return Ok(cached);
        }

        let value = self
            .execute_with_retry(category, operation_name, operation, context)
            .await?;
        self.record_result(idempotency_key, &value, category, operation_name, context)
            .await;
        Ok(value)
    }

    /// Wrap an async function so every invocation is retried under the
    /// policy for `category`. The argument is cloned for each attempt, and
    /// `context_for` derives the audit context from it.
    pub fn wrap<A, C, F, Fut, T, E>(
        self: &Arc<Self>,
        category: OperationCategory,
        operation_name: impl Into<String>,
        context_for: C,
        operation: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>> + Clone + Send + Sync
    where
        A: Clone + Send + Sync + 'static,
        C: Fn(&A) -> OperationContext + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Classify + fmt::Display + From<RetryError<E>> + Send + 'static,
    {
        let manager = Arc::clone(self);
        let operation_name: Arc<str> = Arc::from(operation_name.into());

        move |arg: A| -> BoxFuture<'static, Result<T, E>> {
            let manager = Arc::clone(&manager);
            let category = category.clone();
            let operation_name = Arc::clone(&operation_name);
            let operation = operation.clone();
            let context = context_for(&arg);

            Box::pin(async move {
                manager
                    .execute_with_retry(
                        &category,
                        &operation_name,
                        || operation(arg.clone()),
                        &context,
                    )
                    .await
            })
        }
    }

    async fn record_result<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        category: &OperationCategory,
        operation_name: &str,
        context: &OperationContext,
    ) {
        let mut metadata = Map::new();
        metadata.insert("operation".into(), Value::from(operation_name));
        metadata.insert("category".into(), Value::from(category.as_str()));

        match self.idempotency.record(key, value, metadata).await {
            Ok(_) => {
                self.emit(
                    AuditRecord::new(AuditEventType::IdempotencyRecord)
                        .with_context(context)
                        .with_detail("idempotency_key", key)
                        .with_detail("operation", operation_name)
                        .with_detail("retry_category", category.as_str()),
                )
                .await;
            }
            Err(e) => {
                error!(
                    idempotency_key = key,
                    operation = operation_name,
                    error = %e,
                    "Failed to record idempotent result"
                );
            }
        }
    }

    async fn emit(&self, record: AuditRecord) {
        self.audit.emit(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opguard_core::{GuardError, MemoryAuditSink};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    enum PublishError {
        #[error("broker unavailable")]
        Unavailable,
        #[error("payload rejected")]
        Rejected,
    }

    impl Classify for PublishError {
        fn failure_kind(&self) -> FailureKind {
            match self {
                PublishError::Unavailable => FailureKind::Operation("unavailable"),
                PublishError::Rejected => FailureKind::Operation("rejected"),
            }
        }
    }

    type TestError = GuardError<PublishError>;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
            .without_jitter()
    }

    fn manager(policy: RetryPolicy) -> (RetryManager, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let manager = RetryManager::new(
            &RetryConfig::default(),
            Arc::new(IdempotencyManager::in_memory()),
            AuditEmitter::new(sink.clone()),
        )
        .with_policy(OperationCategory::NatsPublish, policy);
        (manager, sink)
    }

    #[test]
    fn test_backoff_without_jitter() {
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_multiplier(2.0)
            .without_jitter();

        assert_eq!(policy.compute_delay(1), Duration::from_secs(1));
        assert_eq!(policy.compute_delay(2), Duration::from_secs(2));
        assert_eq!(policy.compute_delay(3), Duration::from_secs(4));
        assert_eq!(policy.compute_delay(4), Duration::from_secs(8));
        assert_eq!(policy.compute_delay(5), Duration::from_secs(10));
        assert_eq!(policy.compute_delay(60), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(0.1);

        for attempt in 1..=4 {
            let base = policy.base_delay_for(attempt).as_secs_f64();
            for _ in 0..50 {
                let delay = policy.compute_delay(attempt).as_secs_f64();
                assert!(delay >= base * 0.9 - 1e-6, "{} < {}", delay, base * 0.9);
                assert!(delay <= base * 1.1 + 1e-6, "{} > {}", delay, base * 1.1);
            }
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.5);

        for _ in 0..100 {
            assert!(policy.compute_delay(3) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_classification_lists() {
        let unavailable = FailureKind::Operation("unavailable");
        let rejected = FailureKind::Operation("rejected");

        let default = RetryPolicy::default();
        assert!(default.is_retryable(&unavailable));
        assert!(default.is_retryable(&FailureKind::Timeout));

        let only = RetryPolicy::default().retry_only([unavailable, FailureKind::Timeout]);
        assert!(only.is_retryable(&unavailable));
        assert!(only.is_retryable(&FailureKind::Timeout));
        assert!(!only.is_retryable(&rejected));

        let deny = RetryPolicy::default().never_retry([rejected]);
        assert!(deny.is_retryable(&unavailable));
        assert!(!deny.is_retryable(&rejected));

        let both = RetryPolicy::default()
            .retry_only([FailureKind::Timeout])
            .never_retry([FailureKind::Timeout]);
        assert!(both.is_retryable(&FailureKind::Timeout));

        let custom = RetryPolicy::default().retry_if(|kind| !kind.is_rejection());
        assert!(custom.is_retryable(&unavailable));
        assert!(!custom.is_retryable(&FailureKind::CircuitOpen));
    }

    #[test]
    fn test_default_category_policies() {
        let manager = RetryManager::new(
            &RetryConfig::default(),
            Arc::new(IdempotencyManager::in_memory()),
            AuditEmitter::disabled(),
        );

        let connect = manager.get_policy(&OperationCategory::NatsConnect);
        assert_eq!(connect.max_attempts, 5);
        assert_eq!(connect.max_delay, Duration::from_secs(30));

        let kv = manager.get_policy(&OperationCategory::KvGet);
        assert_eq!(kv.max_attempts, 3);
        assert_eq!(kv.base_delay, Duration::from_millis(100));

        let unknown = manager.get_policy(&OperationCategory::Other("BATCH".into()));
        assert_eq!(unknown.max_attempts, 3);
        assert_eq!(unknown.base_delay, Duration::from_secs(1));
        assert_eq!(unknown.max_delay, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let (manager, sink) = manager(fast_policy(3));
        let calls = AtomicU32::new(0);

        let result: Result<&str, TestError> = manager
            .execute_with_retry(
                &OperationCategory::NatsPublish,
                "publish",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(GuardError::Operation(PublishError::Unavailable))
                    } else {
                        Ok("acked")
                    }
                },
                &OperationContext::for_tenant("acme"),
            )
            .await;

        assert_eq!(result.unwrap(), "acked");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let attempts = sink.records_of(AuditEventType::RetryAttempt);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].detail("attempt_number").unwrap(), 1);
        assert_eq!(attempts[1].detail("attempt_number").unwrap(), 2);
        assert_eq!(attempts[0].detail("exception_type").unwrap(), "unavailable");
        assert_eq!(attempts[0].tenant_id.as_deref(), Some("acme"));
        assert_eq!(sink.count(AuditEventType::RetryExhausted), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_carries_all_attempts() {
        let (manager, sink) = manager(fast_policy(3));
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = manager
            .execute_with_retry(
                &OperationCategory::NatsPublish,
                "publish",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GuardError::Operation(PublishError::Unavailable))
                },
                &OperationContext::default(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(GuardError::RetryExhausted(err)) => {
                assert_eq!(err.attempt_count(), 3);
                let numbers: Vec<u32> = err.attempts.iter().map(|a| a.attempt_number).collect();
                assert_eq!(numbers, vec![1, 2, 3]);
                assert_eq!(err.operation, "publish");
                assert!(matches!(
                    err.last_error(),
                    Some(GuardError::Operation(PublishError::Unavailable))
                ));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        assert_eq!(sink.count(AuditEventType::RetryAttempt), 2);
        let exhausted = sink.records_of(AuditEventType::RetryExhausted);
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].detail("total_attempts").unwrap(), 3);
        assert_eq!(
            exhausted[0].detail("last_exception_type").unwrap(),
            "unavailable"
        );
    }

    #[tokio::test]
    async fn test_non_retryable_propagates_unchanged() {
        let policy = fast_policy(5).never_retry([FailureKind::Operation("rejected")]);
        let (manager, sink) = manager(policy);
        let calls = AtomicU32::new(0);

        let result: Result<(), TestError> = manager
            .execute_with_retry(
                &OperationCategory::NatsPublish,
                "publish",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GuardError::Operation(PublishError::Rejected))
                },
                &OperationContext::default(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(GuardError::Operation(PublishError::Rejected))));
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_single_attempt_policy_exhausts_immediately() {
        let (manager, sink) = manager(fast_policy(1));

        let result: Result<(), TestError> = manager
            .execute_with_retry(
                &OperationCategory::NatsPublish,
                "publish",
                || async { Err(GuardError::Operation(PublishError::Unavailable)) },
                &OperationContext::default(),
            )
            .await;

        assert!(matches!(result, Err(GuardError::RetryExhausted(ref e)) if e.attempt_count() == 1));
        assert_eq!(sink.count(AuditEventType::RetryAttempt), 0);
        assert_eq!(sink.count(AuditEventType::RetryExhausted), 1);
    }

    #[tokio::test]
    async fn test_idempotent_result_is_reused() {
        let (manager, sink) = manager(fast_policy(3));
        let calls = AtomicU32::new(0);
        let key = IdempotencyManager::compute_key("publish", "acme", "c-1");

        for _ in 0..2 {
            let result: Result<u64, TestError> = manager
                .execute_with_retry_idempotent(
                    &OperationCategory::NatsPublish,
                    "publish",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(17)
                    },
                    &key,
                    &OperationContext::for_tenant("acme"),
                )
                .await;
            assert_eq!(result.unwrap(), 17);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(AuditEventType::IdempotencyRecord), 1);
        let hits = sink.records_of(AuditEventType::IdempotencyHit);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].detail("idempotency_key").unwrap(), key.as_str());
    }

    #[tokio::test]
    async fn test_failure_is_not_recorded() {
        let (manager, _sink) = manager(fast_policy(2));

        let result: Result<u64, TestError> = manager
            .execute_with_retry_idempotent(
                &OperationCategory::NatsPublish,
                "publish",
                || async { Err(GuardError::Operation(PublishError::Unavailable)) },
                "key-1",
                &OperationContext::default(),
            )
            .await;

        assert!(result.is_err());
        assert!(manager.idempotency().check("key-1").await.is_none());
    }

    #[tokio::test]
    async fn test_wrap_retries_with_cloned_argument() {
        let (manager, sink) = manager(fast_policy(3));
        let manager = Arc::new(manager);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let publish = manager.wrap(
            OperationCategory::NatsPublish,
            "publish",
            |subject: &String| {
                OperationContext::for_tenant("acme").with_field("subject", subject.as_str())
            },
            move |subject: String| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(GuardError::Operation(PublishError::Unavailable))
                    } else {
                        Ok(subject.len())
                    }
                }
            },
        );

        let result: Result<usize, TestError> = publish("orders.created".to_string()).await;
        assert_eq!(result.unwrap(), 14);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let attempts = sink.records_of(AuditEventType::RetryAttempt);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].tenant_id.as_deref(), Some("acme"));
        assert_eq!(
            attempts[0].detail("additional_context").unwrap()["subject"],
            "orders.created"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let policy = RetryPolicy::new(5)
            .with_base_delay(Duration::from_secs(1))
            .without_jitter();
        let (manager, sink) = manager(policy);
        let calls = AtomicU32::new(0);

        let outcome = tokio::time::timeout(
            Duration::from_millis(500),
            manager.execute_with_retry(
                &OperationCategory::NatsPublish,
                "publish",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), TestError>(GuardError::Operation(PublishError::Unavailable))
                },
                &OperationContext::default(),
            ),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(AuditEventType::RetryAttempt), 1);
        assert_eq!(sink.count(AuditEventType::RetryExhausted), 0);
    }

    #[test]
    fn test_non_finite_jitter_disables_jitter() {
        let config = RetryPolicyConfig {
            jitter_factor: f64::NAN,
            ..RetryPolicyConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.jitter_factor, 0.0);
        assert_eq!(policy.compute_delay(1), Duration::from_secs(1));

        let policy = RetryPolicy::new(3).with_jitter(f64::INFINITY);
        assert_eq!(policy.compute_delay(2), Duration::from_secs(2));

        let mut policy = RetryPolicy::new(3);
        policy.jitter_factor = f64::NAN;
        assert_eq!(policy.compute_delay(1), Duration::from_secs(1));
    }

    #[test]
    fn test_non_finite_settings_fail_validation() {
        for field in ["jitter_factor", "backoff_multiplier", "max_delay_secs"] {
            let mut config = RetryPolicyConfig::default();
            match field {
                "jitter_factor" => config.jitter_factor = f64::NAN,
                "backoff_multiplier" => config.backoff_multiplier = f64::NAN,
                _ => config.max_delay_secs = f64::INFINITY,
            }
            let err = config.validate_delays().unwrap_err();
            assert_eq!(err.code, "not_finite");
        }
        assert!(RetryPolicyConfig::default().validate_delays().is_ok());
    }
}
