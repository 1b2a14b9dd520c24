//! Timeout enforcement per operation category.
//!
//! Every guarded operation runs against a deadline chosen by its
//! [`OperationCategory`]. When the deadline expires the operation's future is
//! dropped (which cancels it), a [`TimeoutError`] is returned and a
//! `timeout_occurred` audit record is emitted.
//!
//! # Example
//!
//! ```no_run
//! use opguard_core::{AuditEmitter, GuardError, OperationCategory, OperationContext};
//! use opguard_resilience::timeout::{TimeoutConfig, TimeoutManager};
//!
//! # async fn example() -> Result<(), GuardError<std::io::Error>> {
//! let manager = TimeoutManager::new(TimeoutConfig::default(), AuditEmitter::disabled());
//!
//! let value = manager
//!     .execute_with_timeout(
//!         &OperationCategory::KvGet,
//!         "kv.get orders/42",
//!         async { Ok::<_, GuardError<std::io::Error>>(42) },
//!         None,
//!         &OperationContext::for_tenant("acme"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use opguard_core::{
    AuditEmitter, AuditEventType, AuditRecord, OperationCategory, OperationContext, TimeoutError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;
use validator::Validate;

use crate::observability::metrics::ReliabilityMetrics;

/// Timeout applied to categories without an explicit entry
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default timeout for unmapped categories, in seconds
    #[validate(range(min = 0.001))]
    pub default_secs: f64,
    /// Category-specific timeouts, in seconds
    pub categories: HashMap<OperationCategory, f64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let categories = [
            (OperationCategory::NatsConnect, 10.0),
            (OperationCategory::NatsPublish, 5.0),
            (OperationCategory::NatsSubscribe, 10.0),
            (OperationCategory::NatsRequest, 30.0),
            (OperationCategory::KvGet, 5.0),
            (OperationCategory::KvPut, 5.0),
            (OperationCategory::KvDelete, 5.0),
            (OperationCategory::KvWatch, 60.0),
            (OperationCategory::ExecutionIntent, 60.0),
            (OperationCategory::ApprovalCheck, 30.0),
        ]
        .into_iter()
        .collect();

        Self {
            default_secs: DEFAULT_TIMEOUT_SECS,
            categories,
        }
    }
}

impl TimeoutConfig {
    /// Create a config with only a default timeout
    pub fn new(default: Duration) -> Self {
        Self {
            default_secs: default.as_secs_f64(),
            categories: HashMap::new(),
        }
    }

    /// Add a category-specific timeout
    pub fn with_category(mut self, category: OperationCategory, timeout: Duration) -> Self {
        self.categories.insert(category, timeout.as_secs_f64());
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS))
    }

    /// Get the timeout for a category. Unknown categories get the default.
    pub fn get_timeout(&self, category: &OperationCategory) -> Duration {
        self.categories
            .get(category)
            .and_then(|secs| Duration::try_from_secs_f64(*secs).ok())
            .unwrap_or_else(|| self.default_timeout())
    }
}

/// Enforces per-category deadlines and audits expirations.
#[derive(Debug)]
pub struct TimeoutManager {
    config: TimeoutConfig,
    audit: AuditEmitter,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig, audit: AuditEmitter) -> Self {
        Self { config, audit }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    pub fn get_timeout(&self, category: &OperationCategory) -> Duration {
        self.config.get_timeout(category)
    }

    /// Run `operation` bounded by the category's timeout, or `timeout_override`
    /// when given. Errors produced by the operation itself pass through
    /// unchanged.
    pub async fn execute_with_timeout<T, E, Fut>(
        &self,
        category: &OperationCategory,
        operation_name: &str,
        operation: Fut,
        timeout_override: Option<Duration>,
        context: &OperationContext,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<TimeoutError>,
    {
        let duration = timeout_override.unwrap_or_else(|| self.get_timeout(category));

        match timeout(duration, operation).await {
            Ok(result) => result,
            Err(_elapsed) => {
                let err = TimeoutError {
                    category: category.clone(),
                    timeout: duration,
                    operation_name: operation_name.to_string(),
                };

                warn!(
                    category = %category,
                    operation = operation_name,
                    timeout_secs = duration.as_secs_f64(),
                    tenant_id = ?context.tenant_id,
                    "Operation timed out"
                );
                ReliabilityMetrics::timeout(category);
                self.emit_timeout(&err, context).await;

                Err(err.into())
            }
        }
    }

    /// Wrap an async function so every invocation runs under this manager's
    /// timeout for `category`. `context_for` derives the audit context from
    /// the argument.
    pub fn wrap<A, C, F, Fut, T, E>(
        self: &Arc<Self>,
        category: OperationCategory,
        operation_name: impl Into<String>,
        context_for: C,
        operation: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>> + Clone + Send + Sync
    where
        A: Send + 'static,
        C: Fn(&A) -> OperationContext + Clone + Send + Sync + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TimeoutError> + Send + 'static,
    {
        let manager = Arc::clone(self);
        let operation_name: Arc<str> = Arc::from(operation_name.into());

        move |arg: A| -> BoxFuture<'static, Result<T, E>> {
            let manager = Arc::clone(&manager);
            let category = category.clone();
            let operation_name = Arc::clone(&operation_name);
            let context = context_for(&arg);
            let fut = operation(arg);

            Box::pin(async move {
                manager
                    .execute_with_timeout(&category, &operation_name, fut, None, &context)
                    .await
            })
        }
    }

    async fn emit_timeout(&self, err: &TimeoutError, context: &OperationContext) {
        let record = AuditRecord::new(AuditEventType::TimeoutOccurred)
            .with_context(context)
            .with_audit_code(err.category.audit_code("timeout"))
            .with_detail("timeout_category", err.category.as_str())
            .with_detail("operation", err.operation_name.as_str())
            .with_detail("timeout_seconds", err.timeout_seconds());

        self.audit.emit(record).await;
    }
}
