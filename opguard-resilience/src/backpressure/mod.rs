//! Admission control: tenant rate limits and bounded queues.
//!
//! [`BackpressureManager`] owns one global [`TokenBucket`], a lazily created
//! [`TenantRateLimiter`] per tenant and lazily created named
//! [`BoundedQueue`]s. Rejections are audited and surface as
//! [`BackpressureError`].

pub mod queue;
pub mod rate_limiter;
pub mod token_bucket;

pub use queue::{BoundedQueue, DropPolicy, QueueSettings, QueueStats};
pub use rate_limiter::{BucketConfig, RateLimitConfig, RateSnapshot, TenantRateLimiter};
pub use token_bucket::TokenBucket;

use dashmap::DashMap;
use opguard_core::{
    AuditEmitter, AuditEventType, AuditRecord, BackpressureError, OperationContext,
    QueueFullError, RateLimitExceeded,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::observability::metrics::ReliabilityMetrics;

/// Queue configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Settings for queues without an explicit entry
    pub default: QueueSettings,
    pub queues: HashMap<String, QueueSettings>,
}

impl QueueConfig {
    pub fn with_queue(mut self, name: impl Into<String>, settings: QueueSettings) -> Self {
        self.queues.insert(name.into(), settings);
        self
    }

    pub fn settings_for(&self, name: &str) -> QueueSettings {
        self.queues
            .get(name)
            .or_else(|| self.queues.get(&name.to_lowercase()))
            .copied()
            .unwrap_or(self.default)
    }
}

/// Decision reported for an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureAction {
    Accept,
    Reject,
    Drop,
}

impl BackpressureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressureAction::Accept => "accept",
            BackpressureAction::Reject => "reject",
            BackpressureAction::Drop => "drop",
        }
    }
}

/// Result of a successful admission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureStatus {
    pub tenant_id: String,
    pub operation: String,
    pub backpressure_action: BackpressureAction,
    pub rate_limited: bool,
    /// Set when the queue is at capacity but its policy makes room by dropping
    pub queue_full: bool,
    pub queue_name: Option<String>,
    pub queue_size: Option<usize>,
}

/// Aggregate view over all limiters and queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureStats {
    pub global_rate: f64,
    pub global_limit: f64,
    pub global_available: f64,
    pub tenants: Vec<RateSnapshot>,
    pub queues: Vec<QueueStats>,
}

/// Coordinates rate limiting and queue admission for all tenants.
#[derive(Debug)]
pub struct BackpressureManager {
    rate_limits: RateLimitConfig,
    queue_config: QueueConfig,
    global: Arc<TokenBucket>,
    limiters: DashMap<String, Arc<TenantRateLimiter>>,
    queues: DashMap<String, Arc<BoundedQueue>>,
    audit: AuditEmitter,
}

impl BackpressureManager {
    pub fn new(
        rate_limits: RateLimitConfig,
        queue_config: QueueConfig,
        audit: AuditEmitter,
    ) -> Self {
        let global = Arc::new(rate_limits.global.bucket());
        Self {
            rate_limits,
            queue_config,
            global,
            limiters: DashMap::new(),
            queues: DashMap::new(),
            audit,
        }
    }

    /// Limiter for a tenant, created on first use with the tenant's limits
    pub fn rate_limiter(&self, tenant_id: &str) -> Arc<TenantRateLimiter> {
        if let Some(limiter) = self.limiters.get(tenant_id) {
            return Arc::clone(limiter.value());
        }

        let limits = self.rate_limits.tenant_limits(tenant_id);
        self.limiters
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(TenantRateLimiter::new(tenant_id, Arc::clone(&self.global), limits))
            })
            .value()
            .clone()
    }

    /// Named queue, created on first use with its configured settings
    pub fn queue(&self, name: &str) -> Arc<BoundedQueue> {
        if let Some(queue) = self.queues.get(name) {
            return Arc::clone(queue.value());
        }

        let settings = self.queue_config.settings_for(name);
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BoundedQueue::from_settings(name, settings)))
            .value()
            .clone()
    }

    /// Admit one request for `tenant_id`, consulting the named queue's
    /// fullness when `queue_name` is given.
    ///
    /// Only a full queue under [`DropPolicy::Reject`] refuses admission. A
    /// full queue with a dropping policy admits with
    /// [`BackpressureAction::Drop`]. The queue is checked before any token is
    /// taken, so a queue rejection leaves the rate limits untouched.
    pub async fn check_backpressure(
        &self,
        tenant_id: &str,
        queue_name: Option<&str>,
        operation: &str,
        context: &OperationContext,
    ) -> Result<BackpressureStatus, BackpressureError> {
        let mut queue_size = None;
        let mut queue_full = false;
        if let Some(name) = queue_name {
            let queue = self.queue(name);
            self.ensure_queue_accepts(&queue, tenant_id, operation, context)
                .await?;
            let size = queue.size();
            queue_full = size >= queue.max_size();
            queue_size = Some(size);
        }

        let request_id = context.correlation_id.as_deref().unwrap_or(operation);
        self.take_token(tenant_id, request_id, operation, context)
            .await?;

        Ok(BackpressureStatus {
            tenant_id: tenant_id.to_string(),
            operation: operation.to_string(),
            backpressure_action: if queue_full {
                BackpressureAction::Drop
            } else {
                BackpressureAction::Accept
            },
            rate_limited: false,
            queue_full,
            queue_name: queue_name.map(str::to_string),
            queue_size,
        })
    }

    /// Run the operation only if admission succeeds. A rejected operation
    /// is never invoked.
    pub async fn execute_with_backpressure<T, E, F, Fut>(
        &self,
        tenant_id: &str,
        queue_name: Option<&str>,
        operation_name: &str,
        operation: F,
        context: &OperationContext,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BackpressureError>,
    {
        self.check_backpressure(tenant_id, queue_name, operation_name, context)
            .await
            .map_err(E::from)?;
        operation().await
    }

    /// Admit and enqueue an item on a named queue.
    ///
    /// Returns the item dropped by the queue's policy, if any.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        tenant_id: &str,
        item: Value,
        context: &OperationContext,
    ) -> Result<Option<Value>, BackpressureError> {
        let queue = self.queue(queue_name);
        self.ensure_queue_accepts(&queue, tenant_id, "enqueue", context)
            .await?;
        self.take_token(tenant_id, queue_name, "enqueue", context)
            .await?;

        match queue.put(item) {
            Ok(None) => Ok(None),
            Ok(Some(dropped)) => {
                self.emit_drop(&queue, tenant_id, context).await;
                Ok(Some(dropped))
            }
            Err(err) => {
                self.reject_queue_full(&err, tenant_id, "enqueue", context)
                    .await;
                Err(err.into())
            }
        }
    }

    /// Reject when the queue is at capacity under [`DropPolicy::Reject`].
    /// Takes nothing from the queue or the rate limits.
    async fn ensure_queue_accepts(
        &self,
        queue: &BoundedQueue,
        tenant_id: &str,
        operation: &str,
        context: &OperationContext,
    ) -> Result<(), BackpressureError> {
        let size = queue.size();
        if size < queue.max_size() || queue.drop_policy() != DropPolicy::Reject {
            return Ok(());
        }

        let err = QueueFullError {
            queue_name: queue.name().to_string(),
            capacity: queue.max_size(),
            current_size: size,
        };
        self.reject_queue_full(&err, tenant_id, operation, context)
            .await;
        Err(err.into())
    }

    async fn take_token(
        &self,
        tenant_id: &str,
        request_id: &str,
        operation: &str,
        context: &OperationContext,
    ) -> Result<(), BackpressureError> {
        if let Err(err) = self.rate_limiter(tenant_id).check_rate_limit(request_id) {
            self.reject_rate_limited(&err, operation, context).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub fn get_stats(&self) -> BackpressureStats {
        let mut tenants: Vec<RateSnapshot> = self
            .limiters
            .iter()
            .map(|entry| entry.value().get_current_rates())
            .collect();
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        let mut queues: Vec<QueueStats> =
            self.queues.iter().map(|entry| entry.value().stats()).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));

        BackpressureStats {
            global_rate: self.global.observed_rate(),
            global_limit: self.global.rate(),
            global_available: self.global.available_tokens(),
            tenants,
            queues,
        }
    }

    async fn reject_rate_limited(
        &self,
        err: &RateLimitExceeded,
        operation: &str,
        context: &OperationContext,
    ) {
        warn!(
            tenant_id = %err.tenant_id,
            limit_type = %err.limit_type,
            current_rate = err.current_rate,
            limit = err.limit,
            operation = operation,
            "Rate limit exceeded, rejecting request"
        );
        ReliabilityMetrics::backpressure_rejection(&err.tenant_id, "rate_limited");

        let record = AuditRecord::new(AuditEventType::Backpressure)
            .with_context(context)
            .with_tenant(err.tenant_id.as_str())
            .with_audit_code(format!(
                "BACKPRESSURE.RATE_LIMITED.{}",
                err.limit_type.to_string().to_uppercase()
            ))
            .with_detail("backpressure_action", BackpressureAction::Reject.as_str())
            .with_detail("reason", "rate_limited")
            .with_detail("operation", operation)
            .with_detail("limit_type", err.limit_type.to_string())
            .with_detail("current_rate", err.current_rate)
            .with_detail("limit", err.limit);
        self.audit.emit(record).await;
    }

    async fn reject_queue_full(
        &self,
        err: &QueueFullError,
        tenant_id: &str,
        operation: &str,
        context: &OperationContext,
    ) {
        warn!(
            tenant_id = tenant_id,
            queue = %err.queue_name,
            capacity = err.capacity,
            current_size = err.current_size,
            operation = operation,
            "Queue full, rejecting request"
        );
        ReliabilityMetrics::backpressure_rejection(tenant_id, "queue_full");

        let record = AuditRecord::new(AuditEventType::Backpressure)
            .with_context(context)
            .with_tenant(tenant_id)
            .with_audit_code("BACKPRESSURE.QUEUE_FULL")
            .with_detail("backpressure_action", BackpressureAction::Reject.as_str())
            .with_detail("reason", "queue_full")
            .with_detail("operation", operation)
            .with_detail("queue_name", err.queue_name.as_str())
            .with_detail("capacity", err.capacity)
            .with_detail("current_size", err.current_size);
        self.audit.emit(record).await;
    }

    async fn emit_drop(&self, queue: &BoundedQueue, tenant_id: &str, context: &OperationContext) {
        let policy = match queue.drop_policy() {
            DropPolicy::DropOldest => "drop_oldest",
            DropPolicy::DropNewest => "drop_newest",
            DropPolicy::Reject => "reject",
        };

        let record = AuditRecord::new(AuditEventType::Backpressure)
            .with_context(context)
            .with_tenant(tenant_id)
            .with_audit_code("BACKPRESSURE.QUEUE_DROP")
            .with_detail("backpressure_action", BackpressureAction::Drop.as_str())
            .with_detail("reason", "queue_full")
            .with_detail("drop_policy", policy)
            .with_detail("queue_name", queue.name())
            .with_detail("capacity", queue.max_size());
        self.audit.emit(record).await;
    }
}
