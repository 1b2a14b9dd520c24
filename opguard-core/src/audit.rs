//! Audit emission for reliability events.
//!
//! Every notable state transition in the substrate (timeouts, retry attempts
//! and exhaustion, idempotency hits, backpressure rejections, circuit state
//! changes) produces an [`AuditRecord`] that is handed to an injected
//! [`AuditSink`]. Emission is best-effort: [`AuditEmitter`] logs failures
//! locally and never propagates them to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::OperationContext;

/// Result type for audit operations
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors that can occur while emitting an audit record
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

/// Kind of reliability event being audited
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuditEventType {
    #[serde(rename = "timeout_occurred")]
    TimeoutOccurred,
    #[serde(rename = "retry_attempt")]
    RetryAttempt,
    #[serde(rename = "retry_exhausted")]
    RetryExhausted,
    #[serde(rename = "idempotency.hit")]
    IdempotencyHit,
    #[serde(rename = "idempotency.record")]
    IdempotencyRecord,
    #[serde(rename = "backpressure")]
    Backpressure,
    #[serde(rename = "circuit_breaker.state_change")]
    CircuitStateChange,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TimeoutOccurred => "timeout_occurred",
            AuditEventType::RetryAttempt => "retry_attempt",
            AuditEventType::RetryExhausted => "retry_exhausted",
            AuditEventType::IdempotencyHit => "idempotency.hit",
            AuditEventType::IdempotencyRecord => "idempotency.record",
            AuditEventType::Backpressure => "backpressure",
            AuditEventType::CircuitStateChange => "circuit_breaker.state_change",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit record. Serializes to a flat JSON mapping: the fixed
/// correlation fields followed by the event-specific details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_code: Option<String>,
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            audit_code: None,
            tenant_id: None,
            correlation_id: None,
            trace_id: None,
            details: Map::new(),
        }
    }

    /// Copy tenant/correlation/trace ids and `additional_context` from the
    /// operation context.
    pub fn with_context(mut self, context: &OperationContext) -> Self {
        self.tenant_id = context.tenant_id.clone();
        self.correlation_id = context.correlation_id.clone();
        self.trace_id = context.trace_id.clone();
        self.details.insert(
            "additional_context".to_string(),
            Value::Object(context.additional.clone()),
        );
        self
    }

    pub fn with_audit_code(mut self, code: impl Into<String>) -> Self {
        self.audit_code = Some(code.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn to_value(&self) -> AuditResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, record: &AuditRecord) -> AuditResult<()>;
}

/// Handle used by the managers to emit audit records best-effort.
#[derive(Clone, Default)]
pub struct AuditEmitter {
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// An emitter with no sink; records are dropped with a warning.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub async fn emit(&self, record: AuditRecord) {
        let Some(sink) = &self.sink else {
            warn!(
                event_type = %record.event_type,
                audit_id = %record.id,
                "No audit sink registered, dropping audit record"
            );
            return;
        };

        if let Err(e) = sink.emit(&record).await {
            error!(
                event_type = %record.event_type,
                audit_id = %record.id,
                error = %e,
                "Failed to emit audit record"
            );
        }
    }
}

impl fmt::Debug for AuditEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditEmitter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Writes audit records using the tracing crate
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn emit(&self, record: &AuditRecord) -> AuditResult<()> {
        let details = serde_json::to_string(&record.details)?;
        match record.event_type {
            AuditEventType::IdempotencyHit
            | AuditEventType::IdempotencyRecord
            | AuditEventType::RetryAttempt => {
                info!(
                    audit_id = %record.id,
                    event_type = %record.event_type,
                    audit_code = ?record.audit_code,
                    tenant_id = ?record.tenant_id,
                    correlation_id = ?record.correlation_id,
                    trace_id = ?record.trace_id,
                    details = %details,
                    "Audit event"
                );
            }
            _ => {
                warn!(
                    audit_id = %record.id,
                    event_type = %record.event_type,
                    audit_code = ?record.audit_code,
                    tenant_id = ?record.tenant_id,
                    correlation_id = ?record.correlation_id,
                    trace_id = ?record.trace_id,
                    details = %details,
                    "Audit event"
                );
            }
        }
        Ok(())
    }
}

/// Discards every record
#[derive(Debug, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn emit(&self, _record: &AuditRecord) -> AuditResult<()> {
        Ok(())
    }
}

/// Keeps records in memory. Useful for tests and for draining into another
/// store in batches.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn records_of(&self, event_type: AuditEventType) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.event_type == event_type)
            .collect()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.records_of(event_type).len()
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, record: &AuditRecord) -> AuditResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}

/// Writes audit records to multiple destinations
#[derive(Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a sink to the composite
    pub fn add_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl AuditSink for CompositeAuditSink {
    async fn emit(&self, record: &AuditRecord) -> AuditResult<()> {
        let mut failures = 0;

        for sink in &self.sinks {
            if let Err(e) = sink.emit(record).await {
                error!("Audit sink failed: {}", e);
                failures += 1;
            }
        }

        // Only an error when every sink failed
        if failures > 0 && failures == self.sinks.len() {
            return Err(AuditError::WriteFailed("All audit sinks failed".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn emit(&self, _record: &AuditRecord) -> AuditResult<()> {
            Err(AuditError::WriteFailed("disk full".to_string()))
        }
    }

    #[test]
    fn test_record_serializes_flat() {
        let ctx = OperationContext::for_tenant("acme")
            .with_correlation_id("c-1")
            .with_field("subject", "orders");
        let record = AuditRecord::new(AuditEventType::TimeoutOccurred)
            .with_context(&ctx)
            .with_detail("timeout_seconds", 5.0)
            .with_detail("operation", "kv.get");

        let value = record.to_value().unwrap();
        assert_eq!(value["event_type"], "timeout_occurred");
        assert_eq!(value["tenant_id"], "acme");
        assert_eq!(value["correlation_id"], "c-1");
        assert_eq!(value["timeout_seconds"], 5.0);
        assert_eq!(value["operation"], "kv.get");
        assert_eq!(value["additional_context"]["subject"], "orders");
    }

    #[test]
    fn test_event_type_names() {
        let json = serde_json::to_string(&AuditEventType::CircuitStateChange).unwrap();
        assert_eq!(json, "\"circuit_breaker.state_change\"");
        assert_eq!(AuditEventType::IdempotencyHit.as_str(), "idempotency.hit");
    }

    #[tokio::test]
    async fn test_memory_sink_collects() {
        let sink = Arc::new(MemoryAuditSink::new());
        let emitter = AuditEmitter::new(sink.clone());

        emitter
            .emit(AuditRecord::new(AuditEventType::RetryAttempt))
            .await;
        emitter
            .emit(AuditRecord::new(AuditEventType::RetryAttempt))
            .await;
        emitter
            .emit(AuditRecord::new(AuditEventType::RetryExhausted))
            .await;

        assert_eq!(sink.count(AuditEventType::RetryAttempt), 2);
        assert_eq!(sink.count(AuditEventType::RetryExhausted), 1);

        sink.clear();
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_emitter_swallows_sink_failure() {
        let emitter = AuditEmitter::new(Arc::new(FailingSink));
        // Must not panic or propagate
        emitter
            .emit(AuditRecord::new(AuditEventType::Backpressure))
            .await;
    }

    #[tokio::test]
    async fn test_disabled_emitter_drops_records() {
        let emitter = AuditEmitter::disabled();
        assert!(!emitter.is_enabled());
        emitter
            .emit(AuditRecord::new(AuditEventType::Backpressure))
            .await;
    }

    #[tokio::test]
    async fn test_composite_sink_partial_failure() {
        let memory = Arc::new(MemoryAuditSink::new());
        let composite = CompositeAuditSink::new()
            .add_sink(Arc::new(FailingSink))
            .add_sink(memory.clone());

        let result = composite
            .emit(&AuditRecord::new(AuditEventType::Backpressure))
            .await;
        assert!(result.is_ok());
        assert_eq!(memory.records().len(), 1);
    }

    #[tokio::test]
    async fn test_composite_sink_all_fail() {
        let composite = CompositeAuditSink::new().add_sink(Arc::new(FailingSink));
        let result = composite
            .emit(&AuditRecord::new(AuditEventType::Backpressure))
            .await;
        assert!(matches!(result, Err(AuditError::WriteFailed(_))));
    }

    #[tokio::test]
    async fn test_tracing_sink() {
        let sink = TracingAuditSink::new();
        let result = sink
            .emit(&AuditRecord::new(AuditEventType::TimeoutOccurred))
            .await;
        assert!(result.is_ok());
    }
}
