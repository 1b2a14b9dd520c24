//! Prometheus metrics for the reliability layers.
//!
//! Metrics are recorded through the `metrics` facade. Without an installed
//! recorder they are no-ops, so the managers record unconditionally.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opguard_core::{CircuitState, OperationCategory};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const TIMEOUTS_TOTAL: &str = "opguard_timeouts_total";
pub const RETRY_ATTEMPTS_TOTAL: &str = "opguard_retry_attempts_total";
pub const RETRY_EXHAUSTED_TOTAL: &str = "opguard_retry_exhausted_total";
pub const IDEMPOTENCY_HITS_TOTAL: &str = "opguard_idempotency_hits_total";
pub const BACKPRESSURE_REJECTIONS_TOTAL: &str = "opguard_backpressure_rejections_total";
pub const CIRCUIT_STATE: &str = "opguard_circuit_state";
pub const CIRCUIT_REJECTIONS_TOTAL: &str = "opguard_circuit_rejections_total";

/// Errors that can occur during metrics setup
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to install metrics exporter: {0}")]
    Installation(String),

    #[error("Metrics not initialized")]
    NotInitialized,
}

/// Install the Prometheus recorder. Later calls return the existing handle.
pub fn init_metrics() -> Result<PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    PROMETHEUS_HANDLE
        .set(handle.clone())
        .map_err(|_| MetricsError::Installation("Handle already set".to_string()))?;

    register_metric_descriptions();

    Ok(handle)
}

/// Render the current metrics in the Prometheus text format
pub fn render_metrics() -> Result<String, MetricsError> {
    PROMETHEUS_HANDLE
        .get()
        .map(|handle| handle.render())
        .ok_or(MetricsError::NotInitialized)
}

fn register_metric_descriptions() {
    describe_counter!(TIMEOUTS_TOTAL, "Operations that exceeded their deadline");
    describe_counter!(
        RETRY_ATTEMPTS_TOTAL,
        "Retries scheduled after a retryable failure"
    );
    describe_counter!(
        RETRY_EXHAUSTED_TOTAL,
        "Operations that used up all retry attempts"
    );
    describe_counter!(
        IDEMPOTENCY_HITS_TOTAL,
        "Results served from the idempotency cache"
    );
    describe_counter!(
        BACKPRESSURE_REJECTIONS_TOTAL,
        "Requests refused by admission control"
    );
    describe_gauge!(
        CIRCUIT_STATE,
        "Circuit state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_counter!(
        CIRCUIT_REJECTIONS_TOTAL,
        "Calls rejected by a circuit breaker"
    );
}

/// Recording helpers used by the managers
pub struct ReliabilityMetrics;

impl ReliabilityMetrics {
    pub fn timeout(category: &OperationCategory) {
        counter!(TIMEOUTS_TOTAL, "category" => category.as_str().to_string()).increment(1);
    }

    pub fn retry_attempt(category: &OperationCategory) {
        counter!(RETRY_ATTEMPTS_TOTAL, "category" => category.as_str().to_string()).increment(1);
    }

    pub fn retry_exhausted(category: &OperationCategory) {
        counter!(RETRY_EXHAUSTED_TOTAL, "category" => category.as_str().to_string()).increment(1);
    }

    pub fn idempotency_hit(category: &OperationCategory) {
        counter!(IDEMPOTENCY_HITS_TOTAL, "category" => category.as_str().to_string()).increment(1);
    }

    pub fn backpressure_rejection(tenant_id: &str, reason: &'static str) {
        counter!(
            BACKPRESSURE_REJECTIONS_TOTAL,
            "tenant" => tenant_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn circuit_state(service: &str, state: CircuitState) {
        gauge!(CIRCUIT_STATE, "service" => service.to_string()).set(circuit_state_value(state));
    }

    pub fn circuit_rejection(service: &str) {
        counter!(CIRCUIT_REJECTIONS_TOTAL, "service" => service.to_string()).increment(1);
    }
}

pub fn circuit_state_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_state_values() {
        assert_eq!(circuit_state_value(CircuitState::Closed), 0.0);
        assert_eq!(circuit_state_value(CircuitState::HalfOpen), 1.0);
        assert_eq!(circuit_state_value(CircuitState::Open), 2.0);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        ReliabilityMetrics::timeout(&OperationCategory::KvGet);
        ReliabilityMetrics::backpressure_rejection("acme", "rate_limited");
        ReliabilityMetrics::circuit_state("nats", CircuitState::Open);
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics().unwrap();
        let second = init_metrics().unwrap();

        ReliabilityMetrics::timeout(&OperationCategory::KvGet);
        let rendered = first.render();
        assert!(rendered.contains(TIMEOUTS_TOTAL));
        assert_eq!(rendered.is_empty(), second.render().is_empty());
        assert!(render_metrics().is_ok());
    }
}
