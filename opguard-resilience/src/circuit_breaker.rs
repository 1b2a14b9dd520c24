//! Circuit breakers for preventing cascading failures.
//!
//! A breaker monitors calls to one downstream service and temporarily blocks
//! them when failures exceed a threshold, giving the service time to recover.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through. Consecutive failures
//!   are counted and a success resets the count.
//! - **Open**: `failure_threshold` consecutive failures were seen. Calls are
//!   rejected with [`CircuitBreakerError`] without running the operation until
//!   `recovery_timeout` has passed since the last failure.
//! - **HalfOpen**: up to `half_open_max_calls` trial calls run concurrently.
//!   `success_threshold` successes close the circuit, any failure reopens it.
//!
//! # Example
//!
//! ```no_run
//! use opguard_core::{AuditEmitter, GuardError};
//! use opguard_resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), GuardError<std::io::Error>> {
//! let breaker = CircuitBreaker::new(
//!     "approvals",
//!     CircuitBreakerConfig::default(),
//!     AuditEmitter::disabled(),
//! );
//!
//! let approved = breaker
//!     .call(|| async { Ok::<_, GuardError<std::io::Error>>(true) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use opguard_core::{
    AuditEmitter, AuditEventType, AuditRecord, CircuitBreakerError, CircuitState,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::observability::metrics::ReliabilityMetrics;

/// Number of state transitions kept per breaker
pub const HISTORY_LIMIT: usize = 100;

/// Async health predicate
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    /// Successes in half-open state needed to close the circuit
    #[validate(range(min = 1))]
    pub success_threshold: u32,
    /// Time since the last failure before a trial call is allowed, in seconds
    #[validate(range(min = 0.0))]
    pub recovery_timeout_secs: f64,
    /// Maximum concurrent trial calls in half-open state
    #[validate(range(min = 1))]
    pub half_open_max_calls: u32,
    /// Failures further apart than this do not count as consecutive
    #[validate(range(min = 0.0))]
    pub failure_window_secs: Option<f64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout_secs: 60.0,
            half_open_max_calls: 3,
            failure_window_secs: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            recovery_timeout_secs: recovery_timeout.as_secs_f64(),
            ..Self::default()
        }
    }

    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window_secs = Some(window.as_secs_f64());
        self
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.recovery_timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs(60))
    }

    pub fn failure_window(&self) -> Option<Duration> {
        self.failure_window_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Breaker settings for all services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakersConfig {
    /// Settings for services without an explicit entry
    pub default: CircuitBreakerConfig,
    pub services: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakersConfig {
    pub fn with_service(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.services.insert(name.into(), config);
        self
    }

    pub fn config_for(&self, service_name: &str) -> CircuitBreakerConfig {
        self.services
            .get(service_name)
            .or_else(|| self.services.get(&service_name.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub service_name: String,
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub failure_count: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub times_opened: u64,
    pub recent_transitions: Vec<StateTransition>,
}

#[derive(Debug, Default)]
struct CircuitBreakerMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    opened: AtomicU64,
}

impl CircuitBreakerMetrics {
    fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn record_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    history: VecDeque<StateTransition>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            last_failure: None,
            last_failure_at: None,
            history: VecDeque::new(),
        }
    }

    fn mark_failure(&mut self, now: Instant) {
        self.last_failure = Some(now);
        self.last_failure_at = Some(Utc::now());
    }
}

/// Releases a call's slot if its future is dropped before the operation
/// finishes. The abandoned call counts as a failure.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    invoked: bool,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.invoked {
            // Dropped before the operation ran: free the slot, no failure
            self.breaker.release_slot();
            return;
        }
        debug!(service = %self.breaker.name, "Call abandoned before completion");
        if let Some(transition) = self.breaker.on_error("call abandoned") {
            self.breaker.emit_transition_detached(transition);
        }
    }
}

/// Circuit breaker for one service
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    metrics: CircuitBreakerMetrics,
    health_check: RwLock<Option<HealthCheck>>,
    audit: AuditEmitter,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, audit: AuditEmitter) -> Self {
        let name = name.into();
        debug!(service = %name, "Creating circuit breaker");
        ReliabilityMetrics::circuit_state(&name, CircuitState::Closed);

        Self {
            name,
            config,
            state: Mutex::new(CircuitBreakerState::new()),
            metrics: CircuitBreakerMetrics::default(),
            health_check: RwLock::new(None),
            audit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Call an operation under circuit breaker protection.
    ///
    /// Rejected calls never invoke `operation`. Any error returned by the
    /// operation counts as a failure and is passed back unchanged.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitBreakerError>,
    {
        let transition = match self.before_call() {
            Ok(transition) => transition,
            Err(err) => {
                debug!(
                    service = %self.name,
                    state = %err.state,
                    "Circuit breaker rejected call"
                );
                ReliabilityMetrics::circuit_rejection(&self.name);
                return Err(err.into());
            }
        };

        let mut in_flight = InFlight {
            breaker: self,
            invoked: false,
            finished: false,
        };

        if let Some(transition) = transition {
            self.emit_transition(&transition).await;
        }

        in_flight.invoked = true;
        let result = operation().await;
        in_flight.finished = true;

        let transition = match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_error("operation failed"),
        };
        if let Some(transition) = transition {
            self.emit_transition(&transition).await;
        }

        result
    }

    /// Force the circuit closed and clear all counters
    pub async fn reset(&self) {
        let transition = {
            let mut state = self.lock();
            let transition = (state.state != CircuitState::Closed)
                .then(|| self.transition(&mut state, CircuitState::Closed, "manual reset"));
            state.consecutive_failures = 0;
            state.consecutive_successes = 0;
            state.half_open_in_flight = 0;
            state.last_failure = None;
            transition
        };

        info!(service = %self.name, "Circuit breaker reset");
        if let Some(transition) = transition {
            self.emit_transition(&transition).await;
        }
    }

    /// Install an async health predicate
    pub fn set_health_check<F, Fut>(&self, check: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let check: HealthCheck = Arc::new(move || check().boxed());
        *self
            .health_check
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(check);
    }

    /// Install a synchronous health predicate
    pub fn set_sync_health_check<F>(&self, check: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let check = Arc::new(check);
        self.set_health_check(move || {
            let check = Arc::clone(&check);
            async move { check() }
        });
    }

    /// Run the health predicate. Without one, the service is healthy unless
    /// the circuit is open. A panicking predicate reports unhealthy.
    pub async fn health_check(&self) -> bool {
        let check = self
            .health_check
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        match check {
            Some(check) => match AssertUnwindSafe(check()).catch_unwind().await {
                Ok(healthy) => healthy,
                Err(_) => {
                    warn!(service = %self.name, "Health check panicked");
                    false
                }
            },
            None => self.state() != CircuitState::Open,
        }
    }

    pub fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            service_name: self.name.clone(),
            state: state.state,
            failure_count: state.consecutive_failures,
            success_count: state.consecutive_successes,
            half_open_in_flight: state.half_open_in_flight,
            last_failure_at: state.last_failure_at,
            total_successes: self.metrics.successes.load(Ordering::Relaxed),
            total_failures: self.metrics.failures.load(Ordering::Relaxed),
            total_rejections: self.metrics.rejections.load(Ordering::Relaxed),
            times_opened: self.metrics.opened.load(Ordering::Relaxed),
            recent_transitions: state.history.iter().cloned().collect(),
        }
    }

    /// Recorded state transitions, oldest first
    pub fn history(&self) -> Vec<StateTransition> {
        self.lock().history.iter().cloned().collect()
    }

    /// Admit or reject a call. Returns the OPEN -> HALF_OPEN transition when
    /// this call is the first trial call.
    fn before_call(&self) -> Result<Option<StateTransition>, CircuitBreakerError> {
        let now = Instant::now();
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                let recovered = state
                    .last_failure
                    .map(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout())
                    .unwrap_or(true);

                if recovered {
                    let transition = self.transition(
                        &mut state,
                        CircuitState::HalfOpen,
                        "recovery timeout elapsed",
                    );
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.half_open_in_flight = 1;
                    Ok(Some(transition))
                } else {
                    Err(self.reject(&state))
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_in_flight >= self.config.half_open_max_calls {
                    Err(self.reject(&state))
                } else {
                    state.half_open_in_flight += 1;
                    Ok(None)
                }
            }
        }
    }

    fn on_success(&self) -> Option<StateTransition> {
        let mut state = self.lock();
        self.metrics.record_success();

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.consecutive_successes += 1;

                if state.consecutive_successes >= self.config.success_threshold {
                    let transition =
                        self.transition(&mut state, CircuitState::Closed, "trial calls succeeded");
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.half_open_in_flight = 0;
                    Some(transition)
                } else {
                    None
                }
            }
            // A call admitted before the circuit opened
            CircuitState::Open => None,
        }
    }

    fn on_error(&self, reason: &str) -> Option<StateTransition> {
        let now = Instant::now();
        let mut state = self.lock();
        self.metrics.record_failure();

        match state.state {
            CircuitState::Closed => {
                if let (Some(window), Some(last)) =
                    (self.config.failure_window(), state.last_failure)
                {
                    if now.saturating_duration_since(last) > window {
                        state.consecutive_failures = 0;
                    }
                }
                state.consecutive_failures += 1;
                state.mark_failure(now);

                if state.consecutive_failures >= self.config.failure_threshold {
                    Some(self.transition(&mut state, CircuitState::Open, reason))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
                state.mark_failure(now);
                Some(self.transition(&mut state, CircuitState::Open, reason))
            }
            CircuitState::Open => {
                state.consecutive_failures += 1;
                state.mark_failure(now);
                None
            }
        }
    }

    /// Give back a half-open trial slot taken by a call that never ran
    fn release_slot(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    fn reject(&self, state: &CircuitBreakerState) -> CircuitBreakerError {
        self.metrics.record_rejected();
        CircuitBreakerError {
            service_name: self.name.clone(),
            state: state.state,
            failure_count: state.consecutive_failures,
        }
    }

    fn transition(
        &self,
        state: &mut CircuitBreakerState,
        to: CircuitState,
        reason: &str,
    ) -> StateTransition {
        let transition = StateTransition {
            service_name: self.name.clone(),
            from_state: state.state,
            to_state: to,
            failure_count: state.consecutive_failures,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        };

        state.state = to;
        state.history.push_back(transition.clone());
        while state.history.len() > HISTORY_LIMIT {
            state.history.pop_front();
        }

        ReliabilityMetrics::circuit_state(&self.name, to);
        match to {
            CircuitState::Open => {
                self.metrics.record_opened();
                warn!(
                    service = %self.name,
                    from = %transition.from_state,
                    failure_count = transition.failure_count,
                    reason = reason,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(service = %self.name, "Circuit breaker half-open, probing");
            }
            CircuitState::Closed => {
                info!(service = %self.name, reason = reason, "Circuit breaker closed");
            }
        }

        transition
    }

    fn transition_record(&self, transition: &StateTransition) -> AuditRecord {
        AuditRecord::new(AuditEventType::CircuitStateChange)
            .with_audit_code(format!("CIRCUIT_BREAKER.{}", transition.to_state))
            .with_detail("service_name", transition.service_name.as_str())
            .with_detail("from_state", transition.from_state.to_string())
            .with_detail("to_state", transition.to_state.to_string())
            .with_detail("failure_count", transition.failure_count)
            .with_detail("reason", transition.reason.as_str())
    }

    async fn emit_transition(&self, transition: &StateTransition) {
        self.audit.emit(self.transition_record(transition)).await;
    }

    fn emit_transition_detached(&self, transition: StateTransition) {
        let record = self.transition_record(&transition);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let audit = self.audit.clone();
                handle.spawn(async move { audit.emit(record).await });
            }
            Err(_) => {
                warn!(
                    service = %self.name,
                    to_state = %transition.to_state,
                    "No runtime available, dropping state change audit record"
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns one breaker per service name
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitBreakersConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    audit: AuditEmitter,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakersConfig, audit: AuditEmitter) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            audit,
        }
    }

    /// Breaker for `service_name`, created on first use. `config` only
    /// applies when the breaker is created; otherwise the configured
    /// settings for the service are used.
    pub fn get_breaker(
        &self,
        service_name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(service_name) {
            return Arc::clone(breaker.value());
        }

        self.breakers
            .entry(service_name.to_string())
            .or_insert_with(|| {
                let config = config.unwrap_or_else(|| self.config.config_for(service_name));
                Arc::new(CircuitBreaker::new(service_name, config, self.audit.clone()))
            })
            .value()
            .clone()
    }

    pub async fn call_with_breaker<T, E, F, Fut>(
        &self,
        service_name: &str,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitBreakerError>,
    {
        self.get_breaker(service_name, None).call(operation).await
    }

    /// Wrap an async function so every invocation goes through the breaker
    /// for `service_name`.
    pub fn protect<A, F, Fut, T, E>(
        self: &Arc<Self>,
        service_name: impl Into<String>,
        operation: F,
    ) -> impl Fn(A) -> BoxFuture<'static, Result<T, E>> + Clone + Send + Sync
    where
        A: Send + 'static,
        F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<CircuitBreakerError> + Send + 'static,
    {
        let manager = Arc::clone(self);
        let service_name: Arc<str> = Arc::from(service_name.into());

        move |arg: A| -> BoxFuture<'static, Result<T, E>> {
            let breaker = manager.get_breaker(&service_name, None);
            let fut = operation(arg);
            Box::pin(async move { breaker.call(|| fut).await })
        }
    }

    /// Stats for every breaker, ordered by service name
    pub fn get_all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> = self
            .breakers
            .iter()
            .map(|entry| entry.value().get_stats())
            .collect();
        stats.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        stats
    }

    pub async fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for breaker in breakers {
            breaker.reset().await;
        }
    }
}
