//! Two-level rate limiting: a process-wide bucket shared by all tenants and
//! one bucket per tenant.

use opguard_core::{RateLimitExceeded, RateLimitType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use validator::Validate;

use super::token_bucket::TokenBucket;

/// Refill rate and capacity of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
pub struct BucketConfig {
    /// Tokens per second
    #[validate(range(min = 0.0))]
    pub rate: f64,
    /// Maximum tokens held
    #[validate(range(min = 1.0))]
    pub burst: f64,
}

impl BucketConfig {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self { rate, burst }
    }

    pub fn bucket(&self) -> TokenBucket {
        TokenBucket::new(self.rate, self.burst)
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global: BucketConfig,
    /// Limits for tenants without an override
    pub tenant_default: BucketConfig,
    pub tenant_overrides: HashMap<String, BucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: BucketConfig::new(1000.0, 2000.0),
            tenant_default: BucketConfig::new(100.0, 200.0),
            tenant_overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn with_tenant_override(
        mut self,
        tenant_id: impl Into<String>,
        limits: BucketConfig,
    ) -> Self {
        self.tenant_overrides.insert(tenant_id.into(), limits);
        self
    }

    /// Limits for a tenant. Overrides loaded from config files have
    /// lowercased keys, so a lowercase match is accepted as well.
    pub fn tenant_limits(&self, tenant_id: &str) -> BucketConfig {
        self.tenant_overrides
            .get(tenant_id)
            .or_else(|| self.tenant_overrides.get(&tenant_id.to_lowercase()))
            .copied()
            .unwrap_or(self.tenant_default)
    }
}

/// Snapshot of observed and configured rates for one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSnapshot {
    pub tenant_id: String,
    pub global_rate: f64,
    pub global_limit: f64,
    pub global_available: f64,
    pub tenant_rate: f64,
    pub tenant_limit: f64,
    pub tenant_available: f64,
}

/// Per-tenant limiter. Admission requires a token from the shared global
/// bucket and then one from the tenant's own bucket.
#[derive(Debug)]
pub struct TenantRateLimiter {
    tenant_id: String,
    global: Arc<TokenBucket>,
    tenant: TokenBucket,
}

impl TenantRateLimiter {
    pub fn new(
        tenant_id: impl Into<String>,
        global: Arc<TokenBucket>,
        limits: BucketConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            global,
            tenant: limits.bucket(),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Admit one request or report which bucket refused it.
    ///
    /// The global token is spent before the tenant bucket is checked, so a
    /// request refused at the tenant level still counts against the global
    /// budget.
    pub fn check_rate_limit(&self, request_id: &str) -> Result<(), RateLimitExceeded> {
        if !self.global.consume(1) {
            debug!(
                tenant_id = %self.tenant_id,
                request_id = request_id,
                "Global rate limit exceeded"
            );
            return Err(RateLimitExceeded {
                tenant_id: self.tenant_id.clone(),
                limit_type: RateLimitType::Global,
                current_rate: self.global.observed_rate(),
                limit: self.global.rate(),
            });
        }

        if !self.tenant.consume(1) {
            debug!(
                tenant_id = %self.tenant_id,
                request_id = request_id,
                "Tenant rate limit exceeded"
            );
            return Err(RateLimitExceeded {
                tenant_id: self.tenant_id.clone(),
                limit_type: RateLimitType::Tenant,
                current_rate: self.tenant.observed_rate(),
                limit: self.tenant.rate(),
            });
        }

        Ok(())
    }

    pub fn get_current_rates(&self) -> RateSnapshot {
        RateSnapshot {
            tenant_id: self.tenant_id.clone(),
            global_rate: self.global.observed_rate(),
            global_limit: self.global.rate(),
            global_available: self.global.available_tokens(),
            tenant_rate: self.tenant.observed_rate(),
            tenant_limit: self.tenant.rate(),
            tenant_available: self.tenant.available_tokens(),
        }
    }
}
