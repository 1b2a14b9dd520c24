use anyhow::Result;
use config::{builder::DefaultState, Config as ConfigLoader, ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::backpressure::{QueueConfig, RateLimitConfig};
use crate::circuit_breaker::CircuitBreakersConfig;
use crate::observability::logging::LogConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;

/// Environment variable prefix, e.g. `OPGUARD__TIMEOUTS__DEFAULT_SECS=10`
pub const ENV_PREFIX: &str = "OPGUARD";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration in {section}: {source}")]
    Invalid {
        section: String,
        #[source]
        source: ValidationErrors,
    },

    #[error("Invalid configuration in {section}: {source}")]
    Constraint {
        section: String,
        #[source]
        source: ValidationError,
    },
}

/// Settings for every reliability layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub rate_limits: RateLimitConfig,
    pub queues: QueueConfig,
    pub circuit_breakers: CircuitBreakersConfig,
    pub logging: LogConfig,
}

impl ReliabilityConfig {
    /// Load from `config/opguard` and `config/local` (both optional, any
    /// format the `config` crate understands), then `OPGUARD__*` environment
    /// variables. Missing settings keep their defaults.
    pub fn load() -> Result<Self> {
        let builder = ConfigLoader::builder()
            .add_source(File::with_name("config/opguard").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(environment());

        Self::build(builder)
    }

    /// Load from one file, then `OPGUARD__*` environment variables
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let builder = ConfigLoader::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(environment());

        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and cross-field constraints of every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        invalid("timeouts", self.timeouts.validate())?;
        for (category, secs) in &self.timeouts.categories {
            if !secs.is_finite() || *secs <= 0.0 {
                let mut err = ValidationError::new("timeout_not_positive");
                err.add_param("category".into(), &category.as_str());
                err.add_param("value".into(), secs);
                return Err(ConfigError::Constraint {
                    section: "timeouts.categories".to_string(),
                    source: err,
                });
            }
        }

        let default_policy = ("retry.default_policy".to_string(), &self.retry.default_policy);
        let category_policies = self
            .retry
            .categories
            .iter()
            .map(|(category, policy)| (format!("retry.categories.{}", category), policy));
        for (section, policy) in std::iter::once(default_policy).chain(category_policies) {
            invalid(&section, policy.validate())?;
            policy
                .validate_delays()
                .map_err(|source| ConfigError::Constraint {
                    section: section.clone(),
                    source,
                })?;
        }

        invalid("rate_limits.global", self.rate_limits.global.validate())?;
        invalid("rate_limits.tenant_default", self.rate_limits.tenant_default.validate())?;
        for (tenant, limits) in &self.rate_limits.tenant_overrides {
            invalid(&format!("rate_limits.tenant_overrides.{}", tenant), limits.validate())?;
        }

        invalid("queues.default", self.queues.default.validate())?;
        for (name, settings) in &self.queues.queues {
            invalid(&format!("queues.queues.{}", name), settings.validate())?;
        }

        invalid("circuit_breakers.default", self.circuit_breakers.default.validate())?;
        for (service, breaker) in &self.circuit_breakers.services {
            invalid(&format!("circuit_breakers.services.{}", service), breaker.validate())?;
        }

        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn invalid(section: &str, result: Result<(), ValidationErrors>) -> Result<(), ConfigError> {
    result.map_err(|source| ConfigError::Invalid {
        section: section.to_string(),
        source,
    })
}
