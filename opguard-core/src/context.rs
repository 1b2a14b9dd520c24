use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation data attached to a guarded operation and copied into every
/// audit record it produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    /// Free-form fields forwarded as `additional_context`
    #[serde(default)]
    pub additional: Map<String, Value>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self::new().with_tenant(tenant_id)
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Add a custom field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.additional.insert(key.into(), value.into());
        self
    }

    pub fn tenant_or_default(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or("default")
    }
}
