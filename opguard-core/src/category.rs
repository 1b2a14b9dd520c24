use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Classification tag selecting timeout/retry policy and audit code.
///
/// Parsing never fails: strings that do not name a built-in category become
/// [`OperationCategory::Other`], which resolves to the default policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationCategory {
    NatsConnect,
    NatsPublish,
    NatsSubscribe,
    NatsRequest,
    KvGet,
    KvPut,
    KvDelete,
    KvWatch,
    ExecutionIntent,
    ApprovalCheck,
    Other(String),
}

impl OperationCategory {
    /// All built-in categories, in declaration order.
    pub const BUILTIN: [OperationCategory; 10] = [
        OperationCategory::NatsConnect,
        OperationCategory::NatsPublish,
        OperationCategory::NatsSubscribe,
        OperationCategory::NatsRequest,
        OperationCategory::KvGet,
        OperationCategory::KvPut,
        OperationCategory::KvDelete,
        OperationCategory::KvWatch,
        OperationCategory::ExecutionIntent,
        OperationCategory::ApprovalCheck,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            OperationCategory::NatsConnect => "NATS_CONNECT",
            OperationCategory::NatsPublish => "NATS_PUBLISH",
            OperationCategory::NatsSubscribe => "NATS_SUBSCRIBE",
            OperationCategory::NatsRequest => "NATS_REQUEST",
            OperationCategory::KvGet => "KV_GET",
            OperationCategory::KvPut => "KV_PUT",
            OperationCategory::KvDelete => "KV_DELETE",
            OperationCategory::KvWatch => "KV_WATCH",
            OperationCategory::ExecutionIntent => "EXECUTION_INTENT",
            OperationCategory::ApprovalCheck => "APPROVAL_CHECK",
            OperationCategory::Other(name) => name.as_str(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, OperationCategory::Other(_))
    }

    /// Deterministic audit code for an event raised under this category,
    /// e.g. `TIMEOUT.KV_GET`.
    pub fn audit_code(&self, event: &str) -> String {
        format!(
            "{}.{}",
            event.to_ascii_uppercase(),
            self.as_str().to_ascii_uppercase()
        )
    }
}

impl fmt::Display for OperationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationCategory {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['.', '-'], "_");
        let category = OperationCategory::BUILTIN
            .iter()
            .find(|c| c.as_str() == normalized)
            .cloned()
            .unwrap_or_else(|| OperationCategory::Other(s.trim().to_string()));
        Ok(category)
    }
}

impl From<String> for OperationCategory {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(category) => category,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for OperationCategory {
    fn from(value: &str) -> Self {
        OperationCategory::from(value.to_string())
    }
}

impl From<OperationCategory> for String {
    fn from(value: OperationCategory) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_builtin_categories() {
        for category in OperationCategory::BUILTIN.iter() {
            let parsed: OperationCategory = category.as_str().parse().unwrap();
            assert_eq!(&parsed, category);
        }
    }

    #[test]
    fn test_parse_is_case_and_separator_insensitive() {
        assert_eq!(OperationCategory::from("kv.get"), OperationCategory::KvGet);
        assert_eq!(
            OperationCategory::from("nats-connect"),
            OperationCategory::NatsConnect
        );
    }

    #[test]
    fn test_unknown_category_becomes_other() {
        let category = OperationCategory::from("LEDGER_SYNC");
        assert_eq!(
            category,
            OperationCategory::Other("LEDGER_SYNC".to_string())
        );
        assert!(!category.is_builtin());
    }

    #[test]
    fn test_audit_code() {
        assert_eq!(
            OperationCategory::KvGet.audit_code("timeout"),
            "TIMEOUT.KV_GET"
        );
        assert_eq!(
            OperationCategory::Other("ledger_sync".into()).audit_code("retry"),
            "RETRY.LEDGER_SYNC"
        );
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&OperationCategory::ApprovalCheck).unwrap();
        assert_eq!(json, "\"APPROVAL_CHECK\"");

        let parsed: OperationCategory = serde_json::from_str("\"custom_op\"").unwrap();
        assert_eq!(parsed, OperationCategory::Other("custom_op".to_string()));
    }
}
