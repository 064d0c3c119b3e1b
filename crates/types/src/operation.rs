use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque transaction reference returned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl TxRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a remote write did not commit.
///
/// Timeouts are kept distinct from rejections so callers can tell them
/// apart, but the lifecycle controller compensates for both identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    Rejected(String),
    Timeout,
    Unavailable(String),
}

impl FailureReason {
    /// Transient failures may succeed if the whole operation is re-invoked.
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::Unavailable(_))
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected(detail) => write!(f, "rejected: {detail}"),
            FailureReason::Timeout => f.write_str("timed out"),
            FailureReason::Unavailable(detail) => write!(f, "unavailable: {detail}"),
        }
    }
}

/// Outcome of a single remote write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<TxRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl OperationResult {
    pub fn committed(reference: TxRef) -> Self {
        Self {
            committed: true,
            reference: Some(reference),
            failure_reason: None,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            committed: false,
            reference: None,
            failure_reason: Some(reason),
        }
    }

    /// Failure that still carries a reference, e.g. a submitted transaction
    /// whose confirmation timed out.
    pub fn failed_with_reference(reason: FailureReason, reference: TxRef) -> Self {
        Self {
            committed: false,
            reference: Some(reference),
            failure_reason: Some(reason),
        }
    }

    /// Collapse into the committed reference or the failure reason.
    ///
    /// A result claiming to be committed without a reference is treated as
    /// committed with an empty reference; one that is neither committed nor
    /// explains why is treated as rejected.
    pub fn into_result(self) -> Result<TxRef, FailureReason> {
        if self.committed {
            return Ok(self.reference.unwrap_or_else(|| TxRef::new("")));
        }
        Err(self
            .failure_reason
            .unwrap_or_else(|| FailureReason::Rejected("no failure reason reported".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_result_yields_reference() {
        let result = OperationResult::committed(TxRef::new("0xabc"));
        assert_eq!(result.into_result().unwrap().as_str(), "0xabc");
    }

    #[test]
    fn failed_result_without_reason_is_rejection() {
        let result = OperationResult {
            committed: false,
            reference: None,
            failure_reason: None,
        };
        let reason = result.into_result().unwrap_err();
        assert!(matches!(reason, FailureReason::Rejected(_)));
        assert!(!reason.is_transient());
    }

    #[test]
    fn timeout_is_transient_and_distinguishable() {
        let result = OperationResult::failed_with_reference(FailureReason::Timeout, TxRef::new("0x1"));
        assert_eq!(result.reference.as_ref().unwrap().as_str(), "0x1");
        let reason = result.into_result().unwrap_err();
        assert_eq!(reason, FailureReason::Timeout);
        assert!(reason.is_transient());
    }

    #[test]
    fn failure_reason_wire_format() {
        let json = serde_json::to_value(FailureReason::Rejected("taken".into())).unwrap();
        assert_eq!(json["kind"], "rejected");
        assert_eq!(json["detail"], "taken");
        let timeout: FailureReason = serde_json::from_str(r#"{"kind":"timeout"}"#).unwrap();
        assert_eq!(timeout, FailureReason::Timeout);
    }
}
