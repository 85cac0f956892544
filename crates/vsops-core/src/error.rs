//! Error taxonomy for the vSphere operations core.
//!
//! Errors are classified once, at the transport edge, and then propagate
//! unchanged as a kind plus a human-readable message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A required connection field is unset
    ConfigMissing,
    /// Server refused credentials or denied permission
    AuthRejected,
    /// TCP / TLS / HTTP error reaching the server or the proxy
    TransportFailure,
    /// Malformed request or response at the SOAP / REST layer
    ProtocolFailure,
    /// Inventory lookup returned no match where one was required
    NotFound,
    /// Inventory lookup returned several matches and no tie-break applied
    Ambiguous,
    /// Current server state forbids the mutation
    Conflict,
    /// Recoverable server-side fault; one in-place retry is permitted
    Transient,
    /// A task was awaited past its deadline
    TimedOut,
    /// The caller aborted before completion
    Cancelled,
    /// Any other server-reported fault
    ServerFault,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMissing => "ConfigMissing",
            Self::AuthRejected => "AuthRejected",
            Self::TransportFailure => "TransportFailure",
            Self::ProtocolFailure => "ProtocolFailure",
            Self::NotFound => "NotFound",
            Self::Ambiguous => "Ambiguous",
            Self::Conflict => "Conflict",
            Self::Transient => "Transient",
            Self::TimedOut => "TimedOut",
            Self::Cancelled => "Cancelled",
            Self::ServerFault => "ServerFault",
        }
    }

    /// Whether one in-place retry is allowed for this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crate error type carrying a kind, a message and optional structured details.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct VsError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl VsError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn config_missing(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigMissing, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRejected, msg)
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportFailure, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolFailure, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    /// Ambiguous lookup; `matches` lists every candidate (usually inventory paths).
    pub fn ambiguous(msg: impl Into<String>, matches: Vec<String>) -> Self {
        Self::new(ErrorKind::Ambiguous, msg)
            .with_details(serde_json::json!({ "matches": matches }))
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, msg)
    }

    pub fn timed_out(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, msg)
    }

    pub fn server_fault(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerFault, msg)
    }

    /// Server fault type name recorded in `details.fault`, if any.
    pub fn fault_code(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("fault"))
            .and_then(Value::as_str)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<serde_json::Error> for VsError {
    fn from(e: serde_json::Error) -> Self {
        Self::protocol(format!("JSON error: {e}"))
    }
}

impl From<VsError> for String {
    fn from(e: VsError) -> String {
        e.to_string()
    }
}

/// Convenience alias.
pub type VsResult<T> = Result<T, VsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = VsError::not_found("host 'esx9' not found");
        assert_eq!(err.to_string(), "[NotFound] host 'esx9' not found");
    }

    #[test]
    fn ambiguous_carries_matches() {
        let err = VsError::ambiguous(
            "2 VirtualMachine objects named 'web'",
            vec!["/DC1/vm/a/web".into(), "/DC1/vm/b/web".into()],
        );
        assert_eq!(err.kind, ErrorKind::Ambiguous);
        let matches = err.details.as_ref().unwrap()["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn fault_code_reads_details() {
        let err = VsError::transient("gone")
            .with_details(serde_json::json!({ "fault": "ManagedObjectNotFound" }));
        assert_eq!(err.fault_code(), Some("ManagedObjectNotFound"));
        assert!(err.is_retryable());
        assert!(!VsError::conflict("busy").is_retryable());
    }

    #[test]
    fn kind_serializes_pascal_case() {
        let s = serde_json::to_string(&ErrorKind::TimedOut).unwrap();
        assert_eq!(s, "\"TimedOut\"");
    }

    #[test]
    fn json_error_is_protocol_failure() {
        let err: VsError = serde_json::from_str::<Value>("{nope").unwrap_err().into();
        assert_eq!(err.kind, ErrorKind::ProtocolFailure);
    }
}
