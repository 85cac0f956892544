//! The normalized result envelope.
//!
//! `{changed, failed, data, diagnostics}` is the only shape the core returns.
//! `data` is a `serde_json::Map`, which keeps keys sorted, so serialized
//! output is deterministic.

use crate::error::{ErrorKind, VsError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Diagnostics ────────────────────────────────────────────────────────────

/// Severity of a [`Diagnostic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// A single diagnostic record attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: Level,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Diagnostic {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            context: Map::new(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Level::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(Level::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }

    /// Attach a context entry.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Error-level diagnostic describing a classified error.
    pub fn from_error(err: &VsError) -> Self {
        let mut diag = Self::error(err.message.clone()).with("kind", err.kind.as_str());
        if let Some(details) = &err.details {
            diag = diag.with("details", details.clone());
        }
        diag
    }

    /// Error kind recorded in the context, if this diagnostic carries one.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.context
            .get("kind")
            .and_then(|k| serde_json::from_value(k.clone()).ok())
    }
}

// ─── Result envelope ────────────────────────────────────────────────────────

/// Outcome of one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    pub changed: bool,
    pub failed: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl OpResult {
    /// Successful result that did not alter server state.
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Successful result that altered (or, in dry-run, would alter) server state.
    pub fn changed() -> Self {
        Self {
            changed: true,
            ..Self::default()
        }
    }

    /// Failed result with a single error diagnostic and `changed = false`.
    pub fn from_error(err: &VsError) -> Self {
        Self::unchanged().fail(err)
    }

    /// Mark this result failed, keeping `changed` as-is so partial mutations
    /// stay visible.
    pub fn fail(mut self, err: &VsError) -> Self {
        self.failed = true;
        self.diagnostics.push(Diagnostic::from_error(err));
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn with_diagnostic(mut self, diag: Diagnostic) -> Self {
        self.diagnostics.push(diag);
        self
    }

    pub fn push(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    /// Kind of the first error diagnostic.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.diagnostics
            .iter()
            .filter(|d| d.level == Level::Error)
            .find_map(Diagnostic::kind)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_has_exactly_four_keys() {
        let value = OpResult::unchanged().to_value();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, ["changed", "data", "diagnostics", "failed"]);
    }

    #[test]
    fn data_keys_are_sorted() {
        let result = OpResult::unchanged()
            .with_data("zeta", 1)
            .with_data("alpha", 2)
            .with_data("mid", json!({"b": 1, "a": 2}));
        let text = serde_json::to_string(&result.data).unwrap();
        assert_eq!(text, r#"{"alpha":2,"mid":{"a":2,"b":1},"zeta":1}"#);
    }

    #[test]
    fn fail_preserves_partial_change() {
        let err = VsError::server_fault("second step failed");
        let result = OpResult::changed().fail(&err);
        assert!(result.changed);
        assert!(result.failed);
        assert_eq!(result.error_kind(), Some(ErrorKind::ServerFault));
    }

    #[test]
    fn from_error_records_kind_and_details() {
        let err = VsError::ambiguous("two matches", vec!["/a".into(), "/b".into()]);
        let result = OpResult::from_error(&err);
        assert!(!result.changed);
        let diag = &result.diagnostics[0];
        assert_eq!(diag.level, Level::Error);
        assert_eq!(diag.context["kind"], "Ambiguous");
        assert_eq!(diag.context["details"]["matches"][1], "/b");
    }

    #[test]
    fn diagnostic_level_serializes_lowercase() {
        let diag = Diagnostic::warn("careful").with("host", "esx1");
        let value = serde_json::to_value(&diag).unwrap();
        assert_eq!(value, json!({"level": "warn", "message": "careful", "context": {"host": "esx1"}}));
    }
}
