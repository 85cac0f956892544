//! Secret scrubbing for result envelopes.
//!
//! Secrets never belong in `data` or `diagnostics`. The façade registers
//! every secret it was handed and scrubs the final envelope, so a server
//! message that echoes a password back is masked before it leaves the core.

use crate::envelope::OpResult;
use serde_json::{Map, Value};

pub const MASK: &str = "********";

/// Replaces registered secrets with [`MASK`].
#[derive(Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Empty strings are ignored.
    pub fn add(&mut self, secret: &str) {
        if !secret.is_empty() && !self.secrets.iter().any(|s| s == secret) {
            self.secrets.push(secret.to_string());
            // Longest first, so a secret containing another is masked whole.
            self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn scrub_str(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }

    pub fn scrub_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.scrub_str(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.scrub_value(v)),
            Value::Object(map) => self.scrub_map(map),
            _ => {}
        }
    }

    fn scrub_map(&self, map: &mut Map<String, Value>) {
        let entries = std::mem::take(map);
        for (key, mut value) in entries {
            self.scrub_value(&mut value);
            map.insert(self.scrub_str(&key), value);
        }
    }

    pub fn scrub_result(&self, result: &mut OpResult) {
        if self.secrets.is_empty() {
            return;
        }
        self.scrub_map(&mut result.data);
        for diag in &mut result.diagnostics {
            diag.message = self.scrub_str(&diag.message);
            self.scrub_map(&mut diag.context);
        }
    }
}
