//! Diff & apply engine.
//!
//! Every mutating operation runs Observe → Diff → Decide → Apply:
//!
//! 1. the operation reads an observed projection (`Map<String, Value>`)
//! 2. [`diff`] compares it with a [`DesiredSpec`] key by key
//! 3. [`Reconciler::apply`] skips empty change sets, records planned changes
//!    in dry-run, and otherwise runs the apply step
//! 4. [`Reconciler::finish`] turns what happened into the result envelope
//!
//! `changed` is derived from what the reconciler saw, never set by hand.

use crate::props::short_enum;
use crate::task::CancelSignal;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vsops_core::{Diagnostic, OpResult, VsError, VsResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Comparators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How one key is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Plain equality.
    Scalar,
    /// Equality of the canonical short form (case, `_`, `-` ignored).
    Enum,
    /// Unordered collection: equality after sort and dedup.
    Set,
    /// Ordered collection: element equality at each position.
    Ordered,
}

impl Comparator {
    pub fn canonical(&self, v: &Value) -> Value {
        match self {
            Self::Scalar | Self::Ordered => v.clone(),
            Self::Enum => match v {
                Value::String(s) => Value::String(short_enum(s)),
                other => other.clone(),
            },
            Self::Set => Value::Array(canonical_set(v)),
        }
    }

    pub fn equal(&self, observed: &Value, desired: &Value) -> bool {
        match self {
            // An unset list and an empty list are the same set.
            Self::Set | Self::Ordered if observed.is_null() => match desired {
                Value::Array(d) => d.is_empty(),
                Value::Null => true,
                _ => false,
            },
            _ => self.canonical(observed) == self.canonical(desired),
        }
    }
}

fn canonical_set(v: &Value) -> Vec<Value> {
    let mut items: Vec<Value> = match v {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    };
    items.sort_by_key(|a| a.to_string());
    items.dedup();
    items
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Change sets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub key: String,
    pub before: Value,
    pub after: Value,
}

/// Ordered changes; order is the order the apply step requests them.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, before: Value, after: Value) {
        self.changes.push(Change {
            key: key.into(),
            before,
            after,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn get(&self, key: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Desired state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keys the caller has an opinion on. Absent keys never drive a change.
#[derive(Debug, Clone, Default)]
pub struct DesiredSpec {
    entries: Vec<(String, Value, Comparator)>,
}

impl DesiredSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Serialize, cmp: Comparator) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.entries.push((key.into(), value, cmp));
        self
    }

    /// Add the key only when the caller supplied a value.
    pub fn opt<T: Serialize>(self, key: impl Into<String>, value: Option<T>, cmp: Comparator) -> Self {
        match value {
            Some(v) => self.set(key, v, cmp),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, v, _)| v)
    }
}

/// Compare `observed` with `desired`, in desired-key order.
pub fn diff(observed: &Map<String, Value>, desired: &DesiredSpec) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, want, cmp) in &desired.entries {
        let have = observed.get(key).cloned().unwrap_or(Value::Null);
        if !cmp.equal(&have, want) {
            let after = match cmp {
                Comparator::Set => cmp.canonical(want),
                _ => want.clone(),
            };
            changes.push(key.clone(), have, after);
        }
    }
    changes
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Set intents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a list-valued desired state combines with what is there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetIntent {
    /// Union.
    #[default]
    #[serde(alias = "present")]
    Add,
    /// Difference.
    #[serde(alias = "absent")]
    Remove,
    /// Replace.
    Set,
}

impl SetIntent {
    /// The desired list, sorted and deduplicated.
    pub fn resolve(&self, observed: &[String], requested: &[String]) -> Vec<String> {
        let mut out: Vec<String> = match self {
            Self::Add => observed.iter().chain(requested).cloned().collect(),
            Self::Remove => observed
                .iter()
                .filter(|o| !requested.contains(o))
                .cloned()
                .collect(),
            Self::Set => requested.to_vec(),
        };
        out.sort();
        out.dedup();
        out
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Reconciler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What [`Reconciler::apply`] did for one target.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// Nothing to change; no request was issued.
    Unchanged,
    /// Dry-run: the change set was recorded, not applied.
    Planned,
    Applied(T),
    /// The apply step failed; the error is held by the reconciler.
    Failed,
    /// An earlier target failed, so this one was not attempted.
    Skipped,
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Handed to an apply step that issues several server-side requests. Each
/// request that succeeds calls [`Progress::step`], so a later failure still
/// reports the target as changed.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicBool>);

impl Progress {
    pub fn step(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Drives the decide and apply phases across one or more targets.
pub struct Reconciler {
    dry_run: bool,
    planned: Map<String, Value>,
    applied: Map<String, Value>,
    mutated: bool,
    failure: Option<VsError>,
    diagnostics: Vec<Diagnostic>,
    cancel: CancelSignal,
    progress: Progress,
}

impl Reconciler {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            planned: Map::new(),
            applied: Map::new(),
            mutated: false,
            failure: None,
            diagnostics: Vec::new(),
            cancel: CancelSignal::never(),
            progress: Progress::default(),
        }
    }

    /// Refuse to start further apply steps once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Progress handle for the next apply step.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Decide and, when warranted, apply `changes` to `target`.
    pub async fn apply<T, F, Fut>(&mut self, target: &str, changes: ChangeSet, apply: F) -> Outcome<T>
    where
        F: FnOnce(ChangeSet) -> Fut,
        Fut: Future<Output = VsResult<T>>,
    {
        if self.failure.is_some() {
            return Outcome::Skipped;
        }
        if changes.is_empty() {
            return Outcome::Unchanged;
        }
        let report = changes.to_value();
        if self.dry_run {
            tracing::info!(target, changes = changes.len(), "planned (dry run)");
            self.planned.insert(target.to_string(), report);
            return Outcome::Planned;
        }
        if self.cancel.is_cancelled() {
            self.failure = Some(VsError::cancelled(format!(
                "cancelled before applying changes to {target}"
            )));
            return Outcome::Failed;
        }
        self.progress.take();
        let result = apply(changes).await;
        let partial = self.progress.take();
        match result {
            Ok(v) => {
                tracing::info!(target, "applied");
                self.applied.insert(target.to_string(), report);
                self.mutated = true;
                Outcome::Applied(v)
            }
            Err(e) => {
                tracing::warn!(target, error = %e, partial, "apply failed");
                if partial {
                    self.mutated = true;
                    self.applied.insert(target.to_string(), report);
                    self.diagnostics.push(
                        Diagnostic::warn(format!("changes to {target} were only partly applied"))
                            .with("target", target),
                    );
                }
                self.failure = Some(e);
                Outcome::Failed
            }
        }
    }

    /// Fail the operation without an apply step.
    pub fn fail(&mut self, err: VsError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    pub fn diagnose(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    pub fn changed(&self) -> bool {
        self.mutated || !self.planned.is_empty()
    }

    pub fn finish(self) -> OpResult {
        let mut result = OpResult {
            changed: self.changed(),
            ..OpResult::default()
        };
        if !self.planned.is_empty() {
            result.insert("planned_changes", Value::Object(self.planned));
        }
        if !self.applied.is_empty() {
            result.insert("applied_changes", Value::Object(self.applied));
        }
        result.diagnostics = self.diagnostics;
        match self.failure {
            Some(err) => result.fail(&err),
            None => result,
        }
    }
}
