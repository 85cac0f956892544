//! Invocation entry point.
//!
//! `VsphereService` turns one [`Invocation`] into one [`OpResult`]: it
//! builds the connection config, opens a fresh session, runs the operation
//! under the caller's cancel signal, closes the session whatever happened
//! and scrubs every registered secret out of the envelope.

use crate::config::ConnectionConfig;
use crate::ops::{execute, OpContext};
use crate::session::Session;
use crate::task::CancelSignal;

use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use vsops_core::{Diagnostic, OpResult, Redactor, VsError};

/// How long an operation may keep running after cancellation before it is
/// abandoned.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// One request: operation name, flat parameter map, dry-run flag.
#[derive(Debug, Clone, Deserialize)]
pub struct Invocation {
    pub operation: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, alias = "dry_run")]
    pub check_mode: bool,
}

impl Invocation {
    pub fn new(operation: impl Into<String>, params: Map<String, Value>, check_mode: bool) -> Self {
        Self {
            operation: operation.into(),
            params,
            check_mode,
        }
    }
}

/// Keys whose string values are treated as secrets.
fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.ends_with("password") || key.contains("secret") || key.ends_with("token")
}

/// A redactor holding every secret-looking parameter value.
pub fn redactor_for(params: &Map<String, Value>) -> Redactor {
    let mut redactor = Redactor::new();
    for (key, value) in params {
        if let (true, Some(secret)) = (is_secret_key(key), value.as_str()) {
            redactor.add(secret);
        }
    }
    redactor
}

pub struct VsphereService {
    cancel: CancelSignal,
    grace: Duration,
}

impl VsphereService {
    pub fn new(cancel: CancelSignal) -> Self {
        Self {
            cancel,
            grace: CANCEL_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Connect, run, close. Never fails: errors land in the envelope.
    pub async fn run(&self, invocation: &Invocation) -> OpResult {
        let span = tracing::info_span!(
            "invocation",
            operation = %invocation.operation,
            check_mode = invocation.check_mode,
            host = tracing::field::Empty
        );
        async {
            let config = match ConnectionConfig::from_params(&invocation.params) {
                Ok(c) => c,
                Err(e) => return scrubbed(invocation, OpResult::from_error(&e)),
            };
            tracing::Span::current().record("host", config.hostname.as_str());
            tracing::debug!(?config, "connecting");
            match Session::open(&config).await {
                Ok(session) => self.run_on(Arc::new(session), invocation, config.task_timeout).await,
                Err(e) => {
                    tracing::warn!(error = %e, "could not open session");
                    scrubbed(invocation, OpResult::from_error(&e))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run on an open session and close it afterwards.
    pub async fn run_on(&self, session: Arc<Session>, invocation: &Invocation, task_deadline: Duration) -> OpResult {
        let ctx = OpContext::new(session.clone(), self.cancel.clone(), invocation.check_mode, task_deadline);
        let abandon = async {
            self.cancel.cancelled().await;
            tracing::warn!(grace = ?self.grace, "cancellation requested");
            tokio::time::sleep(self.grace).await;
        };
        let mut result = tokio::select! {
            result = execute(&invocation.operation, &invocation.params, &ctx) => result,
            _ = abandon => {
                tracing::warn!("operation abandoned after cancellation grace period");
                OpResult::from_error(&VsError::cancelled("invocation cancelled"))
            }
        };
        drop(ctx);

        if let Err(e) = session.close().await {
            result.push(Diagnostic::warn(format!("session logout failed: {e}")).with("kind", e.kind.as_str()));
        }
        tracing::info!(changed = result.changed, failed = result.failed, "invocation finished");
        scrubbed(invocation, result)
    }
}

fn scrubbed(invocation: &Invocation, mut result: OpResult) -> OpResult {
    redactor_for(&invocation.params).scrub_result(&mut result);
    result
}
