//! Edge classification: maps transport, XML and server faults onto the
//! shared error taxonomy.

use reqwest::StatusCode;
use serde_json::{json, Value};
use vsops_core::{ErrorKind, VsError};

/// Classify a `reqwest` failure.
///
/// `label` is the endpoint label (`host:port [proxy: h:p]`); it is the only
/// endpoint detail that appears in messages.
pub fn from_reqwest(e: reqwest::Error, label: &str) -> VsError {
    // Strip the URL: it can carry query strings with identifiers.
    let e = e.without_url();
    if e.is_timeout() {
        VsError::transport(format!("{label}: HTTP timeout: {e}"))
            .with_details(json!({ "timeout": true }))
    } else if e.is_connect() {
        VsError::transport(format!("{label}: connection failed: {e}"))
    } else if e.is_decode() || e.is_body() {
        VsError::protocol(format!("{label}: malformed response: {e}"))
    } else {
        VsError::transport(format!("{label}: HTTP error: {e}"))
    }
}

/// Whether a classified error came from an HTTP timeout.
pub fn is_timeout(err: &VsError) -> bool {
    err.details
        .as_ref()
        .and_then(|d| d.get("timeout"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn from_xml(e: impl std::fmt::Display) -> VsError {
    VsError::protocol(format!("XML error: {e}"))
}

/// Kind for a SOAP fault type name (`InvalidLogin`, `ResourceInUse` ...).
pub fn fault_kind(fault: &str) -> ErrorKind {
    match fault {
        "InvalidLogin" | "NoPermission" | "NotAuthenticated" | "InvalidLocale" => {
            ErrorKind::AuthRejected
        }
        "ManagedObjectNotFound" => ErrorKind::Transient,
        "InvalidState" | "ResourceInUse" | "FileLocked" | "DuplicateName" | "InvalidPowerState"
        | "AlreadyExists" | "ConcurrentAccess" | "HostConfigFault" | "InvalidName" => {
            ErrorKind::Conflict
        }
        "RequestCanceled" => ErrorKind::Cancelled,
        "InvalidRequest" | "InvalidType" | "MethodNotFound" | "InvalidArgument" => {
            ErrorKind::ProtocolFailure
        }
        _ => ErrorKind::ServerFault,
    }
}

/// Classify a server fault into an error carrying `details.fault`.
pub fn from_fault(fault: &str, message: &str, details: Option<Value>) -> VsError {
    let kind = fault_kind(fault);
    let message = if message.is_empty() {
        fault.to_string()
    } else {
        message.to_string()
    };
    let mut body = json!({ "fault": fault });
    if let Some(d) = details.filter(|d| !d.is_null()) {
        body["server"] = d;
    }
    VsError::new(kind, message).with_details(body)
}

/// Classify a non-success REST status.
pub fn from_status(status: StatusCode, body: &str) -> VsError {
    let code = status.as_u16();
    let text = rest_message(body);
    let msg = format!("HTTP {code}: {text}");
    let err = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VsError::auth(msg),
        StatusCode::NOT_FOUND => VsError::not_found(msg),
        StatusCode::CONFLICT => VsError::conflict(msg),
        StatusCode::BAD_REQUEST => VsError::protocol(msg),
        StatusCode::SERVICE_UNAVAILABLE => VsError::transient(msg),
        s if s.is_server_error() => VsError::server_fault(msg),
        _ => VsError::protocol(msg),
    };
    err.with_details(json!({ "status": code }))
}

/// Pull the human message out of a vAPI error body, falling back to a
/// truncated raw body.
fn rest_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let from_json = parsed.as_ref().and_then(|v| {
        let v = v.get("value").unwrap_or(v);
        let messages = v.get("messages")?.as_array()?;
        let first = messages.first()?;
        first
            .get("default_message")
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    from_json.unwrap_or_else(|| body.chars().take(500).collect())
}
