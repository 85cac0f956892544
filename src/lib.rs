//! # vsphere-ops
//!
//! Command-line front end for the vSphere operations core. One process runs
//! one invocation: it reads the operation name, the flat parameter map and
//! the dry-run flag, runs it through [`VsphereService`] and prints the result
//! envelope as JSON.
//!
//! ## Modules
//!
//! - **vsops_core** — Result envelope, diagnostics, error taxonomy, redaction
//! - **vsops_vmware** — Transport, session, inventory, tasks, diff engine, operations

use std::io::Read;
use std::path::Path;

use serde_json::{Map, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use vsops_core::{ErrorKind, OpResult, VsError, VsResult};
pub use vsops_vmware::{cancel_pair, Invocation, VsphereService, OPERATIONS};

/// Environment variable holding the log filter directive.
pub const LOG_ENV: &str = "VSOPS_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber. Logs always go to stderr so stdout carries
/// nothing but the result envelope.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("logging already initialised: {e}");
    }
}

// ── Invocation input ────────────────────────────────────────────────

/// Parse one `key=value` argument. The value is taken as JSON when it parses,
/// otherwise as a plain string.
pub fn parse_param(arg: &str) -> VsResult<(String, Value)> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| VsError::config_missing(format!("parameter '{arg}' is not of the form key=value")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(VsError::config_missing(format!("parameter '{arg}' has an empty key")));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// Build an invocation from an operation name and `key=value` arguments.
pub fn invocation_from_args(operation: &str, args: &[String], check_mode: bool) -> VsResult<Invocation> {
    let mut params = Map::new();
    for arg in args {
        let (key, value) = parse_param(arg)?;
        params.insert(key, value);
    }
    Ok(Invocation::new(operation, params, check_mode))
}

/// Decode an invocation document. `check_mode` is OR-ed into whatever the
/// document says.
pub fn invocation_from_json(text: &str, check_mode: bool) -> VsResult<Invocation> {
    let mut invocation: Invocation = serde_json::from_str(text)
        .map_err(|e| VsError::protocol(format!("invalid invocation document: {e}")))?;
    invocation.check_mode |= check_mode;
    Ok(invocation)
}

/// Read an invocation document from a file, or from stdin when the path is `-`.
pub fn read_invocation(path: &Path, check_mode: bool) -> VsResult<Invocation> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| VsError::config_missing(format!("could not read invocation from stdin: {e}")))?;
        buf
    } else {
        std::fs::read_to_string(path).map_err(|e| {
            VsError::config_missing(format!("could not read invocation file {}: {e}", path.display()))
        })?
    };
    invocation_from_json(&text, check_mode)
}

/// Process exit status for a finished invocation.
pub fn exit_code(result: &OpResult) -> i32 {
    if result.failed {
        1
    } else {
        0
    }
}
