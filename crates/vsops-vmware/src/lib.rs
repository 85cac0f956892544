//! # vSphere operations core
//!
//! Declarative, idempotent operations against vCenter / ESXi over the
//! managed-object SOAP API, the vAPI REST API and, where nothing else
//! exists, the managed object browser.
//!
//! ## Modules
//!
//! - **types** — Managed-object references, inventory kinds and paths, `ServiceContent`
//! - **xml** — SOAP request encoding and response decoding
//! - **error** — vim25 fault and HTTP status classification
//! - **config** — Connection options with environment fallbacks
//! - **api** — Channel traits (`VimApi`, `RestApi`, `MobApi`)
//! - **soap** — vim25 / vSAN / SMS SOAP client
//! - **rest** — vAPI REST client with session-based auth
//! - **mob** — Managed object browser form client
//! - **session** — One login across every channel, closed exactly once
//! - **props** — Helpers for reading decoded property values
//! - **inventory** — Name, path and id lookups plus batched property reads
//! - **task** — Task polling with backoff, deadlines and cancellation
//! - **diff** — Desired-vs-observed change sets and the reconciler
//! - **units** — Capacity strings and DRS migration-rate conversion
//! - **ops** — The operation catalogue
//! - **service** — Invocation entry point: connect, run, close, redact

pub mod types;
pub mod xml;
pub mod error;
pub mod config;
pub mod api;
pub mod soap;
pub mod rest;
pub mod mob;
pub mod session;
pub mod props;
pub mod inventory;
pub mod task;
pub mod diff;
pub mod units;
pub mod ops;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ConnectionConfig;
pub use ops::{execute, OpContext, OPERATIONS};
pub use service::{Invocation, VsphereService};
pub use task::{cancel_pair, CancelHandle, CancelSignal};
