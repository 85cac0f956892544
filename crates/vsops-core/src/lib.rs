//! Shared result envelope and error taxonomy.
//!
//! Every operation of the vSphere core reports back through exactly one
//! shape, [`OpResult`], and classifies failures with [`ErrorKind`].
//!
//! ## Modules
//!
//! - **error** — `VsError` / `ErrorKind` taxonomy
//! - **envelope** — `OpResult` and `Diagnostic` records
//! - **redact** — secret scrubbing applied before results leave the core

pub mod envelope;
pub mod error;
pub mod redact;

pub use envelope::{Diagnostic, Level, OpResult};
pub use error::{ErrorKind, VsError, VsResult};
pub use redact::Redactor;
