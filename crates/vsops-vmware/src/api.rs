//! Channel traits.
//!
//! The session hands out channels as values; everything above the transport
//! talks to these traits, never to `reqwest` directly.

use crate::types::{MoRef, ObjectContent, RetrieveSpec, ServiceContent};
use crate::xml::SoapValue;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use vsops_core::VsResult;

/// Managed-object (SOAP) channel.
#[async_trait]
pub trait VimApi: Send + Sync {
    /// Cached `ServiceContent` of the endpoint.
    fn service_content(&self) -> &ServiceContent;

    /// One batched property-collector read, continuation pages included.
    async fn retrieve(&self, spec: &RetrieveSpec) -> VsResult<Vec<ObjectContent>>;

    /// Invoke `method` on `this`. Returns the decoded `returnval` (or `null`).
    async fn invoke(&self, this: &MoRef, method: &str, args: Vec<(&str, SoapValue)>) -> VsResult<Value>;

    /// End the server session. Idempotent.
    async fn logout(&self) -> VsResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

/// vAPI JSON channel.
#[async_trait]
pub trait RestApi: Send + Sync {
    /// Send a request under the REST session (logging in on first use).
    /// An empty response body decodes to `null`.
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> VsResult<Value>;

    /// Stream `url` to `dest`, returning the byte count.
    async fn download(&self, url: &str, dest: &Path) -> VsResult<u64>;

    async fn logout(&self) -> VsResult<()>;

    async fn get(&self, path: &str) -> VsResult<Value> {
        self.request(HttpMethod::Get, path, &[], None).await
    }

    async fn post(&self, path: &str, body: Value) -> VsResult<Value> {
        self.request(HttpMethod::Post, path, &[], Some(body)).await
    }

    async fn delete(&self, path: &str) -> VsResult<Value> {
        self.request(HttpMethod::Delete, path, &[], None).await
    }
}

/// Legacy managed-object-browser form channel.
#[async_trait]
pub trait MobApi: Send + Sync {
    /// GET the method page for `moid`/`method`, read its CSRF nonce, POST
    /// `form` with the nonce added. Returns the HTML response body.
    async fn invoke_form(&self, moid: &str, method: &str, form: &[(&str, String)]) -> VsResult<String>;

    /// End the browser session, if one was opened.
    async fn logout(&self) -> VsResult<()>;
}
