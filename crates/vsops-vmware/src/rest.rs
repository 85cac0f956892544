//! vSphere Automation (vAPI) REST client with session-based authentication.
//!
//! Communicates with vCenter via `https://{host}/api/...`. The session is
//! created lazily on first use (POST /api/session, or the legacy
//! /rest/com/vmware/cis/session on older servers) and deleted on logout
//! through the same path it was created on.

use crate::api::{HttpMethod, RestApi};
use crate::error::{from_reqwest, from_status};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use url::Url;
use vsops_core::{VsError, VsResult};

const SESSION_HEADER: &str = "vmware-api-session-id";

/// Which session endpoint the server answered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPath {
    Api,
    Legacy,
}

impl SessionPath {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "/api/session",
            Self::Legacy => "/rest/com/vmware/cis/session",
        }
    }
}

/// vAPI REST client.
pub struct RestClient {
    client: Client,
    base_url: String,
    label: String,
    username: String,
    password: SecretString,
    session_id: Mutex<Option<(String, SessionPath)>>,
}

impl RestClient {
    /// Build a client (does NOT create a session yet).
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        label: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            label: label.into(),
            username: username.into(),
            password,
            session_id: Mutex::new(None),
        }
    }

    // ── Session management ──────────────────────────────────────────

    /// Current session id, logging in first if needed.
    async fn session(&self) -> VsResult<String> {
        let mut guard = self.session_id.lock().await;
        if let Some((sid, _)) = guard.as_ref() {
            return Ok(sid.clone());
        }
        let (sid, path) = self.login().await?;
        *guard = Some((sid.clone(), path));
        Ok(sid)
    }

    async fn login(&self) -> VsResult<(String, SessionPath)> {
        let url = format!("{}{}", self.base_url, SessionPath::Api.as_str());
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|e| from_reqwest(e, &self.label))?;

        // Servers before 7.0 U2 only serve the legacy session path.
        let (resp, path) = if resp.status() == StatusCode::NOT_FOUND {
            let legacy = format!("{}{}", self.base_url, SessionPath::Legacy.as_str());
            let resp = self
                .client
                .post(&legacy)
                .basic_auth(&self.username, Some(self.password.expose_secret()))
                .send()
                .await
                .map_err(|e| from_reqwest(e, &self.label))?;
            (resp, SessionPath::Legacy)
        } else {
            (resp, SessionPath::Api)
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = from_status(status, &body);
            return Err(VsError {
                message: format!("{}: REST login failed: {}", self.label, err.message),
                ..err
            });
        }

        // `/api/session` answers with a quoted JSON string, the legacy path
        // with `{"value": "..."}`.
        let body: Value = resp
            .json()
            .await
            .map_err(|e| VsError::protocol(format!("{}: bad session response: {e}", self.label)))?;
        let sid = body
            .as_str()
            .or_else(|| body.get("value").and_then(Value::as_str))
            .ok_or_else(|| VsError::protocol(format!("{}: session id missing", self.label)))?;
        tracing::debug!(endpoint = %self.label, path = path.as_str(), "REST session established");
        Ok((sid.to_string(), path))
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn build(&self, method: HttpMethod, url: &str) -> RequestBuilder {
        match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Patch => self.client.patch(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Delete => self.client.delete(url),
        }
    }

    async fn check_status(resp: Response) -> VsResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(from_status(status, &body))
    }

    async fn parse_response(&self, resp: Response) -> VsResult<Value> {
        let text = resp
            .text()
            .await
            .map_err(|e| from_reqwest(e, &self.label))?;
        if text.trim().is_empty() {
            // Some vAPI endpoints return an empty body on success
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            VsError::protocol(format!(
                "JSON parse error: {e}; body: {}",
                text.chars().take(500).collect::<String>()
            ))
        })
    }
}

/// Resolve a download URI the server handed out; relative ones are taken
/// against the endpoint.
fn resolve(base_url: &str, uri: &str) -> VsResult<Url> {
    Url::parse(base_url)
        .and_then(|base| base.join(uri))
        .map_err(|e| VsError::protocol(format!("invalid download uri '{uri}': {e}")))
}

#[async_trait]
impl RestApi for RestClient {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> VsResult<Value> {
        let sid = self.session().await?;
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(?method, path, "REST call");

        let mut req = self.build(method, &url).header(SESSION_HEADER, sid);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(b) = body {
            req = req.json(&b);
        }
        let resp = req.send().await.map_err(|e| from_reqwest(e, &self.label))?;
        let resp = Self::check_status(resp).await?;
        self.parse_response(resp).await
    }

    async fn download(&self, url: &str, dest: &Path) -> VsResult<u64> {
        let target = resolve(&self.base_url, url)?;
        let sid = self.session().await?;
        let resp = self
            .client
            .get(target)
            .header(SESSION_HEADER, sid)
            .send()
            .await
            .map_err(|e| from_reqwest(e, &self.label))?;
        let resp = Self::check_status(resp).await?;

        let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
            VsError::transport(format!("cannot create {}: {e}", dest.display()))
        })?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| from_reqwest(e, &self.label))?;
            file.write_all(&chunk).await.map_err(|e| {
                VsError::transport(format!("write to {} failed: {e}", dest.display()))
            })?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| VsError::transport(format!("flush {} failed: {e}", dest.display())))?;
        Ok(written)
    }

    /// Delete the current session on the path that created it.
    async fn logout(&self) -> VsResult<()> {
        let session = self.session_id.lock().await.take();
        if let Some((sid, path)) = session {
            let url = format!("{}{}", self.base_url, path.as_str());
            let resp = self
                .client
                .delete(&url)
                .header(SESSION_HEADER, sid.as_str())
                .send()
                .await
                .map_err(|e| from_reqwest(e, &self.label))?;
            Self::check_status(resp).await?;
        }
        Ok(())
    }
}
