//! Managed-object-browser form channel (`/invsvc/mob3`).
//!
//! Used only where no typed API exists. Each invocation GETs the method page
//! to obtain a CSRF nonce bound to the browser session cookie, then POSTs the
//! form. Success is detected by scraping the returned HTML.

use crate::api::MobApi;
use crate::error::{from_reqwest, from_status};

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use vsops_core::{VsError, VsResult};

const NONCE_FIELD: &str = "vmware-session-nonce";

pub struct MobClient {
    client: Client,
    base_url: String,
    label: String,
    username: String,
    password: SecretString,
    opened: AtomicBool,
}

impl MobClient {
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
            opened: AtomicBool::new(false),
        }
    }

    fn method_url(&self, moid: &str, method: &str) -> String {
        format!("{}/invsvc/mob3/?moid={moid}&method={method}", self.base_url)
    }
}

#[async_trait]
impl MobApi for MobClient {
    async fn invoke_form(&self, moid: &str, method: &str, form: &[(&str, String)]) -> VsResult<String> {
        let url = self.method_url(moid, method);
        let page = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .send()
            .await
            .map_err(|e| from_reqwest(e, &self.label))?;
        let status = page.status();
        let html = page.text().await.map_err(|e| from_reqwest(e, &self.label))?;
        if !status.is_success() {
            return Err(from_status(status, &html));
        }
        self.opened.store(true, Ordering::SeqCst);
        let nonce = parse_session_nonce(&html).ok_or_else(|| {
            VsError::protocol(format!("{}: MOB page for {method} has no session nonce", self.label))
        })?;

        let mut body: Vec<(&str, String)> = vec![(NONCE_FIELD, nonce)];
        body.extend(form.iter().cloned());
        tracing::debug!(moid, method, "MOB form post");

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
            .form(&body)
            .send()
            .await
            .map_err(|e| from_reqwest(e, &self.label))?;
        let status = resp.status();
        let html = resp.text().await.map_err(|e| from_reqwest(e, &self.label))?;
        if !status.is_success() {
            return Err(from_status(status, &html));
        }
        Ok(html)
    }

    async fn logout(&self) -> VsResult<()> {
        if !self.opened.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let url = format!("{}/invsvc/mob3/logout", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| from_reqwest(e, &self.label))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(from_status(status, &body));
        }
        tracing::debug!(endpoint = %self.label, "MOB session closed");
        Ok(())
    }
}

fn nonce_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"name="vmware-session-nonce"\s+type="hidden"\s+value="?([^\s"]+)"#).ok())
        .as_ref()
}

/// Extract the hidden CSRF nonce from a MOB method page.
pub fn parse_session_nonce(html: &str) -> Option<String> {
    nonce_regex()?
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether a MOB response reports a successful void invocation.
pub fn invocation_succeeded(html: &str) -> bool {
    html.contains("Method Invocation Result: void")
}

/// Extract the MOB's error text, if the page reports a fault.
pub fn invocation_fault(html: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<h1>\s*Method Invocation Result:\s*(.*?)\s*</h1>").ok())
        .as_ref()?
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| s != "void")
}
