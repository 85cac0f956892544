//! SOAP managed-object channel over HTTPS.
//!
//! One [`SoapClient`] logs in against `/sdk`. Sibling clients for the vSAN
//! health (`/vsanHealth`) and storage-monitoring (`/sms/sdk`) endpoints share
//! its HTTP client and therefore its session cookie; they never log in or
//! out on their own.

use crate::api::VimApi;
use crate::error::{from_reqwest, from_status, is_timeout};
use crate::props::{as_list, str_at};
use crate::types::{MissingProperty, MoRef, ObjectContent, RetrieveSpec, RetrieveTarget, ServiceContent};
use crate::xml::{decode_response, request_envelope, SoapObject, SoapValue};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vsops_core::{VsError, VsResult};

/// SOAPAction used before the server's API version is known.
const BOOTSTRAP_VERSION: &str = "6.7";

/// The SOAP endpoints a vCenter exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapEndpoint {
    Vim,
    Vsan,
    Sms,
}

impl SoapEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Vim => "/sdk",
            Self::Vsan => "/vsanHealth",
            Self::Sms => "/sms/sdk",
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Vim | Self::Vsan => "urn:vim25",
            Self::Sms => "urn:sms",
        }
    }

    fn action(&self, api_version: &str) -> String {
        match self {
            Self::Vim | Self::Vsan => format!("urn:vim25/{api_version}"),
            Self::Sms => "urn:sms/version14".to_string(),
        }
    }
}

/// vim25 SOAP client bound to one endpoint.
pub struct SoapClient {
    http: Client,
    url: String,
    label: String,
    endpoint: SoapEndpoint,
    action: String,
    content: ServiceContent,
    /// Only the `/sdk` client owns the login.
    owns_session: bool,
    logged_out: Arc<AtomicBool>,
}

impl SoapClient {
    /// Fetch `ServiceContent` and log in on `/sdk`.
    pub async fn login(
        http: Client,
        base_url: &str,
        label: &str,
        username: &str,
        password: &SecretString,
    ) -> VsResult<Self> {
        let url = format!("{base_url}{}", SoapEndpoint::Vim.path());
        let instance = MoRef::new("ServiceInstance", "ServiceInstance");
        let bootstrap = SoapEndpoint::Vim.action(BOOTSTRAP_VERSION);

        let raw = post_envelope(
            &http,
            &url,
            &bootstrap,
            label,
            request_envelope("urn:vim25", "RetrieveServiceContent", &instance, &[]),
        )
        .await?;
        let content = ServiceContent::from_value(&raw)?;
        let version = if content.api_version.is_empty() {
            BOOTSTRAP_VERSION.to_string()
        } else {
            content.api_version.clone()
        };

        let client = Self {
            http,
            url,
            label: label.to_string(),
            endpoint: SoapEndpoint::Vim,
            action: SoapEndpoint::Vim.action(&version),
            content,
            owns_session: true,
            logged_out: Arc::new(AtomicBool::new(false)),
        };

        let session_manager = client.content.session_manager.clone();
        client
            .invoke(
                &session_manager,
                "Login",
                vec![
                    ("userName", username.into()),
                    ("password", password.expose_secret().as_str().into()),
                ],
            )
            .await
            .map_err(|e| VsError {
                message: format!("{label}: {}", e.message),
                ..e
            })?;

        tracing::debug!(
            endpoint = %client.label,
            api_version = %client.content.api_version,
            api_type = %client.content.api_type,
            "SOAP session established"
        );
        Ok(client)
    }

    /// A client for another endpoint on the same server, riding this session.
    pub fn sibling(&self, endpoint: SoapEndpoint) -> Self {
        let base = self
            .url
            .strip_suffix(SoapEndpoint::Vim.path())
            .unwrap_or(&self.url);
        Self {
            http: self.http.clone(),
            url: format!("{base}{}", endpoint.path()),
            label: self.label.clone(),
            endpoint,
            action: endpoint.action(&self.content.api_version),
            content: self.content.clone(),
            owns_session: false,
            logged_out: self.logged_out.clone(),
        }
    }

    pub fn endpoint(&self) -> SoapEndpoint {
        self.endpoint
    }

    async fn call(&self, this: &MoRef, method: &str, args: &[(&str, SoapValue)]) -> VsResult<Value> {
        if self.logged_out.load(Ordering::SeqCst) {
            return Err(VsError::transport(format!("{}: session is closed", self.label)));
        }
        let envelope = request_envelope(self.endpoint.namespace(), method, this, args);
        tracing::debug!(endpoint = ?self.endpoint, method, this = %this, "SOAP call");
        post_envelope(&self.http, &self.url, &self.action, &self.label, envelope).await
    }

    async fn retrieve_pages(&self, spec: &RetrieveSpec) -> VsResult<Vec<ObjectContent>> {
        let pc = self.content.property_collector.clone();
        let mut page = self
            .call(
                &pc,
                "RetrievePropertiesEx",
                &[
                    ("specSet", filter_spec(spec).into()),
                    ("options", SoapObject::new().into()),
                ],
            )
            .await?;

        let mut out = Vec::new();
        loop {
            for obj in as_list(page.get("objects")) {
                out.push(object_content(obj)?);
            }
            let token = match str_at(&page, "token") {
                Some(t) => t.to_string(),
                None => break,
            };
            let next = self
                .call(&pc, "ContinueRetrievePropertiesEx", &[("token", token.as_str().into())])
                .await;
            page = match next {
                Ok(p) => p,
                Err(e) => {
                    // Release the server-side result set before surfacing the error.
                    if let Err(cancel) = self
                        .call(&pc, "CancelRetrievePropertiesEx", &[("token", token.as_str().into())])
                        .await
                    {
                        tracing::warn!(error = %cancel, "failed to release property-collector result set");
                    }
                    return Err(e);
                }
            };
        }
        Ok(out)
    }
}

#[async_trait]
impl VimApi for SoapClient {
    fn service_content(&self) -> &ServiceContent {
        &self.content
    }

    async fn retrieve(&self, spec: &RetrieveSpec) -> VsResult<Vec<ObjectContent>> {
        self.retrieve_pages(spec).await.map_err(|e| {
            if is_timeout(&e) {
                VsError::transient(format!("property retrieval timed out: {}", e.message))
            } else {
                e
            }
        })
    }

    async fn invoke(&self, this: &MoRef, method: &str, args: Vec<(&str, SoapValue)>) -> VsResult<Value> {
        self.call(this, method, &args).await
    }

    async fn logout(&self) -> VsResult<()> {
        if !self.owns_session || self.logged_out.load(Ordering::SeqCst) {
            return Ok(());
        }
        let session_manager = self.content.session_manager.clone();
        let result = self.call(&session_manager, "Logout", &[]).await;
        self.logged_out.store(true, Ordering::SeqCst);
        result.map(|_| ())
    }
}

async fn post_envelope(
    http: &Client,
    url: &str,
    action: &str,
    label: &str,
    envelope: String,
) -> VsResult<Value> {
    let resp = http
        .post(url)
        .header("Content-Type", "text/xml; charset=utf-8")
        .header("SOAPAction", action)
        .body(envelope)
        .send()
        .await
        .map_err(|e| from_reqwest(e, label))?;

    let status = resp.status();
    let text = resp.text().await.map_err(|e| from_reqwest(e, label))?;

    // Faults arrive with HTTP 500 and a SOAP body; decode before looking at the status.
    match decode_response(&text) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(fault.into_error()),
        Err(_) if !status.is_success() => Err(from_status(status, &text)),
        Err(e) => Err(VsError::protocol(format!("{label}: {}", e.message))),
    }
}

/// `PropertyFilterSpec` for a retrieval.
fn filter_spec(spec: &RetrieveSpec) -> SoapObject {
    let mut filter = SoapObject::new();
    for p in &spec.props {
        let mut prop = SoapObject::new().field("type", p.vim_type.as_str());
        if p.paths.is_empty() {
            prop = prop.field("all", true);
        } else {
            prop = prop
                .field("all", false)
                .field("pathSet", p.paths.clone());
        }
        filter = filter.field("propSet", prop);
    }
    match &spec.target {
        RetrieveTarget::Objects(objs) => {
            for obj in objs {
                filter = filter.field(
                    "objectSet",
                    SoapObject::new().field("obj", obj).field("skip", false),
                );
            }
        }
        RetrieveTarget::View(view) => {
            let traverse = SoapObject::typed("TraversalSpec")
                .field("name", "traverseView")
                .field("type", "ContainerView")
                .field("path", "view")
                .field("skip", false);
            filter = filter.field(
                "objectSet",
                SoapObject::new()
                    .field("obj", view)
                    .field("skip", true)
                    .field("selectSet", traverse),
            );
        }
    }
    filter
}

fn object_content(obj: &Value) -> VsResult<ObjectContent> {
    let moref = obj
        .get("obj")
        .and_then(MoRef::from_value)
        .ok_or_else(|| VsError::protocol("ObjectContent without obj"))?;
    let mut props = BTreeMap::new();
    for p in as_list(obj.get("propSet")) {
        if let Some(name) = p.get("name").and_then(Value::as_str) {
            props.insert(name.to_string(), p.get("val").cloned().unwrap_or(Value::Null));
        }
    }
    let missing = as_list(obj.get("missingSet"))
        .into_iter()
        .map(|m| MissingProperty {
            path: str_at(m, "path").unwrap_or_default().to_string(),
            fault: str_at(m, "fault.fault._type")
                .or_else(|| str_at(m, "fault._type"))
                .unwrap_or("SystemError")
                .to_string(),
        })
        .collect();
    Ok(ObjectContent {
        obj: moref,
        props,
        missing,
    })
}
