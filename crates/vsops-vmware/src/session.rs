//! Session lifecycle.
//!
//! A [`Session`] is built per invocation and owns every channel to the
//! server. `close` logs out of each endpoint exactly once; a session dropped
//! without `close` schedules a best-effort logout so no server session is
//! orphaned.

use crate::api::{MobApi, RestApi, VimApi};
use crate::config::{ConnectionConfig, TlsPolicy};
use crate::mob::MobClient;
use crate::rest::RestClient;
use crate::soap::{SoapClient, SoapEndpoint};

use reqwest::{Client, Proxy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vsops_core::{VsError, VsResult};

/// The channels a session multiplexes.
#[derive(Clone)]
pub struct Channels {
    pub vim: Arc<dyn VimApi>,
    pub vsan: Arc<dyn VimApi>,
    pub sms: Arc<dyn VimApi>,
    pub rest: Arc<dyn RestApi>,
    pub mob: Arc<dyn MobApi>,
}

pub struct Session {
    label: String,
    channels: Channels,
    closed: AtomicBool,
}

impl Session {
    /// Open a fresh session. Sessions are never reused across calls.
    pub async fn open(config: &ConnectionConfig) -> VsResult<Self> {
        let label = config.endpoint_label();
        let http = build_http(config, &label)?;
        let base_url = config.base_url();

        let vim = SoapClient::login(
            http.clone(),
            &base_url,
            &label,
            &config.username,
            &config.password,
        )
        .await?;
        let vsan = vim.sibling(SoapEndpoint::Vsan);
        let sms = vim.sibling(SoapEndpoint::Sms);
        let rest = RestClient::new(
            http.clone(),
            base_url.clone(),
            label.clone(),
            config.username.clone(),
            config.password(),
        );
        let mob = MobClient::new(
            http,
            base_url,
            label.clone(),
            config.username.clone(),
            config.password(),
        );

        tracing::info!(endpoint = %label, "session opened");
        Ok(Self::from_channels(
            label,
            Channels {
                vim: Arc::new(vim),
                vsan: Arc::new(vsan),
                sms: Arc::new(sms),
                rest: Arc::new(rest),
                mob: Arc::new(mob),
            },
        ))
    }

    /// Wrap already-connected channels.
    pub fn from_channels(label: impl Into<String>, channels: Channels) -> Self {
        Self {
            label: label.into(),
            channels,
            closed: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn soap_channel(&self) -> Arc<dyn VimApi> {
        self.channels.vim.clone()
    }

    pub fn vsan_channel(&self) -> Arc<dyn VimApi> {
        self.channels.vsan.clone()
    }

    pub fn sms_channel(&self) -> Arc<dyn VimApi> {
        self.channels.sms.clone()
    }

    pub fn rest_channel(&self) -> Arc<dyn RestApi> {
        self.channels.rest.clone()
    }

    pub fn mob_channel(&self) -> Arc<dyn MobApi> {
        self.channels.mob.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Log out of every endpoint. Idempotent; the first logout error is
    /// returned after all endpoints were attempted.
    pub async fn close(&self) -> VsResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = logout_all(&self.channels).await;
        match &result {
            Ok(()) => tracing::info!(endpoint = %self.label, "session closed"),
            Err(e) => tracing::warn!(endpoint = %self.label, error = %e, "session logout failed"),
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(endpoint = %self.label, "session dropped without close; scheduling logout");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channels = self.channels.clone();
            handle.spawn(async move {
                if let Err(e) = logout_all(&channels).await {
                    tracing::warn!(error = %e, "deferred logout failed");
                }
            });
        }
    }
}

async fn logout_all(channels: &Channels) -> VsResult<()> {
    let mob = channels.mob.logout().await;
    let rest = channels.rest.logout().await;
    let vim = channels.vim.logout().await;
    mob.and(rest).and(vim)
}

fn build_http(config: &ConnectionConfig, label: &str) -> VsResult<Client> {
    let mut builder = Client::builder()
        .cookie_store(true)
        .timeout(config.timeout)
        .danger_accept_invalid_certs(config.tls == TlsPolicy::Insecure);
    if let Some(proxy) = &config.proxy {
        let proxy = Proxy::all(proxy.url())
            .map_err(|e| VsError::transport(format!("{label}: invalid proxy: {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| VsError::transport(format!("{label}: failed to build HTTP client: {e}")))
}
