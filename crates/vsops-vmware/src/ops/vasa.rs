//! VASA storage provider registration through the storage-monitoring
//! service.

use super::{observe, OpContext, Operation};
use crate::diff::{diff, Comparator, DesiredSpec, Outcome};
use crate::props::{as_list, string_at};
use crate::types::MoRef;
use crate::xml::SoapObject;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use vsops_core::{OpResult, VsError, VsResult};

/// Service instance of the storage-monitoring endpoint.
const SMS_SERVICE: (&str, &str) = ("SmsServiceInstance", "ServiceInstance");

fn secret<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(d)?.map(SecretString::new))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
}

fn default_presence() -> Presence {
    Presence::Present
}

/// Fields carry a `vasa_` prefix so they never collide with the connection
/// keys in the same parameter map.
#[derive(Debug, Deserialize)]
pub struct VasaProvider {
    #[serde(rename = "vasa_name")]
    pub name: String,
    #[serde(default, rename = "vasa_url")]
    pub url: Option<String>,
    #[serde(default, rename = "vasa_username")]
    pub username: Option<String>,
    #[serde(default, rename = "vasa_password", deserialize_with = "secret")]
    pub password: Option<SecretString>,
    /// PEM of the provider certificate.
    #[serde(default, rename = "vasa_certificate")]
    pub certificate: Option<String>,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

#[derive(Debug, Clone)]
struct Registered {
    url: String,
    uid: String,
}

async fn storage_manager(ctx: &OpContext) -> VsResult<MoRef> {
    let sms = ctx.sms();
    let service = MoRef::new(SMS_SERVICE.0, SMS_SERVICE.1);
    let raw = observe(|| sms.invoke(&service, "QueryStorageManager", vec![])).await?;
    MoRef::from_value(&raw).ok_or_else(|| VsError::protocol("QueryStorageManager returned no reference"))
}

async fn find_provider(ctx: &OpContext, manager: &MoRef, name: &str) -> VsResult<Option<Registered>> {
    let sms = ctx.sms();
    let providers = observe(|| sms.invoke(manager, "QueryProvider", vec![])).await?;
    for provider in as_list(Some(&providers)).into_iter().filter_map(MoRef::from_value) {
        let info = observe(|| sms.invoke(&provider, "QueryProviderInfo", vec![])).await?;
        if string_at(&info, "name") == name {
            return Ok(Some(Registered {
                url: string_at(&info, "url"),
                uid: string_at(&info, "uid"),
            }));
        }
    }
    Ok(None)
}

#[async_trait]
impl Operation for VasaProvider {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let manager = storage_manager(ctx).await?;
        let existing = find_provider(ctx, &manager, &self.name).await?;

        let mut observed = Map::new();
        observed.insert("present".into(), json!(existing.is_some()));
        let mut desired = DesiredSpec::new().set("present", self.state == Presence::Present, Comparator::Scalar);
        if let Some(found) = &existing {
            observed.insert("url".into(), json!(found.url));
        }
        let spec = match self.state {
            Presence::Present => {
                let url = self
                    .url
                    .clone()
                    .ok_or_else(|| VsError::config_missing("vasa_url is required to register a provider"))?;
                desired = desired.set("url", url.clone(), Comparator::Scalar);
                let (username, password) = match (&self.username, &self.password) {
                    (Some(u), Some(p)) => (u.clone(), p.expose_secret().clone()),
                    _ => {
                        return Err(VsError::config_missing(
                            "vasa_username and vasa_password are required to register a provider",
                        ))
                    }
                };
                Some(
                    SoapObject::typed("VasaProviderSpec")
                        .field("name", self.name.as_str())
                        .field("url", url)
                        .field("username", username)
                        .field("password", password)
                        .opt("certificate", self.certificate.as_deref()),
                )
            }
            Presence::Absent => None,
        };
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        let sms = ctx.sms();
        let target = manager.clone();
        let stale = existing.clone();
        let progress = rec.progress();
        let outcome = rec
            .apply(&self.name, changes, |_| async move {
                // A changed url means re-registering.
                if let Some(old) = stale {
                    tracing::info!(provider = %old.uid, "unregistering storage provider");
                    let task = sms
                        .invoke(&target, "UnregisterProvider_Task", vec![("providerId", old.uid.into())])
                        .await?;
                    ctx.run_storage_task(&task, "UnregisterProvider_Task").await?;
                    progress.step();
                }
                let Some(spec) = spec else { return Ok(None) };
                let task = sms
                    .invoke(&target, "RegisterProvider_Task", vec![("providerSpec", spec.into())])
                    .await?;
                let provider = ctx.run_storage_task(&task, "RegisterProvider_Task").await?;
                Ok(MoRef::from_value(&provider))
            })
            .await;

        let registered = match &outcome {
            Outcome::Applied(_) => find_provider(ctx, &manager, &self.name).await?,
            Outcome::Failed if rec.changed() => find_provider(ctx, &manager, &self.name).await.unwrap_or(None),
            _ => existing,
        };
        let mut result = rec.finish();
        result.insert(
            "vasa_provider",
            json!({
                "name": self.name,
                "url": registered.as_ref().map(|r| r.url.clone()),
                "uid": registered.as_ref().map(|r| r.uid.clone()),
                "registered": registered.is_some(),
            }),
        );
        Ok(result)
    }
}
