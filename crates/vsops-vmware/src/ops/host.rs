//! ESXi host configuration: services, lockdown, maintenance mode, NTP.

use super::{host_manager, observe, HostScope, OpContext, Operation};
use crate::diff::{diff, ChangeSet, Comparator, DesiredSpec, SetIntent};
use crate::props::{as_list, bool_at, str_at, string_at};
use crate::types::{InventoryHandle, MoRef};
use crate::xml::{SoapObject, SoapValue};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use vsops_core::{OpResult, VsError, VsResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn read_services(ctx: &OpContext, host: &InventoryHandle) -> VsResult<(MoRef, Vec<Value>)> {
    let system = host_manager(ctx, host, "serviceSystem").await?;
    let handle = InventoryHandle::from_moref(crate::types::InventoryKind::Host, &system);
    let props = observe(|| ctx.inventory.get_properties(&handle, &["serviceInfo.service"])).await?;
    let mut services: Vec<Value> = as_list(props.get("serviceInfo.service")).into_iter().cloned().collect();
    services.sort_by(|a, b| string_at(a, "key").cmp(&string_at(b, "key")));
    Ok((system, services))
}

fn service_row(s: &Value) -> Value {
    json!({
        "key": string_at(s, "key"),
        "label": string_at(s, "label"),
        "running": bool_at(s, "running").unwrap_or(false),
        "policy": string_at(s, "policy"),
        "required": bool_at(s, "required").unwrap_or(false),
        "uninstallable": bool_at(s, "uninstallable").unwrap_or(false),
        "source_package_name": str_at(s, "sourcePackage.sourcePackageName"),
        "source_package_desc": str_at(s, "sourcePackage.description"),
    })
}

// ── host_service_info ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HostServiceInfo {
    #[serde(flatten)]
    pub scope: HostScope,
}

#[async_trait]
impl Operation for HostServiceInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut out = BTreeMap::new();
        for (name, host) in self.scope.resolve(ctx).await? {
            let (_, services) = read_services(ctx, &host).await?;
            out.insert(name, services.iter().map(service_row).collect::<Vec<_>>());
        }
        Ok(OpResult::unchanged().with_data("host_service_info", json!(out)))
    }
}

// ── host_service_manager ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[serde(alias = "present")]
    Start,
    #[serde(alias = "absent")]
    Stop,
    Restart,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePolicy {
    On,
    Off,
    Automatic,
}

impl ServicePolicy {
    fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Automatic => "automatic",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HostServiceManager {
    #[serde(flatten)]
    pub scope: HostScope,
    pub service_name: String,
    #[serde(default)]
    pub service_policy: Option<ServicePolicy>,
    #[serde(default = "default_service_state")]
    pub state: ServiceState,
}

fn default_service_state() -> ServiceState {
    ServiceState::Start
}

#[async_trait]
impl Operation for HostServiceManager {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut rec = ctx.reconciler();
        let mut status = BTreeMap::new();
        for (name, host) in self.scope.resolve(ctx).await? {
            let (system, services) = read_services(ctx, &host).await?;
            let service = match services.iter().find(|s| str_at(s, "key") == Some(self.service_name.as_str())) {
                Some(s) => s.clone(),
                None => {
                    rec.fail(VsError::not_found(format!(
                        "service '{}' not found on host {name}",
                        self.service_name
                    )));
                    break;
                }
            };
            let mut observed = Map::new();
            observed.insert("policy".into(), json!(string_at(&service, "policy")));
            observed.insert("running".into(), json!(bool_at(&service, "running").unwrap_or(false)));

            let running = match self.state {
                ServiceState::Start => Some(true),
                ServiceState::Stop => Some(false),
                ServiceState::Restart | ServiceState::Unchanged => None,
            };
            let desired = DesiredSpec::new()
                .opt("policy", self.service_policy.map(|p| p.as_str()), Comparator::Enum)
                .opt("running", running, Comparator::Scalar);
            let mut changes = diff(&observed, &desired);
            if self.state == ServiceState::Restart {
                changes.push("restart", observed["running"].clone(), json!("restarted"));
            }

            let vim = ctx.vim();
            let key = self.service_name.clone();
            let policy = self.service_policy;
            let progress = rec.progress();
            let outcome = rec
                .apply(&name, changes, |changes| async move {
                    if changes.contains("policy") {
                        if let Some(p) = policy {
                            vim.invoke(
                                &system,
                                "UpdateServicePolicy",
                                vec![("id", key.as_str().into()), ("policy", p.as_str().into())],
                            )
                            .await?;
                            progress.step();
                        }
                    }
                    if let Some(change) = changes.get("running") {
                        let method = if change.after == json!(true) { "StartService" } else { "StopService" };
                        vim.invoke(&system, method, vec![("id", key.as_str().into())]).await?;
                        progress.step();
                    }
                    if changes.contains("restart") {
                        vim.invoke(&system, "RestartService", vec![("id", key.as_str().into())]).await?;
                    }
                    Ok(())
                })
                .await;

            let current = if outcome.is_applied() {
                let (_, after) = read_services(ctx, &host).await?;
                after
                    .into_iter()
                    .find(|s| str_at(s, "key") == Some(self.service_name.as_str()))
                    .unwrap_or(service)
            } else {
                service
            };
            status.insert(
                name,
                json!({
                    "service_name": self.service_name,
                    "policy": string_at(&current, "policy"),
                    "running": bool_at(&current, "running").unwrap_or(false),
                }),
            );
        }
        let mut result = rec.finish();
        result.insert("host_service_status", json!(status));
        Ok(result)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Lockdown
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockdownMode {
    #[serde(alias = "absent")]
    Disabled,
    #[serde(alias = "present")]
    Normal,
    Strict,
}

impl LockdownMode {
    fn server_name(&self) -> &'static str {
        match self {
            Self::Disabled => "lockdownDisabled",
            Self::Normal => "lockdownNormal",
            Self::Strict => "lockdownStrict",
        }
    }
}

async fn access_manager(ctx: &OpContext, host: &InventoryHandle) -> VsResult<MoRef> {
    host_manager(ctx, host, "hostAccessManager").await
}

// ── host_lockdown ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HostLockdown {
    #[serde(flatten)]
    pub scope: HostScope,
    #[serde(alias = "state")]
    pub lockdown_mode: LockdownMode,
}

#[async_trait]
impl Operation for HostLockdown {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut rec = ctx.reconciler();
        let mut report = BTreeMap::new();
        let desired_mode = self.lockdown_mode.server_name();
        for (name, host) in self.scope.resolve(ctx).await? {
            let manager = access_manager(ctx, &host).await?;
            let handle = InventoryHandle::from_moref(crate::types::InventoryKind::Host, &manager);
            let props = observe(|| ctx.inventory.get_properties(&handle, &["lockdownMode"])).await?;
            let previous = props.get("lockdownMode").and_then(Value::as_str).unwrap_or("lockdownDisabled").to_string();

            let mut observed = Map::new();
            observed.insert("lockdown_mode".into(), json!(previous));
            let changes = diff(
                &observed,
                &DesiredSpec::new().set("lockdown_mode", desired_mode, Comparator::Enum),
            );
            let vim = ctx.vim();
            let outcome = rec
                .apply(&name, changes, |_| async move {
                    vim.invoke(&manager, "ChangeLockdownMode", vec![("mode", desired_mode.into())])
                        .await
                })
                .await;
            let current = if outcome.is_applied() { desired_mode.to_string() } else { previous.clone() };
            report.insert(
                name,
                json!({ "previous": previous, "desired": desired_mode, "current": current }),
            );
        }
        let mut result = rec.finish();
        result.insert("host_lockdown_state", json!(report));
        Ok(result)
    }
}

// ── host_lockdown_exceptions ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HostLockdownExceptions {
    #[serde(flatten)]
    pub scope: HostScope,
    pub exception_users: Vec<String>,
    #[serde(default)]
    pub state: SetIntent,
}

async fn query_exceptions(ctx: &OpContext, manager: &MoRef) -> VsResult<Vec<String>> {
    let vim = ctx.vim();
    let raw = observe(|| vim.invoke(manager, "QueryLockdownExceptions", vec![])).await?;
    let mut users: Vec<String> = as_list(Some(&raw))
        .into_iter()
        .filter_map(|u| u.as_str().map(str::to_string))
        .collect();
    users.sort();
    Ok(users)
}

#[async_trait]
impl Operation for HostLockdownExceptions {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut rec = ctx.reconciler();
        let mut report = BTreeMap::new();
        for (name, host) in self.scope.resolve(ctx).await? {
            let manager = access_manager(ctx, &host).await?;
            let previous = query_exceptions(ctx, &manager).await?;
            let desired_users = self.state.resolve(&previous, &self.exception_users);

            let mut observed = Map::new();
            observed.insert("exception_users".into(), json!(previous));
            let changes = diff(
                &observed,
                &DesiredSpec::new().set("exception_users", &desired_users, Comparator::Set),
            );
            let vim = ctx.vim();
            let users = desired_users.clone();
            let target = manager.clone();
            let outcome = rec
                .apply(&name, changes, |_| async move {
                    vim.invoke(&target, "UpdateLockdownExceptions", vec![("users", users.into())])
                        .await
                })
                .await;
            let current = if outcome.is_applied() {
                query_exceptions(ctx, &manager).await?
            } else {
                previous.clone()
            };
            report.insert(
                name,
                json!({ "previous": previous, "desired": desired_users, "current": current }),
            );
        }
        let mut result = rec.finish();
        result.insert("host_lockdown_exceptions", json!(report));
        Ok(result)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Maintenance mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Host maintenance state. `Entering` and `Exiting` hold while the
/// corresponding task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceState {
    Normal,
    Entering,
    InMaintenance,
    Exiting,
}

impl MaintenanceState {
    fn observed(in_maintenance: bool) -> Self {
        if in_maintenance {
            Self::InMaintenance
        } else {
            Self::Normal
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Entering => "entering",
            Self::InMaintenance => "in_maintenance",
            Self::Exiting => "exiting",
        }
    }

    /// The state to pass through on the way to `target`, or `None` when
    /// there is nothing to do.
    pub fn transition(self, target: MaintenanceState) -> Option<MaintenanceState> {
        match (self, target) {
            (Self::Normal, Self::InMaintenance) => Some(Self::Entering),
            (Self::InMaintenance, Self::Normal) => Some(Self::Exiting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceTarget {
    #[serde(alias = "enter")]
    Present,
    #[serde(alias = "exit")]
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VsanDecommissionMode {
    EnsureObjectAccessibility,
    EvacuateAllData,
    NoAction,
}

impl VsanDecommissionMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::EnsureObjectAccessibility => "ensureObjectAccessibility",
            Self::EvacuateAllData => "evacuateAllData",
            Self::NoAction => "noAction",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HostMaintenanceMode {
    #[serde(flatten)]
    pub scope: HostScope,
    #[serde(default = "default_maintenance_target")]
    pub state: MaintenanceTarget,
    #[serde(default)]
    pub evacuate: bool,
    /// Seconds the server may spend before giving up; 0 means no limit.
    /// Distinct from the connection's `timeout`, which shares the parameter map.
    #[serde(default)]
    pub maintenance_timeout: i64,
    #[serde(default, alias = "vsan")]
    pub vsan_mode: Option<VsanDecommissionMode>,
}

fn default_maintenance_target() -> MaintenanceTarget {
    MaintenanceTarget::Present
}

#[async_trait]
impl Operation for HostMaintenanceMode {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let target = match self.state {
            MaintenanceTarget::Present => MaintenanceState::InMaintenance,
            MaintenanceTarget::Absent => MaintenanceState::Normal,
        };
        let mut rec = ctx.reconciler();
        let mut report = BTreeMap::new();
        for (name, host) in self.scope.resolve(ctx).await? {
            let props = observe(|| ctx.inventory.get_properties(&host, &["runtime.inMaintenanceMode"])).await?;
            let current = MaintenanceState::observed(
                props.get("runtime.inMaintenanceMode").and_then(Value::as_bool).unwrap_or(false),
            );
            let mut changes = ChangeSet::new();
            let step = current.transition(target);
            if step.is_some() {
                changes.push("maintenance_mode", json!(current.as_str()), json!(target.as_str()));
            }
            let host_ref = host.require_moref()?;
            let timeout = self.maintenance_timeout;
            let evacuate = self.evacuate;
            let vsan_mode = self.vsan_mode;
            let outcome = rec
                .apply(&name, changes, |_| async move {
                    let (method, args) = match step {
                        Some(MaintenanceState::Entering) => {
                            let spec = vsan_mode.map(|m| {
                                SoapObject::typed("HostMaintenanceSpec").field(
                                    "vsanMode",
                                    SoapObject::typed("VsanHostDecommissionMode").field("objectAction", m.as_str()),
                                )
                            });
                            let mut args: Vec<(&str, SoapValue)> =
                                vec![("timeout", timeout.into()), ("evacuatePoweredOffVms", evacuate.into())];
                            if let Some(spec) = spec {
                                args.push(("maintenanceSpec", spec.into()));
                            }
                            ("EnterMaintenanceMode_Task", args)
                        }
                        _ => ("ExitMaintenanceMode_Task", vec![("timeout", timeout.into())]),
                    };
                    tracing::info!(host = %host_ref, ?step, "changing maintenance state");
                    let task = ctx.vim().invoke(&host_ref, method, args).await?;
                    ctx.run_task(&task, method).await
                })
                .await;
            let now = if outcome.is_applied() { target } else { current };
            report.insert(name, json!({ "previous": current.as_str(), "current": now.as_str() }));
        }
        let mut result = rec.finish();
        result.insert("host_maintenance_mode", json!(report));
        Ok(result)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  NTP
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct HostNtp {
    #[serde(flatten)]
    pub scope: HostScope,
    pub ntp_servers: Vec<String>,
    #[serde(default)]
    pub state: SetIntent,
}

#[async_trait]
impl Operation for HostNtp {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut rec = ctx.reconciler();
        let mut report = BTreeMap::new();
        for (name, host) in self.scope.resolve(ctx).await? {
            let system = host_manager(ctx, &host, "dateTimeSystem").await?;
            let handle = InventoryHandle::from_moref(crate::types::InventoryKind::Host, &system);
            let props =
                observe(|| ctx.inventory.get_properties(&handle, &["dateTimeInfo.ntpConfig.server"])).await?;
            let previous: Vec<String> = as_list(props.get("dateTimeInfo.ntpConfig.server"))
                .into_iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect();
            let (desired_servers, cmp) = match self.state {
                SetIntent::Set => (self.ntp_servers.clone(), Comparator::Ordered),
                intent => (intent.resolve(&previous, &self.ntp_servers), Comparator::Set),
            };
            let mut observed = Map::new();
            observed.insert("ntp_servers".into(), json!(previous));
            let changes = diff(&observed, &DesiredSpec::new().set("ntp_servers", &desired_servers, cmp));

            let vim = ctx.vim();
            let servers = desired_servers.clone();
            let outcome = rec
                .apply(&name, changes, |_| async move {
                    let config = SoapObject::typed("HostDateTimeConfig")
                        .field("ntpConfig", SoapObject::typed("HostNtpConfig").field("server", servers));
                    vim.invoke(&system, "UpdateDateTimeConfig", vec![("config", config.into())])
                        .await
                })
                .await;
            let current = if outcome.is_applied() { desired_servers.clone() } else { previous.clone() };
            report.insert(
                name,
                json!({ "previous": previous, "desired": desired_servers, "current": current }),
            );
        }
        let mut result = rec.finish();
        result.insert("host_ntp_status", json!(report));
        Ok(result)
    }
}
