//! Operation façade.
//!
//! Each operation family is a parameter record implementing [`Operation`].
//! [`execute`] deserializes the caller's flat parameter map into that record,
//! runs it against an [`OpContext`] and folds every error into the result
//! envelope, so nothing but an [`OpResult`] crosses this boundary.

pub mod cluster;
pub mod content_library;
pub mod custom_attr;
pub mod datacenter;
pub mod host;
pub mod network;
pub mod permissions;
pub mod storage;
pub mod tags;
pub mod vasa;
pub mod vm;
pub mod vsan;

use crate::api::{MobApi, RestApi, VimApi};
use crate::diff::Reconciler;
use crate::inventory::Inventory;
use crate::session::Session;
use crate::task::{CancelSignal, TaskDriver, TaskFlavor, TaskRef};
use crate::types::{InventoryHandle, InventoryKind};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use vsops_core::{ErrorKind, OpResult, VsError, VsResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything an operation may touch during one invocation.
pub struct OpContext {
    session: Arc<Session>,
    pub inventory: Inventory,
    pub tasks: TaskDriver,
    pub dry_run: bool,
    pub task_deadline: Duration,
    pub cancel: CancelSignal,
}

impl OpContext {
    pub fn new(session: Arc<Session>, cancel: CancelSignal, dry_run: bool, task_deadline: Duration) -> Self {
        let inventory = Inventory::new(session.soap_channel(), session.rest_channel());
        let tasks = TaskDriver::new(session.soap_channel(), session.sms_channel(), cancel.clone());
        Self {
            session,
            inventory,
            tasks,
            dry_run,
            task_deadline,
            cancel,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn vim(&self) -> Arc<dyn VimApi> {
        self.session.soap_channel()
    }

    pub fn vsan(&self) -> Arc<dyn VimApi> {
        self.session.vsan_channel()
    }

    pub fn sms(&self) -> Arc<dyn VimApi> {
        self.session.sms_channel()
    }

    pub fn rest(&self) -> Arc<dyn RestApi> {
        self.session.rest_channel()
    }

    pub fn mob(&self) -> Arc<dyn MobApi> {
        self.session.mob_channel()
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.dry_run).with_cancel(self.cancel.clone())
    }

    /// Await a vim25 task returned by an `*_Task` method.
    pub async fn run_task(&self, task: &Value, what: &str) -> VsResult<Value> {
        let task = TaskRef::from_value(task, TaskFlavor::Vim)?;
        self.tasks.run(&task, self.task_deadline, what).await
    }

    /// Await a storage-monitoring task.
    pub async fn run_storage_task(&self, task: &Value, what: &str) -> VsResult<Value> {
        let task = TaskRef::from_value(task, TaskFlavor::Storage)?;
        self.tasks.run(&task, self.task_deadline, what).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One operation family.
#[async_trait]
pub trait Operation: DeserializeOwned + Send {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult>;
}

/// Every operation name [`execute`] accepts.
pub const OPERATIONS: &[&str] = &[
    "datacenter_info",
    "folder_info",
    "extension_info",
    "cluster_info",
    "cluster_drs",
    "cluster_vcls",
    "host_service_info",
    "host_service_manager",
    "host_lockdown",
    "host_lockdown_exceptions",
    "host_maintenance_mode",
    "host_ntp",
    "host_vswitch_info",
    "dvswitch_info",
    "dvs_portgroup_info",
    "vm_info",
    "guest_info",
    "snapshot_info",
    "datastore_info",
    "first_class_disk_info",
    "first_class_disk",
    "custom_attribute_info",
    "custom_attribute_def",
    "guest_custom_attributes",
    "tag_category_info",
    "tag_info",
    "tag_category",
    "tag",
    "tag_manager",
    "content_library_info",
    "content_library_item_download",
    "vsan_cluster",
    "vsan_repair_objects",
    "role_info",
    "object_role_permission",
    "global_permission",
    "vasa_provider",
];

async fn dispatch(name: &str, params: &Map<String, Value>, ctx: &OpContext) -> VsResult<OpResult> {
    match name {
        "datacenter_info" => call::<datacenter::DatacenterInfo>(params, ctx).await,
        "folder_info" => call::<datacenter::FolderInfo>(params, ctx).await,
        "extension_info" => call::<datacenter::ExtensionInfo>(params, ctx).await,
        "cluster_info" => call::<cluster::ClusterInfo>(params, ctx).await,
        "cluster_drs" => call::<cluster::ClusterDrs>(params, ctx).await,
        "cluster_vcls" => call::<cluster::ClusterVcls>(params, ctx).await,
        "host_service_info" => call::<host::HostServiceInfo>(params, ctx).await,
        "host_service_manager" => call::<host::HostServiceManager>(params, ctx).await,
        "host_lockdown" => call::<host::HostLockdown>(params, ctx).await,
        "host_lockdown_exceptions" => call::<host::HostLockdownExceptions>(params, ctx).await,
        "host_maintenance_mode" => call::<host::HostMaintenanceMode>(params, ctx).await,
        "host_ntp" => call::<host::HostNtp>(params, ctx).await,
        "host_vswitch_info" => call::<network::HostVswitchInfo>(params, ctx).await,
        "dvswitch_info" => call::<network::DvswitchInfo>(params, ctx).await,
        "dvs_portgroup_info" => call::<network::DvsPortgroupInfo>(params, ctx).await,
        "vm_info" => call::<vm::VmInfo>(params, ctx).await,
        "guest_info" => call::<vm::GuestInfo>(params, ctx).await,
        "snapshot_info" => call::<vm::SnapshotInfo>(params, ctx).await,
        "datastore_info" => call::<storage::DatastoreInfo>(params, ctx).await,
        "first_class_disk_info" => call::<storage::FirstClassDiskInfo>(params, ctx).await,
        "first_class_disk" => call::<storage::FirstClassDisk>(params, ctx).await,
        "custom_attribute_info" => call::<custom_attr::CustomAttributeInfo>(params, ctx).await,
        "custom_attribute_def" => call::<custom_attr::CustomAttributeDef>(params, ctx).await,
        "guest_custom_attributes" => call::<custom_attr::GuestCustomAttributes>(params, ctx).await,
        "tag_category_info" => call::<tags::TagCategoryInfo>(params, ctx).await,
        "tag_info" => call::<tags::TagInfo>(params, ctx).await,
        "tag_category" => call::<tags::TagCategory>(params, ctx).await,
        "tag" => call::<tags::Tag>(params, ctx).await,
        "tag_manager" => call::<tags::TagManager>(params, ctx).await,
        "content_library_info" => call::<content_library::ContentLibraryInfo>(params, ctx).await,
        "content_library_item_download" => {
            call::<content_library::ContentLibraryItemDownload>(params, ctx).await
        }
        "vsan_cluster" => call::<vsan::VsanCluster>(params, ctx).await,
        "vsan_repair_objects" => call::<vsan::VsanRepairObjects>(params, ctx).await,
        "role_info" => call::<permissions::RoleInfo>(params, ctx).await,
        "object_role_permission" => call::<permissions::ObjectRolePermission>(params, ctx).await,
        "global_permission" => call::<permissions::GlobalPermission>(params, ctx).await,
        "vasa_provider" => call::<vasa::VasaProvider>(params, ctx).await,
        other => Err(VsError::protocol(format!("unknown operation '{other}'"))
            .with_details(serde_json::json!({ "known": OPERATIONS }))),
    }
}

async fn call<O: Operation>(params: &Map<String, Value>, ctx: &OpContext) -> VsResult<OpResult> {
    parse_params::<O>(params)?.run(ctx).await
}

/// Run `operation` and fold any error into the envelope.
pub async fn execute(operation: &str, params: &Map<String, Value>, ctx: &OpContext) -> OpResult {
    match dispatch(operation, params, ctx).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(operation, kind = %e.kind, error = %e.message, "operation failed");
            OpResult::from_error(&e)
        }
    }
}

/// Deserialize an operation's parameters. Connection keys in the same map
/// are ignored; a missing required field is `ConfigMissing`.
pub fn parse_params<T: DeserializeOwned>(params: &Map<String, Value>) -> VsResult<T> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| {
        let message = format!("invalid parameters: {e}");
        if e.to_string().starts_with("missing field") {
            VsError::config_missing(message)
        } else {
            VsError::protocol(message)
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run an observe step, retrying once in place on `Transient`.
pub async fn observe<T, F, Fut>(mut read: F) -> VsResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VsResult<T>>,
{
    match read().await {
        Err(e) if e.kind == ErrorKind::Transient => {
            tracing::debug!(error = %e, "transient fault during observe; retrying once");
            read().await
        }
        other => other,
    }
}

/// Hosts addressed by cluster or by name; `esxi_hostname` wins when both
/// are given.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostScope {
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub esxi_hostname: Option<String>,
}

impl HostScope {
    /// Resolved hosts as `(name, handle)`, sorted by name.
    pub async fn resolve(&self, ctx: &OpContext) -> VsResult<Vec<(String, InventoryHandle)>> {
        let inv = &ctx.inventory;
        let handles = match (&self.esxi_hostname, &self.cluster_name) {
            (Some(host), _) => vec![inv.require_by_name(InventoryKind::Host, host, None).await?],
            (None, Some(cluster)) => {
                let cluster = inv.require_by_name(InventoryKind::Cluster, cluster, None).await?;
                inv.list_children(&cluster, Some(InventoryKind::Host)).await?
            }
            (None, None) => {
                return Err(VsError::config_missing(
                    "one of cluster_name or esxi_hostname is required",
                ))
            }
        };
        let morefs = handles
            .iter()
            .map(InventoryHandle::require_moref)
            .collect::<VsResult<Vec<_>>>()?;
        let names = inv.names_of(&morefs).await?;
        let mut hosts: Vec<(String, InventoryHandle)> = handles
            .into_iter()
            .zip(morefs)
            .map(|(h, m)| (names.get(&m).cloned().unwrap_or_else(|| m.value.clone()), h))
            .collect();
        hosts.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hosts)
    }
}

/// The configuration-manager object `manager` of a host.
pub async fn host_manager(
    ctx: &OpContext,
    host: &InventoryHandle,
    manager: &str,
) -> VsResult<crate::types::MoRef> {
    let key = format!("configManager.{manager}");
    let keys = [key.as_str()];
    let props = observe(|| ctx.inventory.get_properties(host, &keys)).await?;
    props
        .get(&key)
        .and_then(crate::types::MoRef::from_value)
        .ok_or_else(|| VsError::not_found(format!("host {} has no {manager}", host.id)))
}
