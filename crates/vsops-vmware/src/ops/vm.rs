//! Virtual machine information: listings, single-guest facts, snapshots.

use super::{observe, OpContext, Operation};
use crate::props::{as_list, i64_at, string_at};
use crate::types::{FolderClass, IdKind, InventoryHandle, InventoryKind, InventoryPath, MoRef, NameSelector};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use vsops_core::{OpResult, VsError, VsResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Selecting one VM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the caller names a single virtual machine. Precedence: `moid`,
/// then `uuid`, then `name` (optionally within `folder`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmSelector {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub use_instance_uuid: bool,
    #[serde(default)]
    pub moid: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub name_match: NameSelector,
}

impl VmSelector {
    fn describe(&self) -> String {
        self.moid
            .as_deref()
            .or(self.uuid.as_deref())
            .or(self.name.as_deref())
            .unwrap_or_default()
            .to_string()
    }

    /// The folder to search in: absolute paths as given, relative ones under
    /// the datacenter's VM root.
    fn folder_path(&self) -> VsResult<Option<InventoryPath>> {
        let Some(folder) = self.folder.as_deref() else {
            return Ok(None);
        };
        if folder.starts_with('/') {
            return Ok(Some(InventoryPath::parse(folder)));
        }
        let dc = self.datacenter.as_deref().ok_or_else(|| {
            VsError::config_missing("datacenter is required with a relative folder")
        })?;
        Ok(Some(InventoryPath::under(dc, FolderClass::Vm, folder)))
    }

    pub async fn resolve(&self, ctx: &OpContext) -> VsResult<InventoryHandle> {
        let inv = &ctx.inventory;
        let found = if let Some(moid) = &self.moid {
            inv.find_by_id(InventoryKind::VirtualMachine, moid, IdKind::Moid).await?
        } else if let Some(uuid) = &self.uuid {
            let id_kind = if self.use_instance_uuid { IdKind::InstanceUuid } else { IdKind::BiosUuid };
            inv.find_by_id(InventoryKind::VirtualMachine, uuid, id_kind).await?
        } else if let Some(name) = &self.name {
            let scope = match self.folder_path()? {
                Some(path) => Some(
                    inv.find_by_path(InventoryKind::Folder, &path)
                        .await?
                        .ok_or_else(|| VsError::not_found(format!("folder '{path}' not found")))?,
                ),
                None => None,
            };
            inv.find_by_name_selecting(InventoryKind::VirtualMachine, name, scope.as_ref(), self.name_match)
                .await?
        } else {
            return Err(VsError::config_missing("one of name, uuid or moid is required"));
        };
        found.ok_or_else(|| VsError::not_found(format!("virtual machine '{}' not found", self.describe())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Shared projections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const VM_KEYS: [&str; 12] = [
    "name",
    "config.uuid",
    "config.instanceUuid",
    "config.guestId",
    "config.guestFullName",
    "config.hardware.numCPU",
    "config.hardware.memoryMB",
    "runtime.powerState",
    "runtime.host",
    "guest.ipAddress",
    "guest.hostName",
    "guest.toolsRunningStatus",
];

fn prop(props: &Map<String, Value>, key: &str) -> Value {
    props.get(key).cloned().unwrap_or(Value::Null)
}

/// Custom attribute values keyed by definition name.
async fn custom_values(ctx: &OpContext, raw: Option<&Value>) -> VsResult<Map<String, Value>> {
    let values = as_list(raw);
    if values.is_empty() {
        return Ok(Map::new());
    }
    let defs = ctx
        .inventory
        .list_records(InventoryKind::CustomFieldDefinition, None)
        .await?;
    let names: HashMap<i64, String> = defs
        .iter()
        .filter_map(|d| d.id.parse::<i64>().ok().map(|k| (k, d.name.clone())))
        .collect();
    Ok(values
        .into_iter()
        .filter_map(|v| {
            let key = i64_at(v, "key")?;
            let name = names.get(&key).cloned().unwrap_or_else(|| key.to_string());
            Some((name, json!(string_at(v, "value"))))
        })
        .collect())
}

// ── vm_info ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VmInfo {
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

#[async_trait]
impl Operation for VmInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let inv = &ctx.inventory;
        let scope = match (&self.folder, &self.datacenter) {
            (Some(folder), dc) => {
                let path = match (folder.starts_with('/'), dc) {
                    (true, _) => InventoryPath::parse(folder),
                    (false, Some(dc)) => InventoryPath::under(dc, FolderClass::Vm, folder),
                    (false, None) => {
                        return Err(VsError::config_missing("datacenter is required with a relative folder"))
                    }
                };
                Some(
                    inv.find_by_path(InventoryKind::Folder, &path)
                        .await?
                        .ok_or_else(|| VsError::not_found(format!("folder '{path}' not found")))?,
                )
            }
            (None, Some(dc)) => Some(inv.require_by_name(InventoryKind::Datacenter, dc, None).await?),
            (None, None) => None,
        };

        let vms = observe(|| inv.list_all(InventoryKind::VirtualMachine, scope.as_ref(), &VM_KEYS)).await?;
        let hosts: Vec<MoRef> = vms
            .iter()
            .filter_map(|oc| oc.get("runtime.host").and_then(MoRef::from_value))
            .collect();
        let host_names = inv.names_of(&hosts).await?;

        let mut rows = Vec::with_capacity(vms.len());
        for oc in &vms {
            let props: Map<String, Value> = oc.props.clone().into_iter().collect();
            let host = oc
                .get("runtime.host")
                .and_then(MoRef::from_value)
                .map(|h| host_names.get(&h).cloned().unwrap_or(h.value));
            rows.push(json!({
                "guest_name": oc.name().unwrap_or_default(),
                "moid": oc.obj.value,
                "uuid": prop(&props, "config.uuid"),
                "instance_uuid": prop(&props, "config.instanceUuid"),
                "guest_fullname": prop(&props, "config.guestFullName"),
                "power_state": prop(&props, "runtime.powerState"),
                "ip_address": prop(&props, "guest.ipAddress"),
                "esxi_hostname": host,
            }));
        }
        rows.sort_by(|a, b| {
            string_at(a, "guest_name")
                .cmp(&string_at(b, "guest_name"))
                .then_with(|| string_at(a, "moid").cmp(&string_at(b, "moid")))
        });
        Ok(OpResult::unchanged().with_data("virtual_machines", rows))
    }
}

// ── guest_info ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GuestInfo {
    #[serde(flatten)]
    pub vm: VmSelector,
}

#[async_trait]
impl Operation for GuestInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let handle = self.vm.resolve(ctx).await?;
        let moref = handle.require_moref()?;
        let mut keys: Vec<&str> = VM_KEYS.to_vec();
        keys.push("customValue");
        let props = observe(|| ctx.inventory.get_properties(&handle, &keys)).await?;

        let path = ctx.inventory.path_of(&moref).await?;
        let folder = {
            let segments = path.segments();
            let parent = &segments[..segments.len().saturating_sub(1)];
            format!("/{}", parent.join("/"))
        };
        let host = match props.get("runtime.host").and_then(MoRef::from_value) {
            Some(h) => ctx.inventory.names_of(std::slice::from_ref(&h)).await?.remove(&h),
            None => None,
        };
        let custom = custom_values(ctx, props.get("customValue")).await?;

        let instance = json!({
            "hw_name": prop(&props, "name"),
            "moid": moref.value,
            "hw_product_uuid": prop(&props, "config.uuid"),
            "instance_uuid": prop(&props, "config.instanceUuid"),
            "hw_guest_id": prop(&props, "config.guestId"),
            "hw_guest_fullname": prop(&props, "config.guestFullName"),
            "hw_processor_count": prop(&props, "config.hardware.numCPU"),
            "hw_memtotal_mb": prop(&props, "config.hardware.memoryMB"),
            "hw_power_status": prop(&props, "runtime.powerState"),
            "hw_folder": folder,
            "hw_esxi_host": host,
            "guest_hostname": prop(&props, "guest.hostName"),
            "ipv4": prop(&props, "guest.ipAddress"),
            "guest_tools_status": prop(&props, "guest.toolsRunningStatus"),
            "custom_values": custom,
        });
        Ok(OpResult::unchanged().with_data("instance", instance))
    }
}

// ── snapshot_info ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SnapshotInfo {
    #[serde(flatten)]
    pub vm: VmSelector,
}

#[async_trait]
impl Operation for SnapshotInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let handle = self.vm.resolve(ctx).await?;
        let tree = observe(|| ctx.inventory.snapshot_descendants(&handle)).await?;
        let data = json!({
            "snapshots": tree.snapshots,
            "current_snapshot": tree.current,
        });
        Ok(OpResult::unchanged().with_data("guest_snapshots", data))
    }
}
