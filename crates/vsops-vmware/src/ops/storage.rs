//! Datastores and first-class disks.

use super::{observe, OpContext, Operation};
use crate::diff::{diff, Comparator, DesiredSpec};
use crate::inventory::NamedRecord;
use crate::props::{i64_at, str_at, string_at, strings_at};
use crate::types::{InventoryHandle, InventoryKind, MoRef};
use crate::units::parse_capacity_mb;
use crate::xml::{SoapObject, SoapValue};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use vsops_core::{OpResult, VsError, VsResult};

// ── datastore_info ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DatastoreInfo {
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

const DATASTORE_KEYS: [&str; 7] = [
    "name",
    "summary.capacity",
    "summary.freeSpace",
    "summary.uncommitted",
    "summary.type",
    "summary.url",
    "summary.accessible",
];

#[async_trait]
impl Operation for DatastoreInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let inv = &ctx.inventory;
        let scope = match &self.datacenter {
            Some(dc) => Some(inv.require_by_name(InventoryKind::Datacenter, dc, None).await?),
            None => None,
        };
        let all = observe(|| inv.list_all(InventoryKind::Datastore, scope.as_ref(), &DATASTORE_KEYS)).await?;
        let mut rows: Vec<Value> = all
            .iter()
            .filter(|oc| match &self.name {
                Some(wanted) => oc.name() == Some(wanted.as_str()),
                None => true,
            })
            .map(|oc| {
                let num = |k: &str| oc.get(k).and_then(Value::as_i64).unwrap_or(0);
                let capacity = num("summary.capacity");
                let free = num("summary.freeSpace");
                let uncommitted = num("summary.uncommitted");
                json!({
                    "name": oc.name().unwrap_or_default(),
                    "moid": oc.obj.value,
                    "capacity": capacity,
                    "free_space": free,
                    "uncommitted": uncommitted,
                    "provisioned": capacity - free + uncommitted,
                    "type": oc.get("summary.type"),
                    "url": oc.get("summary.url"),
                    "accessible": oc.get("summary.accessible").and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect();
        rows.sort_by(|a, b| string_at(a, "name").cmp(&string_at(b, "name")));
        Ok(OpResult::unchanged().with_data("datastores", rows))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  First-class disks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn disk_row(datastore: &str, d: &NamedRecord) -> Value {
    json!({
        "name": d.name,
        "id": d.id,
        "datastore_name": datastore,
        "size_mb": i64_at(&d.record, "config.capacityInMB"),
        "consumption_type": strings_at(&d.record, "config.consumptionType"),
        "descriptor_path": str_at(&d.record, "config.backing.filePath"),
    })
}

async fn datastore(ctx: &OpContext, name: &str) -> VsResult<MoRef> {
    ctx.inventory
        .require_by_name(InventoryKind::Datastore, name, None)
        .await?
        .require_moref()
}

fn disk_manager(ctx: &OpContext) -> VsResult<MoRef> {
    ctx.vim()
        .service_content()
        .vstorage_object_manager
        .clone()
        .ok_or_else(|| VsError::protocol("server has no VStorageObjectManager"))
}

fn disk_id(id: &str) -> SoapObject {
    SoapObject::typed("ID").field("id", id)
}

// ── first_class_disk_info ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FirstClassDiskInfo {
    pub datastore_name: String,
    #[serde(default)]
    pub disk_name: Option<String>,
}

#[async_trait]
impl Operation for FirstClassDiskInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let ds = datastore(ctx, &self.datastore_name).await?;
        let scope = InventoryHandle::from_moref(InventoryKind::Datastore, &ds);
        let disks = observe(|| ctx.inventory.list_records(InventoryKind::FirstClassDisk, Some(&scope))).await?;
        let mut rows: Vec<Value> = disks
            .iter()
            .filter(|d| match &self.disk_name {
                Some(wanted) => &d.name == wanted,
                None => true,
            })
            .map(|d| disk_row(&self.datastore_name, d))
            .collect();
        rows.sort_by(|a, b| string_at(a, "name").cmp(&string_at(b, "name")));
        Ok(OpResult::unchanged().with_data("first_class_disks", rows))
    }
}

// ── first_class_disk ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
}

#[derive(Debug, Deserialize)]
pub struct FirstClassDisk {
    pub datastore_name: String,
    pub disk_name: String,
    /// `"10GB"`, `"512MB"`, `"1TB"`; required to create.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

fn default_presence() -> Presence {
    Presence::Present
}

#[async_trait]
impl Operation for FirstClassDisk {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let size_mb = self.size.as_deref().map(parse_capacity_mb).transpose()?;
        let ds = datastore(ctx, &self.datastore_name).await?;
        let manager = disk_manager(ctx)?;
        let existing = observe(|| ctx.inventory.list_disks(&ds))
            .await?
            .into_iter()
            .find(|d| d.name == self.disk_name);
        let current_mb = existing.as_ref().and_then(|d| i64_at(&d.record, "config.capacityInMB"));

        let mut observed = Map::new();
        observed.insert("present".into(), json!(existing.is_some()));
        if let Some(mb) = current_mb {
            observed.insert("capacity_mb".into(), json!(mb));
        }
        let want_present = self.state == Presence::Present;
        let mut desired = DesiredSpec::new().set("present", want_present, Comparator::Scalar);
        if want_present {
            match (existing.is_some(), size_mb) {
                (false, None) => {
                    return Err(VsError::config_missing(format!(
                        "size is required to create disk '{}'",
                        self.disk_name
                    )))
                }
                (true, Some(mb)) if current_mb.is_some_and(|cur| (mb as i64) < cur) => {
                    return Err(VsError::conflict(format!(
                        "disk '{}' is {} MB; first-class disks cannot shrink to {mb} MB",
                        self.disk_name,
                        current_mb.unwrap_or_default()
                    )))
                }
                _ => {}
            }
            desired = desired.opt("capacity_mb", size_mb, Comparator::Scalar);
        }
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        let target = self.disk_name.clone();
        let existing_id = existing.as_ref().map(|d| d.id.clone());
        let name = self.disk_name.clone();
        let ds_ref = ds.clone();
        let outcome = rec
            .apply(&target, changes, |changes| async move {
                let vim = ctx.vim();
                let (method, args): (&str, Vec<(&str, SoapValue)>) = match (&existing_id, want_present) {
                    (None, _) => {
                        let spec = SoapObject::typed("VslmCreateSpec")
                            .field("name", name.as_str())
                            .field(
                                "backingSpec",
                                SoapObject::typed("VslmCreateSpecDiskFileBackingSpec")
                                    .field("datastore", &ds_ref)
                                    .field("provisioningType", "thin"),
                            )
                            .field("capacityInMB", size_mb.unwrap_or_default() as i64);
                        ("CreateDisk_Task", vec![("spec", spec.into())])
                    }
                    (Some(id), true) => {
                        let mb = changes
                            .get("capacity_mb")
                            .and_then(|c| c.after.as_i64())
                            .unwrap_or_default();
                        (
                            "ExtendDisk_Task",
                            vec![("id", disk_id(id).into()), ("datastore", (&ds_ref).into()), ("newCapacityInMB", mb.into())],
                        )
                    }
                    (Some(id), false) => (
                        "DeleteVStorageObject_Task",
                        vec![("id", disk_id(id).into()), ("datastore", (&ds_ref).into())],
                    ),
                };
                tracing::info!(disk = %name, method, "changing first-class disk");
                let task = vim.invoke(&manager, method, args).await?;
                ctx.run_task(&task, method).await
            })
            .await;

        let mut result = rec.finish();
        let report = if outcome.is_applied() {
            ctx.inventory
                .list_disks(&ds)
                .await?
                .iter()
                .find(|d| d.name == self.disk_name)
                .map(|d| disk_row(&self.datastore_name, d))
                .unwrap_or(Value::Null)
        } else {
            existing
                .as_ref()
                .map(|d| disk_row(&self.datastore_name, d))
                .unwrap_or(Value::Null)
        };
        result.insert("first_class_disk", report);
        Ok(result)
    }
}
