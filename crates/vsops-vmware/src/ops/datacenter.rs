//! Datacenter, folder and extension information.

use super::{observe, OpContext, Operation};
use crate::props::string_at;
use crate::types::{FolderClass, InventoryKind, MoRef};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use vsops_core::{OpResult, VsResult};

// ── datacenter_info ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DatacenterInfo {
    #[serde(default)]
    pub datacenter: Option<String>,
}

#[async_trait]
impl Operation for DatacenterInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let all = observe(|| ctx.inventory.list_all(InventoryKind::Datacenter, None, &["name"])).await?;
        let mut rows: Vec<Value> = all
            .iter()
            .filter(|oc| match &self.datacenter {
                Some(wanted) => oc.name() == Some(wanted.as_str()),
                None => true,
            })
            .map(|oc| json!({ "name": oc.name().unwrap_or_default(), "moid": oc.obj.value }))
            .collect();
        rows.sort_by(|a, b| string_at(a, "name").cmp(&string_at(b, "name")));
        Ok(OpResult::unchanged().with_data("datacenter_info", rows))
    }
}

// ── folder_info ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FolderInfo {
    pub datacenter: String,
}

const CLASSES: [FolderClass; 4] = [
    FolderClass::Vm,
    FolderClass::Host,
    FolderClass::Datastore,
    FolderClass::Network,
];

#[async_trait]
impl Operation for FolderInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let inv = &ctx.inventory;
        let dc = inv
            .require_by_name(InventoryKind::Datacenter, &self.datacenter, None)
            .await?;
        let dc_moref = dc.require_moref()?;
        let roots = observe(|| {
            inv.get_properties(&dc, &["vmFolder", "hostFolder", "datastoreFolder", "networkFolder"])
        })
        .await?;
        let root_class: HashMap<MoRef, FolderClass> = CLASSES
            .iter()
            .filter_map(|c| {
                let r = roots.get(c.datacenter_property()).and_then(MoRef::from_value)?;
                Some((r, *c))
            })
            .collect();

        let folders = observe(|| inv.list_all(InventoryKind::Folder, Some(&dc), &["name", "parent"])).await?;
        let nodes: HashMap<MoRef, (String, Option<MoRef>)> = folders
            .iter()
            .map(|oc| {
                let name = crate::inventory::unescape_name(oc.name().unwrap_or_default());
                let parent = oc.get("parent").and_then(MoRef::from_value);
                (oc.obj.clone(), (name, parent))
            })
            .collect();

        let mut grouped: BTreeMap<&'static str, Vec<String>> =
            CLASSES.iter().map(|c| (c.segment(), Vec::new())).collect();
        for folder in nodes.keys() {
            let mut names = Vec::new();
            let mut current = folder.clone();
            let class = loop {
                let Some((name, parent)) = nodes.get(&current) else { break None };
                names.push(name.clone());
                if let Some(class) = root_class.get(&current) {
                    break Some(*class);
                }
                match parent {
                    Some(p) if *p != dc_moref && names.len() < 64 => current = p.clone(),
                    _ => break None,
                }
            };
            if let Some(class) = class {
                names.reverse();
                let path = format!("/{}/{}", self.datacenter, names.join("/"));
                if let Some(list) = grouped.get_mut(class.segment()) {
                    list.push(path);
                }
            }
        }
        for list in grouped.values_mut() {
            list.sort();
        }
        Ok(OpResult::unchanged().with_data("folder_info", json!(grouped)))
    }
}

// ── extension_info ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExtensionInfo {}

#[async_trait]
impl Operation for ExtensionInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let records = observe(|| ctx.inventory.list_records(InventoryKind::Extension, None)).await?;
        let mut rows: Vec<Value> = records
            .iter()
            .map(|r| {
                let e = &r.record;
                let mut row = Map::new();
                row.insert("key".into(), json!(r.id));
                row.insert("version".into(), json!(string_at(e, "version")));
                row.insert("company".into(), json!(string_at(e, "company")));
                row.insert("name".into(), json!(string_at(e, "description.label")));
                row.insert("summary".into(), json!(string_at(e, "description.summary")));
                row.insert("type".into(), json!(string_at(e, "type")));
                row.insert("last_heartbeat_time".into(), json!(string_at(e, "lastHeartbeatTime")));
                Value::Object(row)
            })
            .collect();
        rows.sort_by(|a, b| string_at(a, "key").cmp(&string_at(b, "key")));
        Ok(OpResult::unchanged().with_data("extension_info", rows))
    }
}
