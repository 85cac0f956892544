//! Standard and distributed switching information.

use super::{observe, HostScope, OpContext, Operation};
use crate::props::{as_list, at, bool_at, i64_at, string_at, strings_at};
use crate::types::{InventoryHandle, InventoryKind, MoRef};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use vsops_core::{OpResult, VsResult};

/// Drop the `key-vim.host.PhysicalNic-` style prefix the server puts on
/// physical NIC and port group keys.
fn strip_key(key: &str) -> String {
    key.strip_prefix("key-vim.host.")
        .and_then(|rest| rest.split_once('-'))
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| key.to_string())
}

async fn datacenter_scope(ctx: &OpContext, datacenter: Option<&str>) -> VsResult<Option<InventoryHandle>> {
    match datacenter {
        Some(name) => Ok(Some(
            ctx.inventory
                .require_by_name(InventoryKind::Datacenter, name, None)
                .await?,
        )),
        None => Ok(None),
    }
}

// ── host_vswitch_info ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HostVswitchInfo {
    #[serde(flatten)]
    pub scope: HostScope,
}

fn vswitch_row(sw: &Value) -> Value {
    let policy = at(sw, "spec.policy").cloned().unwrap_or(Value::Null);
    json!({
        "mtu": i64_at(sw, "mtu"),
        "num_ports": i64_at(sw, "numPorts"),
        "num_ports_available": i64_at(sw, "numPortsAvailable"),
        "pnics": strings_at(sw, "pnic").iter().map(|k| strip_key(k)).collect::<Vec<_>>(),
        "portgroups": strings_at(sw, "portgroup").iter().map(|k| strip_key(k)).collect::<Vec<_>>(),
        "security": {
            "allow_promiscuous": bool_at(&policy, "security.allowPromiscuous"),
            "mac_changes": bool_at(&policy, "security.macChanges"),
            "forged_transmits": bool_at(&policy, "security.forgedTransmits"),
        },
        "load_balancing": at(&policy, "nicTeaming.policy").cloned(),
        "notify_switches": bool_at(&policy, "nicTeaming.notifySwitches"),
        "failback": bool_at(&policy, "nicTeaming.rollingOrder").map(|rolling| !rolling),
        "failover_active": strings_at(&policy, "nicTeaming.nicOrder.activeNic"),
        "failover_standby": strings_at(&policy, "nicTeaming.nicOrder.standbyNic"),
    })
}

#[async_trait]
impl Operation for HostVswitchInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut out = BTreeMap::new();
        for (name, host) in self.scope.resolve(ctx).await? {
            let props = observe(|| ctx.inventory.get_properties(&host, &["config.network.vswitch"])).await?;
            let switches: BTreeMap<String, Value> = as_list(props.get("config.network.vswitch"))
                .into_iter()
                .map(|sw| (string_at(sw, "name"), vswitch_row(sw)))
                .collect();
            out.insert(name, switches);
        }
        Ok(OpResult::unchanged().with_data("hosts_vswitch_info", json!(out)))
    }
}

// ── dvswitch_info ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DvswitchInfo {
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default, alias = "switch")]
    pub switch_name: Option<String>,
}

const DVS_KEYS: [&str; 6] = [
    "name",
    "config.uuid",
    "config.maxMtu",
    "summary.numPorts",
    "summary.productInfo.version",
    "summary.hostMember",
];

#[async_trait]
impl Operation for DvswitchInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let scope = datacenter_scope(ctx, self.datacenter.as_deref()).await?;
        let switches = observe(|| {
            ctx.inventory
                .list_all(InventoryKind::DistributedSwitch, scope.as_ref(), &DVS_KEYS)
        })
        .await?;
        let members: Vec<MoRef> = switches
            .iter()
            .flat_map(|oc| as_list(oc.get("summary.hostMember")))
            .filter_map(MoRef::from_value)
            .collect();
        let host_names = ctx.inventory.names_of(&members).await?;

        let mut rows: Vec<Value> = switches
            .iter()
            .filter(|oc| match &self.switch_name {
                Some(wanted) => oc.name() == Some(wanted.as_str()),
                None => true,
            })
            .map(|oc| {
                let mut hosts: Vec<String> = as_list(oc.get("summary.hostMember"))
                    .into_iter()
                    .filter_map(MoRef::from_value)
                    .map(|h| host_names.get(&h).cloned().unwrap_or(h.value))
                    .collect();
                hosts.sort();
                json!({
                    "name": oc.name().unwrap_or_default(),
                    "moid": oc.obj.value,
                    "uuid": oc.get("config.uuid"),
                    "mtu": oc.get("config.maxMtu"),
                    "num_ports": oc.get("summary.numPorts"),
                    "version": oc.get("summary.productInfo.version"),
                    "host_members": hosts,
                })
            })
            .collect();
        rows.sort_by(|a, b| string_at(a, "name").cmp(&string_at(b, "name")));
        Ok(OpResult::unchanged().with_data("distributed_virtual_switches", rows))
    }
}

// ── dvs_portgroup_info ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DvsPortgroupInfo {
    pub datacenter: String,
    #[serde(default)]
    pub dvswitch: Option<String>,
    #[serde(default)]
    pub show_uplink: bool,
}

const PORTGROUP_KEYS: [&str; 6] = [
    "name",
    "config.distributedVirtualSwitch",
    "config.numPorts",
    "config.defaultPortConfig.vlan.vlanId",
    "config.type",
    "config.uplink",
];

/// A single VLAN id, or the ranges of a trunk.
fn vlan_info(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::Number(n)) => json!({ "vlan_id": n, "trunk": false }),
        Some(Value::String(s)) => json!({ "vlan_id": s.parse::<i64>().ok(), "trunk": false }),
        Some(other) => {
            let ranges: Vec<Value> = as_list(Some(other))
                .into_iter()
                .map(|r| json!({ "start": i64_at(r, "start"), "end": i64_at(r, "end") }))
                .collect();
            json!({ "trunk": true, "ranges": ranges })
        }
        None => json!({ "vlan_id": Value::Null, "trunk": false }),
    }
}

#[async_trait]
impl Operation for DvsPortgroupInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let dc = ctx
            .inventory
            .require_by_name(InventoryKind::Datacenter, &self.datacenter, None)
            .await?;
        let portgroups = observe(|| {
            ctx.inventory
                .list_all(InventoryKind::DistributedPortgroup, Some(&dc), &PORTGROUP_KEYS)
        })
        .await?;
        let switches: Vec<MoRef> = portgroups
            .iter()
            .filter_map(|oc| oc.get("config.distributedVirtualSwitch").and_then(MoRef::from_value))
            .collect();
        let switch_names = ctx.inventory.names_of(&switches).await?;

        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for oc in &portgroups {
            let uplink = oc.get("config.uplink").and_then(Value::as_bool).unwrap_or(false);
            if uplink && !self.show_uplink {
                continue;
            }
            let switch = match oc.get("config.distributedVirtualSwitch").and_then(MoRef::from_value) {
                Some(s) => switch_names.get(&s).cloned().unwrap_or(s.value),
                None => continue,
            };
            if matches!(&self.dvswitch, Some(wanted) if *wanted != switch) {
                continue;
            }
            let mut row = Map::new();
            row.insert("portgroup_name".into(), json!(oc.name().unwrap_or_default()));
            row.insert("moid".into(), json!(oc.obj.value));
            row.insert("num_ports".into(), oc.get("config.numPorts").cloned().unwrap_or(Value::Null));
            row.insert("port_binding".into(), oc.get("config.type").cloned().unwrap_or(Value::Null));
            row.insert("uplink".into(), json!(uplink));
            row.insert("vlan_info".into(), vlan_info(oc.get("config.defaultPortConfig.vlan.vlanId")));
            grouped.entry(switch).or_default().push(Value::Object(row));
        }
        for list in grouped.values_mut() {
            list.sort_by(|a, b| string_at(a, "portgroup_name").cmp(&string_at(b, "portgroup_name")));
        }
        Ok(OpResult::unchanged().with_data("dvs_portgroup_info", json!(grouped)))
    }
}
