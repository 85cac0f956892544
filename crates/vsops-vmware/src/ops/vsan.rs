//! vSAN host membership and cluster object repair.

use super::{host_manager, observe, OpContext, Operation};
use crate::diff::{diff, ChangeSet, Comparator, DesiredSpec};
use crate::props::{bool_at, str_at};
use crate::types::{InventoryHandle, InventoryKind, MoRef};
use crate::xml::SoapObject;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use vsops_core::{OpResult, VsError, VsResult};

/// Cluster health system of the vSAN endpoint.
const CLUSTER_HEALTH: (&str, &str) = ("VsanVcClusterHealthSystem", "vsan-cluster-health-system");

// ── vsan_cluster ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VsanCluster {
    /// Optional when the session is against a single ESXi host.
    #[serde(default)]
    pub esxi_hostname: Option<String>,
    /// Join this cluster; a new one is created when absent.
    #[serde(default)]
    pub cluster_uuid: Option<String>,
}

impl VsanCluster {
    async fn host(&self, ctx: &OpContext) -> VsResult<(String, InventoryHandle)> {
        if let Some(name) = &self.esxi_hostname {
            let handle = ctx.inventory.require_by_name(InventoryKind::Host, name, None).await?;
            return Ok((name.clone(), handle));
        }
        let mut hosts = ctx.inventory.list_all(InventoryKind::Host, None, &["name"]).await?;
        match hosts.len() {
            1 => {
                let host = hosts.remove(0);
                let name = host.name().unwrap_or(&host.obj.value).to_string();
                Ok((name, InventoryHandle::from_moref(InventoryKind::Host, &host.obj)))
            }
            0 => Err(VsError::not_found("no host in inventory")),
            n => Err(VsError::config_missing(format!(
                "esxi_hostname is required when the endpoint manages {n} hosts"
            ))),
        }
    }
}

async fn vsan_config(ctx: &OpContext, system: &MoRef) -> VsResult<Value> {
    let handle = InventoryHandle::from_moref(InventoryKind::Host, system);
    let props = observe(|| ctx.inventory.get_properties(&handle, &["config"])).await?;
    Ok(props.get("config").cloned().unwrap_or(Value::Null))
}

#[async_trait]
impl Operation for VsanCluster {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let (name, host) = self.host(ctx).await?;
        let system = host_manager(ctx, &host, "vsanSystem").await?;
        let config = vsan_config(ctx, &system).await?;

        let mut observed = Map::new();
        observed.insert("enabled".into(), json!(bool_at(&config, "enabled").unwrap_or(false)));
        observed.insert("cluster_uuid".into(), json!(str_at(&config, "clusterInfo.uuid")));
        let desired = DesiredSpec::new()
            .set("enabled", true, Comparator::Scalar)
            .opt("cluster_uuid", self.cluster_uuid.clone(), Comparator::Scalar);
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        let vim = ctx.vim();
        let target = system.clone();
        let join = self.cluster_uuid.clone();
        let outcome = rec
            .apply(&name, changes, |_| async move {
                let cluster = SoapObject::typed("VsanHostClusterInfo").opt("uuid", join.as_deref());
                let spec = SoapObject::typed("VsanHostConfigInfo")
                    .field("enabled", true)
                    .field("clusterInfo", cluster);
                tracing::info!(system = %target, "updating vSAN host configuration");
                let task = vim.invoke(&target, "UpdateVsan_Task", vec![("config", spec.into())]).await?;
                ctx.run_task(&task, "UpdateVsan_Task").await
            })
            .await;

        let uuid = if outcome.is_applied() {
            let config = vsan_config(ctx, &system).await?;
            str_at(&config, "clusterInfo.uuid").map(str::to_string)
        } else {
            self.cluster_uuid
                .clone()
                .or_else(|| str_at(&config, "clusterInfo.uuid").map(str::to_string))
        };
        let mut result = rec.finish();
        result.insert("cluster_uuid", json!(uuid));
        Ok(result)
    }
}

// ── vsan_repair_objects ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VsanRepairObjects {
    pub cluster_name: String,
}

#[async_trait]
impl Operation for VsanRepairObjects {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let cluster = ctx
            .inventory
            .require_by_name(InventoryKind::Cluster, &self.cluster_name, None)
            .await?
            .require_moref()?;

        // Repair is an action, not a state: there is always one change.
        let mut changes = ChangeSet::new();
        changes.push("repair_objects", Value::Null, json!(self.cluster_name));

        let mut rec = ctx.reconciler();
        let vsan = ctx.vsan();
        let health = MoRef::new(CLUSTER_HEALTH.0, CLUSTER_HEALTH.1);
        let target = cluster.clone();
        rec.apply(&self.cluster_name, changes, |_| async move {
            let task = vsan
                .invoke(&health, "VsanHealthRepairClusterObjectsImmediate", vec![("cluster", (&target).into())])
                .await?;
            ctx.run_task(&task, "VsanHealthRepairClusterObjectsImmediate").await
        })
        .await;

        let mut result = rec.finish();
        result.insert("cluster", json!({"name": self.cluster_name, "moid": cluster.value}));
        Ok(result)
    }
}
