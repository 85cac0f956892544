//! Cluster information, DRS and vCLS placement.

use super::{observe, OpContext, Operation};
use crate::diff::{diff, Comparator, DesiredSpec};
use crate::props::{as_list, at, bool_at, i64_at, moref_at, morefs_at, short_enum, str_at};
use crate::types::{InventoryHandle, InventoryKind, MoRef};
use crate::units::{drs_rate_from_server, drs_rate_to_server};
use crate::xml::{SoapObject, SoapValue};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use vsops_core::{OpResult, VsError, VsResult};

const DRS_BEHAVIORS: [&str; 3] = ["manual", "partiallyAutomated", "fullyAutomated"];

/// Server spelling of a DRS automation level given in any case or separator style.
fn drs_behavior(input: &str) -> VsResult<&'static str> {
    let wanted = short_enum(input);
    DRS_BEHAVIORS
        .iter()
        .copied()
        .find(|b| short_enum(b) == wanted)
        .ok_or_else(|| {
            VsError::protocol(format!(
                "unknown DRS behavior '{input}' (expected one of {})",
                DRS_BEHAVIORS.join(", ")
            ))
        })
}

async fn datacenter_scope(ctx: &OpContext, datacenter: &Option<String>) -> VsResult<Option<InventoryHandle>> {
    match datacenter {
        Some(dc) => Ok(Some(
            ctx.inventory.require_by_name(InventoryKind::Datacenter, dc, None).await?,
        )),
        None => Ok(None),
    }
}

async fn cluster_config(ctx: &OpContext, cluster: &InventoryHandle) -> VsResult<Value> {
    let props = observe(|| ctx.inventory.get_properties(cluster, &["configurationEx"])).await?;
    Ok(props.get("configurationEx").cloned().unwrap_or(Value::Null))
}

async fn reconfigure(ctx: &OpContext, cluster: &MoRef, spec: SoapObject, what: &str) -> VsResult<Value> {
    let task = ctx
        .vim()
        .invoke(
            cluster,
            "ReconfigureComputeResource_Task",
            vec![("spec", spec.into()), ("modify", true.into())],
        )
        .await?;
    ctx.run_task(&task, what).await
}

// ── cluster_info ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
}

#[async_trait]
impl Operation for ClusterInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let inv = &ctx.inventory;
        let scope = datacenter_scope(ctx, &self.datacenter).await?;
        let clusters = observe(|| {
            inv.list_all(InventoryKind::Cluster, scope.as_ref(), &["name", "host", "configurationEx"])
        })
        .await?;

        let mut out = BTreeMap::new();
        for oc in clusters {
            let name = oc.name().unwrap_or_default().to_string();
            if matches!(&self.cluster_name, Some(wanted) if *wanted != name) {
                continue;
            }
            let hosts: Vec<MoRef> = as_list(oc.get("host"))
                .into_iter()
                .filter_map(MoRef::from_value)
                .collect();
            let mut host_names: Vec<String> = inv.names_of(&hosts).await?.into_values().collect();
            host_names.sort();
            let datacenter = match inv.ancestor_of(&oc.obj, "Datacenter").await? {
                Some(dc) => inv.names_of(&[dc.clone()]).await?.remove(&dc).unwrap_or_default(),
                None => String::new(),
            };
            let config = oc.get("configurationEx").cloned().unwrap_or(Value::Null);
            out.insert(
                name,
                json!({
                    "moid": oc.obj.value,
                    "datacenter": datacenter,
                    "hosts": host_names,
                    "drs_enabled": bool_at(&config, "drsConfig.enabled").unwrap_or(false),
                    "drs_default_vm_behavior": str_at(&config, "drsConfig.defaultVmBehavior"),
                    "drs_vmotion_rate": i64_at(&config, "drsConfig.vmotionRate").map(drs_rate_from_server),
                    "ha_enabled": bool_at(&config, "dasConfig.enabled").unwrap_or(false),
                    "vsan_enabled": bool_at(&config, "vsanConfigInfo.enabled").unwrap_or(false),
                }),
            );
        }
        Ok(OpResult::unchanged().with_data("clusters", json!(out)))
    }
}

// ── cluster_drs ─────────────────────────────────────────────────────

/// DRS settings. `drs_vmotion_rate` is on the 1 (conservative) to 5
/// (aggressive) scale.
#[derive(Debug, Deserialize)]
pub struct ClusterDrs {
    pub cluster_name: String,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default, alias = "enabled")]
    pub enable: Option<bool>,
    #[serde(default)]
    pub drs_default_vm_behavior: Option<String>,
    #[serde(default)]
    pub drs_vmotion_rate: Option<u8>,
    /// VM name to automation level.
    #[serde(default)]
    pub vm_behavior_overrides: Option<BTreeMap<String, String>>,
}

#[async_trait]
impl Operation for ClusterDrs {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let inv = &ctx.inventory;
        let scope = datacenter_scope(ctx, &self.datacenter).await?;
        let cluster = inv
            .require_by_name(InventoryKind::Cluster, &self.cluster_name, scope.as_ref())
            .await?;
        let cluster_ref = cluster.require_moref()?;

        // Validate and convert at the edge.
        let behavior = self.drs_default_vm_behavior.as_deref().map(drs_behavior).transpose()?;
        let rate = self.drs_vmotion_rate.map(drs_rate_to_server).transpose()?;
        let mut overrides: Vec<(String, MoRef, &'static str)> = Vec::new();
        for (vm, level) in self.vm_behavior_overrides.iter().flatten() {
            let handle = inv
                .require_by_name(InventoryKind::VirtualMachine, vm, scope.as_ref())
                .await?;
            overrides.push((vm.clone(), handle.require_moref()?, drs_behavior(level)?));
        }

        let config = cluster_config(ctx, &cluster).await?;
        let drs_vm = as_list(at(&config, "drsVmConfig"));
        let mut observed = Map::new();
        observed.insert("enabled".into(), json!(bool_at(&config, "drsConfig.enabled").unwrap_or(false)));
        observed.insert(
            "default_vm_behavior".into(),
            json!(str_at(&config, "drsConfig.defaultVmBehavior")),
        );
        observed.insert("vmotion_rate".into(), json!(i64_at(&config, "drsConfig.vmotionRate")));
        let existing: BTreeMap<String, Option<String>> = overrides
            .iter()
            .map(|(name, moref, _)| {
                let level = drs_vm
                    .iter()
                    .find(|e| moref_at(e, "key").as_ref() == Some(moref))
                    .and_then(|e| str_at(e, "behavior"))
                    .map(str::to_string);
                (name.clone(), level)
            })
            .collect();
        observed.insert("vm_behavior_overrides".into(), json!(existing));

        let desired_overrides = (!overrides.is_empty()).then(|| {
            overrides
                .iter()
                .map(|(name, _, level)| (name.clone(), Some(level.to_string())))
                .collect::<BTreeMap<_, _>>()
        });
        let desired = DesiredSpec::new()
            .opt("enabled", self.enable, Comparator::Scalar)
            .opt("default_vm_behavior", behavior, Comparator::Enum)
            .opt("vmotion_rate", rate, Comparator::Scalar)
            .opt("vm_behavior_overrides", desired_overrides, Comparator::Scalar);
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        rec.apply(&self.cluster_name, changes, |changes| async move {
            let mut spec = SoapObject::typed("ClusterConfigSpecEx");
            if changes.contains("enabled")
                || changes.contains("default_vm_behavior")
                || changes.contains("vmotion_rate")
            {
                let drs = SoapObject::typed("ClusterDrsConfigInfo")
                    .opt("enabled", self.enable.filter(|_| changes.contains("enabled")))
                    .opt(
                        "defaultVmBehavior",
                        behavior.filter(|_| changes.contains("default_vm_behavior")),
                    )
                    .opt("vmotionRate", rate.filter(|_| changes.contains("vmotion_rate")));
                spec = spec.field("drsConfig", drs);
            }
            if changes.contains("vm_behavior_overrides") {
                let updates: Vec<SoapValue> = overrides
                    .iter()
                    .filter(|(name, _, level)| {
                        existing.get(name).cloned().flatten().as_deref() != Some(*level)
                    })
                    .map(|(name, moref, level)| {
                        let op = if existing.get(name).cloned().flatten().is_some() { "edit" } else { "add" };
                        SoapObject::typed("ClusterDrsVmConfigSpec")
                            .field("operation", op)
                            .field(
                                "info",
                                SoapObject::typed("ClusterDrsVmConfigInfo")
                                    .field("key", moref)
                                    .field("enabled", true)
                                    .field("behavior", *level),
                            )
                            .into()
                    })
                    .collect();
                spec = spec.field("drsVmConfigSpec", SoapValue::List(updates));
            }
            reconfigure(ctx, &cluster_ref, spec, "ReconfigureComputeResource").await
        })
        .await;
        Ok(rec.finish())
    }
}

// ── cluster_vcls ────────────────────────────────────────────────────

/// Datastores vSphere Cluster Services VMs may be placed on, in order.
#[derive(Debug, Deserialize)]
pub struct ClusterVcls {
    pub cluster_name: String,
    #[serde(default)]
    pub datacenter: Option<String>,
    pub allowed_datastores: Vec<String>,
}

#[async_trait]
impl Operation for ClusterVcls {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let inv = &ctx.inventory;
        let scope = datacenter_scope(ctx, &self.datacenter).await?;
        let cluster = inv
            .require_by_name(InventoryKind::Cluster, &self.cluster_name, scope.as_ref())
            .await?;
        let cluster_ref = cluster.require_moref()?;

        let config = cluster_config(ctx, &cluster).await?;
        let current = morefs_at(&config, "systemVMsConfig.allowedDatastores");
        let names = inv.names_of(&current).await?;
        let observed_names: Vec<String> = current
            .iter()
            .map(|m| names.get(m).cloned().unwrap_or_else(|| m.value.clone()))
            .collect();

        let mut wanted: Vec<(String, MoRef)> = Vec::new();
        for name in &self.allowed_datastores {
            let ds = inv
                .require_by_name(InventoryKind::Datastore, name, scope.as_ref())
                .await?;
            wanted.push((name.clone(), ds.require_moref()?));
        }

        let mut observed = Map::new();
        observed.insert("allowed_datastores".into(), json!(observed_names));
        let desired = DesiredSpec::new().set(
            "allowed_datastores",
            &self.allowed_datastores,
            Comparator::Ordered,
        );
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        rec.apply(&self.cluster_name, changes, |_| async move {
            let keep = current
                .iter()
                .zip(wanted.iter())
                .take_while(|(have, (_, want))| *have == want)
                .count();
            let mut updates: Vec<SoapValue> = current[keep..]
                .iter()
                .map(|ds| {
                    SoapObject::typed("ClusterDatastoreUpdateSpec")
                        .field("operation", "remove")
                        .field("removeKey", SoapValue::AnyRef(ds.clone()))
                        .into()
                })
                .collect();
            updates.extend(wanted[keep..].iter().map(|(_, ds)| {
                SoapObject::typed("ClusterDatastoreUpdateSpec")
                    .field("operation", "add")
                    .field("datastore", ds)
                    .into()
            }));
            let spec = SoapObject::typed("ClusterConfigSpecEx").field(
                "systemVMsConfig",
                SoapObject::typed("ClusterSystemVMsConfigSpec")
                    .field("allowedDatastores", SoapValue::List(updates)),
            );
            reconfigure(ctx, &cluster_ref, spec, "ReconfigureComputeResource").await
        })
        .await;
        Ok(rec.finish())
    }
}
