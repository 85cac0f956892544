//! Custom attribute definitions and per-VM values.

use super::vm::VmSelector;
use super::{observe, OpContext, Operation};
use crate::diff::{diff, Comparator, DesiredSpec, Outcome};
use crate::inventory::NamedRecord;
use crate::props::{as_list, i64_at, string_at};
use crate::types::{InventoryKind, MoRef};
use crate::xml::SoapValue;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use vsops_core::{Diagnostic, OpResult, VsError, VsResult};

/// Managed-object type label for definitions that apply to every type.
const GLOBAL: &str = "global";

fn fields_manager(ctx: &OpContext) -> VsResult<MoRef> {
    ctx.vim()
        .service_content()
        .custom_fields_manager
        .clone()
        .ok_or_else(|| VsError::protocol("server has no custom fields manager"))
}

async fn definitions(ctx: &OpContext) -> VsResult<Vec<NamedRecord>> {
    observe(|| ctx.inventory.list_records(InventoryKind::CustomFieldDefinition, None)).await
}

fn field_key(def: &NamedRecord) -> Option<i64> {
    def.id.parse().ok()
}

// ── custom_attribute_info ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CustomAttributeInfo {
    #[serde(default)]
    pub object_type: Option<String>,
}

#[async_trait]
impl Operation for CustomAttributeInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut rows: Vec<Value> = definitions(ctx)
            .await?
            .into_iter()
            .filter(|d| match &self.object_type {
                Some(t) => &d.container == t,
                None => true,
            })
            .map(|d| {
                json!({
                    "key": field_key(&d),
                    "name": d.name,
                    "type": d.container,
                    "value_type": string_at(&d.record, "type"),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            string_at(a, "name")
                .cmp(&string_at(b, "name"))
                .then_with(|| i64_at(a, "key").cmp(&i64_at(b, "key")))
        });
        Ok(OpResult::unchanged().with_data("custom_attribute_info", rows))
    }
}

// ── custom_attribute_def ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
}

fn default_presence() -> Presence {
    Presence::Present
}

#[derive(Debug, Deserialize)]
pub struct CustomAttributeDef {
    #[serde(alias = "name")]
    pub custom_attribute: String,
    /// Managed-object type the definition applies to, or `"global"`.
    pub object_type: String,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

#[async_trait]
impl Operation for CustomAttributeDef {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let manager = fields_manager(ctx)?;
        let existing = definitions(ctx)
            .await?
            .into_iter()
            .find(|d| d.name == self.custom_attribute && d.container == self.object_type);

        let mut observed = Map::new();
        observed.insert("present".into(), json!(existing.is_some()));
        let want = self.state == Presence::Present;
        let changes = diff(&observed, &DesiredSpec::new().set("present", want, Comparator::Scalar));

        let mut rec = ctx.reconciler();
        let name = self.custom_attribute.clone();
        let mo_type = (self.object_type != GLOBAL).then(|| self.object_type.clone());
        let existing_key = existing.as_ref().and_then(field_key);
        let vim = ctx.vim();
        let outcome = rec
            .apply(&self.custom_attribute, changes, |_| async move {
                match existing_key {
                    Some(key) => {
                        vim.invoke(&manager, "RemoveCustomFieldDef", vec![("key", key.into())])
                            .await?;
                        Ok(None)
                    }
                    None => {
                        let mut args: Vec<(&str, SoapValue)> = vec![("name", name.as_str().into())];
                        if let Some(t) = &mo_type {
                            args.push(("moType", t.as_str().into()));
                        }
                        let added = vim.invoke(&manager, "AddCustomFieldDef", args).await?;
                        Ok(i64_at(&added, "key"))
                    }
                }
            })
            .await;

        let key = match outcome {
            Outcome::Applied(key) => key,
            _ => existing_key,
        };
        let mut result = rec.finish();
        result.insert(
            "custom_attribute_def",
            json!({
                "name": self.custom_attribute,
                "object_type": self.object_type,
                "key": key,
            }),
        );
        Ok(result)
    }
}

// ── guest_custom_attributes ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AttributeValue {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct GuestCustomAttributes {
    #[serde(flatten)]
    pub vm: VmSelector,
    pub attributes: Vec<AttributeValue>,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

#[async_trait]
impl Operation for GuestCustomAttributes {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let manager = fields_manager(ctx)?;
        let handle = self.vm.resolve(ctx).await?;
        let vm = handle.require_moref()?;
        let defs: Vec<NamedRecord> = definitions(ctx)
            .await?
            .into_iter()
            .filter(|d| d.container == "VirtualMachine" || d.container == GLOBAL)
            .collect();
        let props = observe(|| ctx.inventory.get_properties(&handle, &["customValue"])).await?;
        let values: BTreeMap<i64, String> = as_list(props.get("customValue"))
            .into_iter()
            .filter_map(|v| Some((i64_at(v, "key")?, string_at(v, "value"))))
            .collect();

        // Observed and desired are keyed by attribute name.
        let mut observed = Map::new();
        let mut desired = DesiredSpec::new();
        let mut keys: BTreeMap<String, Option<i64>> = BTreeMap::new();
        for attr in &self.attributes {
            let key = defs.iter().find(|d| d.name == attr.name).and_then(field_key);
            let current = key.and_then(|k| values.get(&k).cloned()).unwrap_or_default();
            observed.insert(attr.name.clone(), json!(current));
            let want = match self.state {
                Presence::Present => attr.value.clone(),
                Presence::Absent => String::new(),
            };
            desired = desired.set(attr.name.clone(), want, Comparator::Scalar);
            keys.insert(attr.name.clone(), key);
        }
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        let target = vm.value.clone();
        let vim = ctx.vim();
        let entity = vm.clone();
        let progress = rec.progress();
        let created = rec
            .apply(&target, changes, |changes| async move {
                let mut created = Vec::new();
                for change in changes.iter() {
                    let key = match keys.get(&change.key).copied().flatten() {
                        Some(k) => k,
                        None => {
                            let added = vim
                                .invoke(
                                    &manager,
                                    "AddCustomFieldDef",
                                    vec![("name", change.key.as_str().into()), ("moType", "VirtualMachine".into())],
                                )
                                .await?;
                            created.push(change.key.clone());
                            progress.step();
                            i64_at(&added, "key").ok_or_else(|| {
                                VsError::protocol(format!("AddCustomFieldDef returned no key for '{}'", change.key))
                            })?
                        }
                    };
                    let value = change.after.as_str().unwrap_or_default().to_string();
                    vim.invoke(
                        &manager,
                        "SetField",
                        vec![("entity", (&entity).into()), ("key", key.into()), ("value", value.into())],
                    )
                    .await?;
                    progress.step();
                }
                Ok(created)
            })
            .await;
        if let Outcome::Applied(created) = &created {
            for name in created {
                rec.diagnose(Diagnostic::info(format!("created custom attribute definition '{name}'")));
            }
        }

        let mut after: BTreeMap<String, String> = BTreeMap::new();
        if created.is_applied() {
            let props = ctx.inventory.get_properties(&handle, &["customValue"]).await?;
            let defs = definitions(ctx).await?;
            for v in as_list(props.get("customValue")) {
                let Some(key) = i64_at(v, "key") else { continue };
                if let Some(def) = defs.iter().find(|d| field_key(d) == Some(key)) {
                    after.insert(def.name.clone(), string_at(v, "value"));
                }
            }
        } else {
            for (k, v) in &values {
                if let Some(def) = defs.iter().find(|d| field_key(d) == Some(*k)) {
                    after.insert(def.name.clone(), v.clone());
                }
            }
        }
        let mut result = rec.finish();
        result.insert("customvalues", json!(after));
        Ok(result)
    }
}
