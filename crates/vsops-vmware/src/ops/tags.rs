//! Tag categories, tags and tag associations over the vAPI tagging service.

use super::{observe, OpContext, Operation};
use crate::api::{HttpMethod, RestApi};
use crate::diff::{diff, Comparator, DesiredSpec, Outcome, SetIntent};
use crate::inventory::NamedRecord;
use crate::props::{string_at, strings_at};
use crate::types::{InventoryHandle, InventoryKind, MoRef};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use vsops_core::{OpResult, VsError, VsResult};

const CATEGORY_PATH: &str = "/api/cis/tagging/category";
const TAG_PATH: &str = "/api/cis/tagging/tag";
const ASSOCIATION_PATH: &str = "/api/cis/tagging/tag-association";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
}

fn default_presence() -> Presence {
    Presence::Present
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Cardinality {
    #[serde(alias = "single")]
    Single,
    #[serde(alias = "multiple")]
    Multiple,
}

impl Cardinality {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Multiple => "MULTIPLE",
        }
    }
}

async fn categories(ctx: &OpContext) -> VsResult<Vec<NamedRecord>> {
    observe(|| ctx.inventory.list_records(InventoryKind::TagCategory, None)).await
}

async fn tags(ctx: &OpContext) -> VsResult<Vec<NamedRecord>> {
    observe(|| ctx.inventory.list_records(InventoryKind::Tag, None)).await
}

fn sorted_strings(v: &Value, key: &str) -> Vec<String> {
    let mut out = strings_at(v, key);
    out.sort();
    out
}

// ── Info ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TagCategoryInfo {}

#[async_trait]
impl Operation for TagCategoryInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut rows: Vec<Value> = categories(ctx)
            .await?
            .into_iter()
            .map(|c| {
                json!({
                    "category_id": c.id,
                    "category_name": c.name,
                    "category_description": string_at(&c.record, "description"),
                    "category_cardinality": string_at(&c.record, "cardinality"),
                    "category_associable_types": sorted_strings(&c.record, "associable_types"),
                    "category_used_by": strings_at(&c.record, "used_by"),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            string_at(a, "category_name")
                .cmp(&string_at(b, "category_name"))
                .then_with(|| string_at(a, "category_id").cmp(&string_at(b, "category_id")))
        });
        Ok(OpResult::unchanged().with_data("tag_category_info", rows))
    }
}

#[derive(Debug, Deserialize)]
pub struct TagInfo {}

#[async_trait]
impl Operation for TagInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let names: HashMap<String, String> =
            categories(ctx).await?.into_iter().map(|c| (c.id, c.name)).collect();
        let mut rows: Vec<Value> = tags(ctx)
            .await?
            .into_iter()
            .map(|t| {
                json!({
                    "tag_id": t.id,
                    "tag_name": t.name,
                    "tag_description": string_at(&t.record, "description"),
                    "tag_category_id": t.container,
                    "tag_category_name": names.get(&t.container),
                    "tag_used_by": strings_at(&t.record, "used_by"),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            string_at(a, "tag_name")
                .cmp(&string_at(b, "tag_name"))
                .then_with(|| string_at(a, "tag_id").cmp(&string_at(b, "tag_id")))
        });
        Ok(OpResult::unchanged().with_data("tag_info", rows))
    }
}

// ── tag_category ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TagCategory {
    pub category_name: String,
    #[serde(default, alias = "description")]
    pub category_description: Option<String>,
    #[serde(default, alias = "cardinality")]
    pub category_cardinality: Option<Cardinality>,
    /// Only additions are applied to an existing category.
    #[serde(default)]
    pub associable_object_types: Option<Vec<String>>,
    #[serde(default)]
    pub new_category_name: Option<String>,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

#[async_trait]
impl Operation for TagCategory {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let existing = categories(ctx)
            .await?
            .into_iter()
            .find(|c| c.name == self.category_name);

        let mut observed = Map::new();
        observed.insert("present".into(), json!(existing.is_some()));
        let mut desired = DesiredSpec::new().set("present", self.state == Presence::Present, Comparator::Scalar);

        if let (Some(cat), Presence::Present) = (&existing, self.state) {
            let current = string_at(&cat.record, "cardinality");
            if current == "MULTIPLE" && self.category_cardinality == Some(Cardinality::Single) {
                return Err(VsError::conflict(format!(
                    "category '{}' cannot change cardinality from MULTIPLE to SINGLE",
                    self.category_name
                )));
            }
            let associable = sorted_strings(&cat.record, "associable_types");
            observed.insert("description".into(), json!(string_at(&cat.record, "description")));
            observed.insert("cardinality".into(), json!(current));
            observed.insert("associable_types".into(), json!(associable));
            observed.insert("name".into(), json!(cat.name));

            // An empty list already means every object type.
            let widened = match &self.associable_object_types {
                Some(requested) if !associable.is_empty() => {
                    Some(SetIntent::Add.resolve(&associable, requested))
                }
                _ => None,
            };
            desired = desired
                .opt("description", self.category_description.clone(), Comparator::Scalar)
                .opt(
                    "cardinality",
                    self.category_cardinality.map(|c| c.as_str()),
                    Comparator::Enum,
                )
                .opt("associable_types", widened, Comparator::Set)
                .opt("name", self.new_category_name.clone(), Comparator::Scalar);
        }
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        let rest = ctx.rest();
        let existing_id = existing.as_ref().map(|c| c.id.clone());
        let create = json!({
            "name": self.category_name,
            "description": self.category_description.clone().unwrap_or_default(),
            "cardinality": self.category_cardinality.unwrap_or(Cardinality::Multiple).as_str(),
            "associable_types": self.associable_object_types.clone().unwrap_or_default(),
        });
        let outcome = rec
            .apply(&self.category_name, changes, |changes| async move {
                match (existing_id, self.state) {
                    (None, _) => {
                        let id = rest.post(CATEGORY_PATH, create).await?;
                        Ok(id.as_str().map(str::to_string))
                    }
                    (Some(id), Presence::Absent) => {
                        rest.delete(&format!("{CATEGORY_PATH}/{id}")).await?;
                        Ok(None)
                    }
                    (Some(id), Presence::Present) => {
                        let update: Map<String, Value> = changes
                            .iter()
                            .map(|c| (c.key.clone(), c.after.clone()))
                            .collect();
                        rest.request(
                            HttpMethod::Patch,
                            &format!("{CATEGORY_PATH}/{id}"),
                            &[],
                            Some(Value::Object(update)),
                        )
                        .await?;
                        Ok(Some(id))
                    }
                }
            })
            .await;

        let id = match outcome {
            Outcome::Applied(id) => id,
            _ => existing.map(|c| c.id),
        };
        let mut result = rec.finish();
        result.insert(
            "category_results",
            json!({
                "category_id": id,
                "category_name": self.new_category_name.as_deref().unwrap_or(&self.category_name),
            }),
        );
        Ok(result)
    }
}

// ── tag ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct Tag {
    pub tag_name: String,
    /// Required to create; narrows the lookup otherwise.
    #[serde(default, alias = "category")]
    pub category_name: Option<String>,
    #[serde(default, alias = "description")]
    pub tag_description: Option<String>,
    #[serde(default)]
    pub new_tag_name: Option<String>,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

#[async_trait]
impl Operation for Tag {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let category = match &self.category_name {
            Some(name) => Some(ctx.inventory.require_by_name(InventoryKind::TagCategory, name, None).await?),
            None => None,
        };
        let existing = match ctx
            .inventory
            .find_by_name(InventoryKind::Tag, &self.tag_name, category.as_ref())
            .await?
        {
            Some(handle) => tags(ctx).await?.into_iter().find(|t| t.id == handle.id),
            None => None,
        };

        let mut observed = Map::new();
        observed.insert("present".into(), json!(existing.is_some()));
        let mut desired = DesiredSpec::new().set("present", self.state == Presence::Present, Comparator::Scalar);
        if let (Some(tag), Presence::Present) = (&existing, self.state) {
            observed.insert("description".into(), json!(string_at(&tag.record, "description")));
            observed.insert("name".into(), json!(tag.name));
            desired = desired
                .opt("description", self.tag_description.clone(), Comparator::Scalar)
                .opt("name", self.new_tag_name.clone(), Comparator::Scalar);
        }
        if existing.is_none() && self.state == Presence::Present && category.is_none() {
            return Err(VsError::config_missing(format!(
                "category_name is required to create tag '{}'",
                self.tag_name
            )));
        }
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        let rest = ctx.rest();
        let existing_id = existing.as_ref().map(|t| t.id.clone());
        let create = json!({
            "name": self.tag_name,
            "description": self.tag_description.clone().unwrap_or_default(),
            "category_id": category.as_ref().map(|c| c.id.clone()),
        });
        let outcome = rec
            .apply(&self.tag_name, changes, |changes| async move {
                match (existing_id, self.state) {
                    (None, _) => {
                        let id = rest.post(TAG_PATH, create).await?;
                        Ok(id.as_str().map(str::to_string))
                    }
                    (Some(id), Presence::Absent) => {
                        rest.delete(&format!("{TAG_PATH}/{id}")).await?;
                        Ok(None)
                    }
                    (Some(id), Presence::Present) => {
                        let update: Map<String, Value> = changes
                            .iter()
                            .map(|c| (c.key.clone(), c.after.clone()))
                            .collect();
                        rest.request(HttpMethod::Patch, &format!("{TAG_PATH}/{id}"), &[], Some(Value::Object(update)))
                            .await?;
                        Ok(Some(id))
                    }
                }
            })
            .await;

        let id = match outcome {
            Outcome::Applied(id) => id,
            _ => existing.as_ref().map(|t| t.id.clone()),
        };
        let mut result = rec.finish();
        result.insert(
            "tag_status",
            json!({
                "tag_id": id,
                "tag_name": self.new_tag_name.as_deref().unwrap_or(&self.tag_name),
                "category_id": category.map(|c| c.id).or(existing.map(|t| t.container)),
            }),
        );
        Ok(result)
    }
}

// ── tag_manager ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TagManager {
    pub object_name: String,
    /// Managed-object type, e.g. `VirtualMachine` or `HostSystem`.
    pub object_type: String,
    /// Tag names, optionally qualified as `category:tag`.
    pub tag_names: Vec<String>,
    #[serde(default)]
    pub state: SetIntent,
}

fn object_id(moref: &MoRef) -> Value {
    json!({"type": moref.kind, "id": moref.value})
}

impl TagManager {
    async fn tag_id(&self, ctx: &OpContext, name: &str) -> VsResult<String> {
        let inv = &ctx.inventory;
        let handle: InventoryHandle = match name.split_once(':') {
            Some((category, tag)) => {
                let category = inv.require_by_name(InventoryKind::TagCategory, category, None).await?;
                inv.require_by_name(InventoryKind::Tag, tag, Some(&category)).await?
            }
            None => inv.require_by_name(InventoryKind::Tag, name, None).await?,
        };
        Ok(handle.id)
    }
}

#[async_trait]
impl Operation for TagManager {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let kind = InventoryKind::from_vim_type(&self.object_type)
            .ok_or_else(|| VsError::protocol(format!("unsupported object_type '{}'", self.object_type)))?;
        let object = ctx
            .inventory
            .require_by_name(kind, &self.object_name, None)
            .await?
            .require_moref()?;
        let rest = ctx.rest();
        let attached = |rest: Arc<dyn RestApi>, object: Value| async move {
            let ids = rest
                .request(
                    HttpMethod::Post,
                    ASSOCIATION_PATH,
                    &[("action", "list-attached-tags".to_string())],
                    Some(json!({ "object_id": object })),
                )
                .await?;
            let mut ids: Vec<String> = ids
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            ids.sort();
            Ok::<_, VsError>(ids)
        };
        let observed_ids = observe(|| attached(rest.clone(), object_id(&object))).await?;

        let mut requested = Vec::new();
        for name in &self.tag_names {
            requested.push(self.tag_id(ctx, name).await?);
        }
        let desired_ids = self.state.resolve(&observed_ids, &requested);

        let mut observed = Map::new();
        observed.insert("tags".into(), json!(observed_ids));
        let changes = diff(
            &observed,
            &DesiredSpec::new().set("tags", desired_ids.clone(), Comparator::Set),
        );

        let mut rec = ctx.reconciler();
        let target = object.value.clone();
        let body = json!({ "object_id": object_id(&object) });
        let before = observed_ids.clone();
        let api = rest.clone();
        let progress = rec.progress();
        let outcome = rec
            .apply(&target, changes, |_| async move {
                for id in desired_ids.iter().filter(|id| !before.contains(id)) {
                    api.request(
                        HttpMethod::Post,
                        &format!("{ASSOCIATION_PATH}/{id}"),
                        &[("action", "attach".to_string())],
                        Some(body.clone()),
                    )
                    .await?;
                    progress.step();
                }
                for id in before.iter().filter(|id| !desired_ids.contains(id)) {
                    api.request(
                        HttpMethod::Post,
                        &format!("{ASSOCIATION_PATH}/{id}"),
                        &[("action", "detach".to_string())],
                        Some(body.clone()),
                    )
                    .await?;
                    progress.step();
                }
                Ok(())
            })
            .await;

        let current_ids = if outcome.is_applied() || (outcome == Outcome::Failed && rec.changed()) {
            attached(rest, object_id(&object)).await?
        } else {
            observed_ids.clone()
        };
        let labels = labels(ctx).await?;
        let label = |ids: &[String]| -> Vec<String> {
            let mut out: Vec<String> = ids
                .iter()
                .map(|id| labels.get(id).cloned().unwrap_or_else(|| id.clone()))
                .collect();
            out.sort();
            out
        };
        let mut result = rec.finish();
        result.insert(
            "tag_status",
            json!({
                "previous_tags": label(&observed_ids),
                "current_tags": label(&current_ids),
                "attached_tags": label(&current_ids),
            }),
        );
        Ok(result)
    }
}

/// `category:tag` label for every tag id.
async fn labels(ctx: &OpContext) -> VsResult<HashMap<String, String>> {
    let names: HashMap<String, String> = categories(ctx).await?.into_iter().map(|c| (c.id, c.name)).collect();
    Ok(tags(ctx)
        .await?
        .into_iter()
        .map(|t| {
            let category = names.get(&t.container).map(String::as_str).unwrap_or("");
            (t.id.clone(), format!("{category}:{}", t.name))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeVcenter;
    use vsops_core::ErrorKind;

    #[tokio::test]
    async fn infos_are_sorted_by_name() {
        let vc = FakeVcenter::new();
        let env = vc.rest.add_category("env", "SINGLE", &["VirtualMachine"]);
        let app = vc.rest.add_category("app", "MULTIPLE", &[]);
        vc.rest.add_tag(&env, "prod");
        vc.rest.add_tag(&app, "db");

        let cats = vc.run("tag_category_info", json!({}), false).await;
        let rows = cats.data["tag_category_info"].as_array().unwrap();
        assert_eq!(rows[0]["category_name"], "app");
        assert_eq!(rows[1]["category_cardinality"], "SINGLE");

        let tags = vc.run("tag_info", json!({}), false).await;
        let rows = tags.data["tag_info"].as_array().unwrap();
        assert_eq!(rows[0]["tag_name"], "db");
        assert_eq!(rows[1]["tag_category_name"], "env");
        assert!(!tags.changed);
    }

    #[tokio::test]
    async fn category_create_update_and_idempotence() {
        let vc = FakeVcenter::new();
        let params = json!({
            "category_name": "env",
            "category_description": "environments",
            "category_cardinality": "single",
            "associable_object_types": ["VirtualMachine"],
        });
        let created = vc.run("tag_category", params.clone(), false).await;
        assert!(created.changed, "{created:?}");
        assert_eq!(vc.rest.categories()[0]["cardinality"], "SINGLE");

        let again = vc.run("tag_category", params, false).await;
        assert!(!again.changed, "{again:?}");

        let widened = vc
            .run(
                "tag_category",
                json!({"category_name": "env", "associable_object_types": ["HostSystem"], "category_cardinality": "MULTIPLE"}),
                false,
            )
            .await;
        assert!(widened.changed);
        let record = &vc.rest.categories()[0];
        assert_eq!(record["associable_types"], json!(["HostSystem", "VirtualMachine"]));
        assert_eq!(record["cardinality"], "MULTIPLE");
    }

    #[tokio::test]
    async fn multiple_to_single_is_refused() {
        let vc = FakeVcenter::new();
        vc.rest.add_category("env", "MULTIPLE", &[]);
        let result = vc
            .run("tag_category", json!({"category_name": "env", "category_cardinality": "SINGLE"}), false)
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Conflict));
        assert_eq!(vc.rest.count(HttpMethod::Patch, CATEGORY_PATH), 0);
    }

    #[tokio::test]
    async fn deleting_a_category_drops_its_tags() {
        let vc = FakeVcenter::new();
        let env = vc.rest.add_category("env", "SINGLE", &[]);
        vc.rest.add_tag(&env, "prod");
        let result = vc.run("tag_category", json!({"category_name": "env", "state": "absent"}), false).await;
        assert!(result.changed);
        assert!(vc.rest.categories().is_empty());
        assert!(vc.rest.tags().is_empty());
    }

    #[tokio::test]
    async fn tag_needs_a_category_to_be_created() {
        let vc = FakeVcenter::new();
        let missing = vc.run("tag", json!({"tag_name": "prod"}), false).await;
        assert_eq!(missing.error_kind(), Some(ErrorKind::ConfigMissing));

        let env = vc.rest.add_category("env", "SINGLE", &[]);
        let created = vc
            .run("tag", json!({"tag_name": "prod", "category_name": "env", "tag_description": "live"}), false)
            .await;
        assert!(created.changed);
        assert_eq!(created.data["tag_status"]["category_id"], env);
        let renamed = vc
            .run("tag", json!({"tag_name": "prod", "category_name": "env", "new_tag_name": "production"}), false)
            .await;
        assert!(renamed.changed);
        assert_eq!(vc.rest.tags()[0]["name"], "production");
    }

    #[tokio::test]
    async fn tag_manager_add_set_and_remove() {
        let vc = FakeVcenter::new();
        let dc = vc.vim.datacenter("DC1");
        let vm = vc.vim.vm(&dc.vm_folder, "web");
        let env = vc.rest.add_category("env", "SINGLE", &[]);
        let app = vc.rest.add_category("app", "MULTIPLE", &[]);
        let prod = vc.rest.add_tag(&env, "prod");
        let db = vc.rest.add_tag(&app, "db");
        vc.rest.attach(&prod, &vm);

        let base = json!({"object_name": "web", "object_type": "VirtualMachine"});
        let mut add = base.clone();
        add["tag_names"] = json!(["app:db"]);
        let added = vc.run("tag_manager", add.clone(), false).await;
        assert!(added.changed, "{added:?}");
        assert_eq!(added.data["tag_status"]["previous_tags"], json!(["env:prod"]));
        assert_eq!(added.data["tag_status"]["current_tags"], json!(["app:db", "env:prod"]));
        assert!(!vc.run("tag_manager", add, false).await.changed);

        let mut set = base.clone();
        set["tag_names"] = json!(["db"]);
        set["state"] = json!("set");
        assert!(vc.run("tag_manager", set, false).await.changed);
        assert_eq!(vc.rest.attached_to(&vm), vec![db.clone()]);

        let mut remove = base;
        remove["tag_names"] = json!(["db"]);
        remove["state"] = json!("absent");
        let removed = vc.run("tag_manager", remove, true).await;
        assert!(removed.changed);
        assert_eq!(vc.rest.attached_to(&vm), vec![db]);
    }

    #[tokio::test]
    async fn failed_detach_after_attach_reports_changed() {
        let vc = FakeVcenter::new();
        let dc = vc.vim.datacenter("DC1");
        let vm = vc.vim.vm(&dc.vm_folder, "web");
        let env = vc.rest.add_category("env", "SINGLE", &[]);
        let app = vc.rest.add_category("app", "MULTIPLE", &[]);
        let prod = vc.rest.add_tag(&env, "prod");
        let db = vc.rest.add_tag(&app, "db");
        vc.rest.attach(&prod, &vm);
        vc.rest.fail_on(
            HttpMethod::Post,
            &format!("{ASSOCIATION_PATH}/{prod}"),
            VsError::server_fault("detach refused"),
        );

        let params = json!({"object_name": "web", "object_type": "VirtualMachine", "tag_names": ["db"], "state": "set"});
        let result = vc.run("tag_manager", params, false).await;
        assert!(result.failed);
        assert!(result.changed, "{result:?}");
        assert_eq!(result.data["tag_status"]["current_tags"], json!(["app:db", "env:prod"]));
        let mut attached = vc.rest.attached_to(&vm);
        attached.sort();
        let mut expected = vec![db, prod];
        expected.sort();
        assert_eq!(attached, expected);
    }

    #[tokio::test]
    async fn unqualified_duplicate_tag_is_ambiguous() {
        let vc = FakeVcenter::new();
        let dc = vc.vim.datacenter("DC1");
        vc.vim.vm(&dc.vm_folder, "web");
        let a = vc.rest.add_category("a", "SINGLE", &[]);
        let b = vc.rest.add_category("b", "SINGLE", &[]);
        vc.rest.add_tag(&a, "prod");
        vc.rest.add_tag(&b, "prod");
        let result = vc
            .run(
                "tag_manager",
                json!({"object_name": "web", "object_type": "VirtualMachine", "tag_names": ["prod"]}),
                false,
            )
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Ambiguous));
    }
}
