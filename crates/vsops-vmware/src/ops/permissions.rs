//! Roles, entity permissions and global permissions.

use super::{observe, OpContext, Operation};
use crate::diff::{diff, Comparator, DesiredSpec};
use crate::mob::{invocation_fault, invocation_succeeded};
use crate::props::{as_list, bool_at, i64_at, str_at, string_at, strings_at};
use crate::types::{InventoryKind, MoRef};
use crate::xml::{write_element, SoapObject, SoapValue};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use vsops_core::{Diagnostic, OpResult, VsError, VsResult};

/// MOB object serving global access control lists.
const AUTHORIZATION_SERVICE: &str = "authorizationService";

fn authorization_manager(ctx: &OpContext) -> VsResult<MoRef> {
    ctx.vim()
        .service_content()
        .authorization_manager
        .clone()
        .ok_or_else(|| VsError::protocol("server has no authorization manager"))
}

async fn role_id(ctx: &OpContext, role: &str) -> VsResult<i64> {
    let roles = observe(|| ctx.inventory.list_records(InventoryKind::Role, None)).await?;
    roles
        .iter()
        .find(|r| r.name == role)
        .and_then(|r| r.id.parse().ok())
        .ok_or_else(|| VsError::not_found(format!("role '{role}' not found")))
}

/// Explicit (non-inherited) permission of `principal` on `entity`.
async fn permission_of(ctx: &OpContext, entity: &MoRef, principal: &str) -> VsResult<Option<Value>> {
    let manager = authorization_manager(ctx)?;
    let vim = ctx.vim();
    let perms = observe(|| {
        vim.invoke(
            &manager,
            "RetrieveEntityPermissions",
            vec![("entity", entity.into()), ("inherited", false.into())],
        )
    })
    .await?;
    Ok(as_list(Some(&perms))
        .into_iter()
        .find(|p| str_at(p, "principal") == Some(principal))
        .cloned())
}

fn observed_permission(found: &Option<Value>) -> Map<String, Value> {
    let mut observed = Map::new();
    observed.insert("present".into(), json!(found.is_some()));
    if let Some(p) = found {
        observed.insert("role_id".into(), json!(i64_at(p, "roleId")));
        observed.insert("propagate".into(), json!(bool_at(p, "propagate").unwrap_or(false)));
    }
    observed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Present,
    Absent,
}

fn default_presence() -> Presence {
    Presence::Present
}

fn yes() -> bool {
    true
}

// ── role_info ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RoleInfo {}

#[async_trait]
impl Operation for RoleInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let mut roles = observe(|| ctx.inventory.list_records(InventoryKind::Role, None)).await?;
        roles.sort_by_key(|r| i64_at(&r.record, "roleId"));
        let rows: Vec<Value> = roles
            .iter()
            .map(|r| {
                let mut privileges = strings_at(&r.record, "privilege");
                privileges.sort();
                json!({
                    "role_id": i64_at(&r.record, "roleId"),
                    "role_name": r.name,
                    "role_system": bool_at(&r.record, "system").unwrap_or(false),
                    "role_info_label": string_at(&r.record, "info.label"),
                    "role_info_summary": string_at(&r.record, "info.summary"),
                    "role_privileges": privileges,
                })
            })
            .collect();
        Ok(OpResult::unchanged().with_data("role_info", rows))
    }
}

// ── object_role_permission ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ObjectRolePermission {
    #[serde(alias = "principal")]
    pub principal_name: String,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub role: Option<String>,
    /// Entity name; `rootFolder` addresses the inventory root.
    pub object_name: String,
    #[serde(default = "default_object_type")]
    pub object_type: String,
    #[serde(default = "yes")]
    pub propagate: bool,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

fn default_object_type() -> String {
    "Folder".to_string()
}

impl ObjectRolePermission {
    async fn entity(&self, ctx: &OpContext) -> VsResult<MoRef> {
        if self.object_name == "rootFolder" {
            return Ok(ctx.vim().service_content().root_folder.clone());
        }
        let kind = InventoryKind::from_vim_type(&self.object_type)
            .ok_or_else(|| VsError::protocol(format!("unsupported object_type '{}'", self.object_type)))?;
        ctx.inventory
            .require_by_name(kind, &self.object_name, None)
            .await?
            .require_moref()
    }
}

#[async_trait]
impl Operation for ObjectRolePermission {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let entity = self.entity(ctx).await?;
        let found = permission_of(ctx, &entity, &self.principal_name).await?;
        let observed = observed_permission(&found);

        let mut desired = DesiredSpec::new().set("present", self.state == Presence::Present, Comparator::Scalar);
        let mut role = None;
        if self.state == Presence::Present {
            let name = self
                .role
                .as_deref()
                .ok_or_else(|| VsError::config_missing("role is required when state is present"))?;
            let id = role_id(ctx, name).await?;
            role = Some(id);
            desired = desired
                .set("role_id", id, Comparator::Scalar)
                .set("propagate", self.propagate, Comparator::Scalar);
        }
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        let manager = authorization_manager(ctx)?;
        let vim = ctx.vim();
        let target = entity.clone();
        let principal = self.principal_name.clone();
        let (group, propagate, state) = (self.group, self.propagate, self.state);
        let outcome = rec
            .apply(&entity.value, changes, |_| async move {
                match (state, role) {
                    (Presence::Present, Some(role_id)) => {
                        let permission = SoapObject::typed("Permission")
                            .field("principal", principal.as_str())
                            .field("group", group)
                            .field("roleId", role_id)
                            .field("propagate", propagate);
                        vim.invoke(
                            &manager,
                            "SetEntityPermissions",
                            vec![("entity", (&target).into()), ("permission", vec![permission].into())],
                        )
                        .await?;
                    }
                    _ => {
                        vim.invoke(
                            &manager,
                            "RemoveEntityPermission",
                            vec![
                                ("entity", (&target).into()),
                                ("user", principal.as_str().into()),
                                ("isGroup", group.into()),
                            ],
                        )
                        .await?;
                    }
                }
                Ok(())
            })
            .await;

        let current = if outcome.is_applied() {
            permission_of(ctx, &entity, &self.principal_name).await?
        } else {
            found
        };
        let mut result = rec.finish();
        result.insert(
            "permission",
            json!({
                "entity": entity.value,
                "principal": self.principal_name,
                "role_id": current.as_ref().and_then(|p| i64_at(p, "roleId")),
                "propagate": current.as_ref().and_then(|p| bool_at(p, "propagate")),
            }),
        );
        Ok(result)
    }
}

// ── global_permission ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GlobalPermission {
    #[serde(alias = "principal")]
    pub principal_name: String,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default = "yes")]
    pub propagate: bool,
    #[serde(default = "default_presence")]
    pub state: Presence,
}

fn principal_xml(principal: &str, group: bool) -> SoapObject {
    SoapObject::new().field("name", principal).field("group", group)
}

/// Post one form to the MOB and turn its HTML answer into a result.
async fn post_acl(ctx: &OpContext, method: &str, field: &str, value: SoapValue) -> VsResult<()> {
    let mut body = String::new();
    write_element(&mut body, field, &value);
    let html = ctx
        .mob()
        .invoke_form(AUTHORIZATION_SERVICE, &format!("AuthorizationService.{method}"), &[(field, body)])
        .await?;
    if invocation_succeeded(&html) {
        return Ok(());
    }
    match invocation_fault(&html) {
        Some(fault) => Err(VsError::server_fault(format!("{method} failed: {fault}"))),
        None => Err(VsError::protocol(format!("{method}: unrecognized response page"))),
    }
}

#[async_trait]
impl Operation for GlobalPermission {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let root = ctx.vim().service_content().root_folder.clone();
        let found = permission_of(ctx, &root, &self.principal_name).await?;
        let observed = observed_permission(&found);

        let mut desired = DesiredSpec::new().set("present", self.state == Presence::Present, Comparator::Scalar);
        let mut role = None;
        if self.state == Presence::Present {
            let name = self
                .role
                .as_deref()
                .ok_or_else(|| VsError::config_missing("role is required when state is present"))?;
            let id = role_id(ctx, name).await?;
            role = Some(id);
            desired = desired
                .set("role_id", id, Comparator::Scalar)
                .set("propagate", self.propagate, Comparator::Scalar);
        }
        let changes = diff(&observed, &desired);

        let mut rec = ctx.reconciler();
        rec.diagnose(Diagnostic::warn(
            "global permissions are changed through the managed object browser; success is read from its HTML response",
        ));
        let principal = self.principal_name.clone();
        let (group, propagate, state) = (self.group, self.propagate, self.state);
        rec.apply(&self.principal_name, changes, |_| async move {
            match (state, role) {
                (Presence::Present, Some(role_id)) => {
                    let acl = SoapObject::new()
                        .field("principal", principal_xml(&principal, group))
                        .field("roles", role_id)
                        .field("propagate", propagate);
                    post_acl(ctx, "AddGlobalAccessControlList", "permissions", acl.into()).await
                }
                _ => {
                    let who = principal_xml(&principal, group);
                    post_acl(ctx, "RemoveGlobalAccessControlList", "principals", who.into()).await
                }
            }
        })
        .await;

        let mut result = rec.finish();
        result.insert(
            "global_permission",
            json!({
                "principal": self.principal_name,
                "role": self.role,
                "state": match self.state {
                    Presence::Present => "present",
                    Presence::Absent => "absent",
                },
            }),
        );
        Ok(result)
    }
}
