//! Inventory index: resolves names, identifiers and paths to
//! [`InventoryHandle`]s and reads properties in batches.
//!
//! Name lookups load the containment graph once through a container view
//! and walk it depth-first from the root folder. Children are visited in the
//! order the server lists them; only containment edges are followed, never
//! `parent`, and every visited object is recorded so a malformed graph cannot
//! loop.

use crate::api::{RestApi, VimApi};
use crate::props::{as_list, bool_at, str_at, string_at};
use crate::types::{
    is_a, IdKind, InventoryHandle, InventoryKind, InventoryPath, MoRef, NameSelector,
    ObjectContent, PropSpec, RetrieveSpec,
};
use crate::xml::SoapValue;

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vsops_core::{ErrorKind, VsError, VsResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Container views
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A server-side container view. Call [`ContainerView::destroy`] when done;
/// a view dropped without it (error or cancel path) is destroyed from a
/// spawned task.
pub struct ContainerView {
    vim: Arc<dyn VimApi>,
    view: MoRef,
    destroyed: bool,
}

impl ContainerView {
    pub async fn create(
        vim: Arc<dyn VimApi>,
        container: &MoRef,
        types: &[&str],
        recursive: bool,
    ) -> VsResult<Self> {
        let manager = vim.service_content().view_manager.clone();
        let types: Vec<SoapValue> = types.iter().map(|t| SoapValue::from(*t)).collect();
        let raw = vim
            .invoke(
                &manager,
                "CreateContainerView",
                vec![
                    ("container", container.into()),
                    ("type", SoapValue::List(types)),
                    ("recursive", recursive.into()),
                ],
            )
            .await?;
        let view = MoRef::from_value(&raw)
            .ok_or_else(|| VsError::protocol("CreateContainerView returned no view"))?;
        tracing::debug!(view = %view, container = %container, "container view created");
        Ok(Self {
            vim,
            view,
            destroyed: false,
        })
    }

    pub fn moref(&self) -> &MoRef {
        &self.view
    }

    pub async fn destroy(mut self) -> VsResult<()> {
        self.destroyed = true;
        self.vim.invoke(&self.view, "DestroyView", vec![]).await.map(|_| ())
    }
}

impl Drop for ContainerView {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        tracing::warn!(view = %self.view, "container view dropped before destroy");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let vim = self.vim.clone();
            let view = self.view.clone();
            handle.spawn(async move {
                if let Err(e) = vim.invoke(&view, "DestroyView", vec![]).await {
                    tracing::warn!(view = %view, error = %e, "deferred DestroyView failed");
                }
            });
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Containment graph
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Containment edges per server type, in visiting order.
fn child_edges(vim_type: &str) -> &'static [&'static str] {
    if is_a(vim_type, "Folder") {
        &["childEntity"]
    } else if vim_type == "Datacenter" {
        &["vmFolder", "hostFolder", "datastoreFolder", "networkFolder"]
    } else if is_a(vim_type, "ComputeResource") {
        &["host", "resourcePool"]
    } else if is_a(vim_type, "ResourcePool") {
        &["resourcePool", "vm"]
    } else {
        &[]
    }
}

const CONTAINER_TYPES: [&str; 4] = ["Folder", "Datacenter", "ComputeResource", "ResourcePool"];

struct GraphNode {
    name: String,
    children: Vec<MoRef>,
}

struct Graph {
    root: MoRef,
    nodes: HashMap<MoRef, GraphNode>,
}

impl Graph {
    /// Pre-order walk below `start` (exclusive). `base` is the path of `start`.
    fn walk_from(&self, start: &MoRef, base: &InventoryPath) -> Vec<(MoRef, InventoryPath)> {
        let mut out = Vec::new();
        let mut visited: HashSet<MoRef> = HashSet::new();
        visited.insert(start.clone());
        let mut stack: Vec<(MoRef, InventoryPath)> = Vec::new();
        if let Some(node) = self.nodes.get(start) {
            for child in node.children.iter().rev() {
                stack.push((child.clone(), base.clone()));
            }
        }
        while let Some((current, parent_path)) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let node = match self.nodes.get(&current) {
                Some(n) => n,
                None => continue,
            };
            let path = parent_path.child(&node.name);
            for child in node.children.iter().rev() {
                stack.push((child.clone(), path.clone()));
            }
            out.push((current, path));
        }
        out
    }

    fn walk(&self) -> Vec<(MoRef, InventoryPath)> {
        self.walk_from(&self.root, &InventoryPath::default())
    }

    fn child_named(&self, parent: &MoRef, name: &str) -> Option<&MoRef> {
        self.nodes.get(parent)?.children.iter().find(|c| {
            self.nodes
                .get(c)
                .map(|n| unescape_name(&n.name) == name)
                .unwrap_or(false)
        })
    }
}

/// vSphere escapes `/`, `\` and `%` in entity names.
pub fn unescape_name(name: &str) -> String {
    name.replace("%2f", "/")
        .replace("%2F", "/")
        .replace("%5c", "\\")
        .replace("%5C", "\\")
        .replace("%25", "%")
}

fn refs(oc: &ObjectContent, key: &str) -> Vec<MoRef> {
    as_list(oc.get(key))
        .into_iter()
        .filter_map(MoRef::from_value)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Snapshots
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One snapshot in a flattened tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub moid: String,
    pub name: String,
    pub description: String,
    pub creation_time: String,
    pub state: String,
    pub quiesced: bool,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SnapshotTree {
    /// Pre-order.
    pub snapshots: Vec<SnapshotRecord>,
    pub current: Option<SnapshotRecord>,
}

fn flatten_snapshots(nodes: Vec<&Value>, depth: usize, out: &mut Vec<SnapshotRecord>) {
    for node in nodes {
        out.push(SnapshotRecord {
            id: crate::props::i64_at(node, "id").unwrap_or_default(),
            moid: str_at(node, "snapshot.value").unwrap_or_default().to_string(),
            name: string_at(node, "name"),
            description: string_at(node, "description"),
            creation_time: string_at(node, "createTime"),
            state: string_at(node, "state"),
            quiesced: bool_at(node, "quiesced").unwrap_or(false),
            depth,
        });
        flatten_snapshots(as_list(node.get("childSnapshotList")), depth + 1, out);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inventory lookups over the session's SOAP and REST channels.
pub struct Inventory {
    vim: Arc<dyn VimApi>,
    rest: Arc<dyn RestApi>,
}

impl Inventory {
    pub fn new(vim: Arc<dyn VimApi>, rest: Arc<dyn RestApi>) -> Self {
        Self { vim, rest }
    }

    pub fn vim(&self) -> &Arc<dyn VimApi> {
        &self.vim
    }

    pub fn rest(&self) -> &Arc<dyn RestApi> {
        &self.rest
    }

    fn root(&self) -> MoRef {
        self.vim.service_content().root_folder.clone()
    }

    // ── Name lookup ─────────────────────────────────────────────────

    /// Resolve `name` to one entity of `kind`.
    ///
    /// Without a scope, several matches fail with `Ambiguous` listing every
    /// match's path. With a scope, the first match in traversal order wins.
    /// An empty name resolves to `None`.
    pub async fn find_by_name(
        &self,
        kind: InventoryKind,
        name: &str,
        scope: Option<&InventoryHandle>,
    ) -> VsResult<Option<InventoryHandle>> {
        self.find_by_name_selecting(kind, name, scope, NameSelector::Unique)
            .await
    }

    /// [`find_by_name`](Self::find_by_name) with an explicit tie-break for
    /// operations that document the duplicate-name ambiguity.
    pub async fn find_by_name_selecting(
        &self,
        kind: InventoryKind,
        name: &str,
        scope: Option<&InventoryHandle>,
        selector: NameSelector,
    ) -> VsResult<Option<InventoryHandle>> {
        if name.is_empty() {
            return Ok(None);
        }
        let matches = self.matches_by_name(kind, name, scope).await?;
        if scope.is_some() {
            return Ok(matches.into_iter().next().map(|(h, _)| h));
        }
        match (matches.len(), selector) {
            (0, _) => Ok(None),
            (1, _) | (_, NameSelector::First) => Ok(matches.into_iter().next().map(|(h, _)| h)),
            (_, NameSelector::Last) => Ok(matches.into_iter().last().map(|(h, _)| h)),
            (n, NameSelector::Unique) => Err(VsError::ambiguous(
                format!("{n} {kind} objects are named '{name}'; narrow the lookup with a scope"),
                matches.into_iter().map(|(_, p)| p).collect(),
            )),
        }
    }

    /// Like [`find_by_name`](Self::find_by_name), but `None` becomes `NotFound`.
    pub async fn require_by_name(
        &self,
        kind: InventoryKind,
        name: &str,
        scope: Option<&InventoryHandle>,
    ) -> VsResult<InventoryHandle> {
        self.find_by_name(kind, name, scope)
            .await?
            .ok_or_else(|| VsError::not_found(format!("{kind} '{name}' not found")))
    }

    async fn matches_by_name(
        &self,
        kind: InventoryKind,
        name: &str,
        scope: Option<&InventoryHandle>,
    ) -> VsResult<Vec<(InventoryHandle, String)>> {
        if kind.vim_type().is_none() {
            return self.named_non_vim(kind, name, scope).await;
        }
        let graph = self.load_graph(kind).await?;
        let all = graph.walk();
        let walked = match scope {
            None => all,
            Some(scope) => {
                let scope_ref = scope.require_moref()?;
                let base = all
                    .iter()
                    .find(|(r, _)| r.value == scope_ref.value)
                    .map(|(_, p)| p.clone())
                    .ok_or_else(|| {
                        VsError::not_found(format!("scope {} '{}' not found", scope.kind, scope.id))
                    })?;
                let start = graph
                    .nodes
                    .keys()
                    .find(|r| r.value == scope_ref.value)
                    .cloned()
                    .unwrap_or(scope_ref);
                graph.walk_from(&start, &base)
            }
        };
        Ok(walked
            .into_iter()
            .filter(|(r, _)| kind.matches_vim_type(&r.kind))
            .filter(|(r, _)| {
                graph
                    .nodes
                    .get(r)
                    .map(|n| unescape_name(&n.name) == name)
                    .unwrap_or(false)
            })
            .map(|(r, p)| (InventoryHandle::from_moref(kind, &r), p.to_string()))
            .collect())
    }

    async fn load_graph(&self, target: InventoryKind) -> VsResult<Graph> {
        let root = self.root();
        let mut props: Vec<PropSpec> = vec![
            PropSpec::new("Folder", &["name", "childEntity"]),
            PropSpec::new(
                "Datacenter",
                &["name", "vmFolder", "hostFolder", "datastoreFolder", "networkFolder"],
            ),
            PropSpec::new("ComputeResource", &["name", "host", "resourcePool"]),
            PropSpec::new("ResourcePool", &["name", "resourcePool", "vm"]),
        ];
        let mut types: Vec<&str> = CONTAINER_TYPES.to_vec();
        if let Some(t) = target.vim_type() {
            if !CONTAINER_TYPES.iter().any(|c| is_a(t, c)) {
                props.push(PropSpec::new(t, &["name"]));
                types.push(t);
            }
        }

        let contents = self.view_contents(&root, &types, props).await?;
        let root_children = self
            .vim
            .retrieve(&RetrieveSpec::objects(vec![root.clone()], "Folder", &["childEntity"]))
            .await?;

        let mut nodes = HashMap::new();
        for oc in &contents {
            let children = child_edges(&oc.obj.kind)
                .iter()
                .flat_map(|edge| refs(oc, edge))
                .collect();
            nodes.insert(
                oc.obj.clone(),
                GraphNode {
                    name: oc.name().unwrap_or_default().to_string(),
                    children,
                },
            );
        }
        let root_node = GraphNode {
            name: String::new(),
            children: root_children
                .first()
                .map(|oc| refs(oc, "childEntity"))
                .unwrap_or_default(),
        };
        nodes.insert(root.clone(), root_node);
        Ok(Graph { root, nodes })
    }

    // ── Identifier lookup ───────────────────────────────────────────

    /// Resolve by MOID, BIOS UUID or instance UUID. UUID lookups apply to
    /// virtual machines (both kinds) and hosts (BIOS UUID only).
    pub async fn find_by_id(
        &self,
        kind: InventoryKind,
        id: &str,
        id_kind: IdKind,
    ) -> VsResult<Option<InventoryHandle>> {
        if id.is_empty() {
            return Ok(None);
        }
        match id_kind {
            IdKind::Moid => self.find_by_moid(kind, id).await,
            IdKind::BiosUuid | IdKind::InstanceUuid => {
                let vm_search = match kind {
                    InventoryKind::VirtualMachine => true,
                    InventoryKind::Host if id_kind == IdKind::BiosUuid => false,
                    _ => {
                        return Err(VsError::protocol(format!(
                            "{kind} cannot be looked up by {id_kind:?}"
                        )))
                    }
                };
                let index = self.vim.service_content().search_index.clone();
                let raw = self
                    .vim
                    .invoke(
                        &index,
                        "FindAllByUuid",
                        vec![
                            ("uuid", id.into()),
                            ("vmSearch", vm_search.into()),
                            ("instanceUuid", (id_kind == IdKind::InstanceUuid).into()),
                        ],
                    )
                    .await?;
                let found: Vec<MoRef> = as_list(Some(&raw))
                    .into_iter()
                    .filter_map(MoRef::from_value)
                    .collect();
                match found.len() {
                    0 => Ok(None),
                    1 => Ok(Some(InventoryHandle::from_moref(kind, &found[0]))),
                    n => {
                        let mut paths = Vec::with_capacity(n);
                        for r in &found {
                            paths.push(self.path_of(r).await?.to_string());
                        }
                        Err(VsError::ambiguous(
                            format!("{n} {kind} objects share {id_kind:?} '{id}'"),
                            paths,
                        ))
                    }
                }
            }
        }
    }

    async fn find_by_moid(&self, kind: InventoryKind, id: &str) -> VsResult<Option<InventoryHandle>> {
        match kind {
            InventoryKind::Tag => self.rest_get_opt(kind, &format!("/api/cis/tagging/tag/{id}")).await,
            InventoryKind::TagCategory => {
                self.rest_get_opt(kind, &format!("/api/cis/tagging/category/{id}")).await
            }
            InventoryKind::ContentLibrary => {
                self.rest_get_opt(kind, &format!("/api/content/library/{id}")).await
            }
            InventoryKind::ContentLibraryItem => {
                self.rest_get_opt(kind, &format!("/api/content/library/item/{id}")).await
            }
            _ => {
                let vim_type = match kind.vim_type() {
                    Some(t) => t,
                    None => {
                        return Err(VsError::protocol(format!("{kind} has no identifier lookup")))
                    }
                };
                let moref = MoRef::new(vim_type, id);
                match self
                    .vim
                    .retrieve(&RetrieveSpec::objects(vec![moref.clone()], vim_type, &["name"]))
                    .await
                {
                    Ok(found) => Ok(found
                        .first()
                        .map(|oc| InventoryHandle::from_moref(kind, &oc.obj))),
                    Err(e) if e.fault_code() == Some("ManagedObjectNotFound") => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn rest_get_opt(&self, kind: InventoryKind, path: &str) -> VsResult<Option<InventoryHandle>> {
        match self.rest.get(path).await {
            Ok(v) => Ok(v
                .get("id")
                .and_then(Value::as_str)
                .map(|id| InventoryHandle::opaque(kind, id))),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Path lookup ─────────────────────────────────────────────────

    /// Resolve an inventory path such as `/DC1/vm/prod/web01`.
    pub async fn find_by_path(
        &self,
        kind: InventoryKind,
        path: &InventoryPath,
    ) -> VsResult<Option<InventoryHandle>> {
        if path.is_empty() {
            return Ok(None);
        }
        let graph = self.load_graph(kind).await?;
        let mut current = graph.root.clone();
        for segment in path.segments() {
            current = match graph.child_named(&current, segment) {
                Some(next) => next.clone(),
                None => return Ok(None),
            };
        }
        if kind.matches_vim_type(&current.kind) {
            Ok(Some(InventoryHandle::from_moref(kind, &current)))
        } else {
            Ok(None)
        }
    }

    /// Path of a managed object, built by following `parent` upward.
    pub async fn path_of(&self, moref: &MoRef) -> VsResult<InventoryPath> {
        let root = self.root();
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut current = moref.clone();
        while current != root && seen.insert(current.clone()) {
            let found = self
                .vim
                .retrieve(&RetrieveSpec::objects(
                    vec![current.clone()],
                    &current.kind,
                    &["name", "parent"],
                ))
                .await?;
            let oc = match found.into_iter().next() {
                Some(oc) => oc,
                None => break,
            };
            names.push(oc.name().unwrap_or_default().to_string());
            current = match oc.get("parent").and_then(MoRef::from_value) {
                Some(p) => p,
                None => break,
            };
        }
        names.reverse();
        Ok(InventoryPath::parse(&names.join("/")))
    }

    /// Nearest ancestor of `moref` (itself included) with server type `vim_type`.
    pub async fn ancestor_of(&self, moref: &MoRef, vim_type: &str) -> VsResult<Option<MoRef>> {
        let mut seen = HashSet::new();
        let mut current = moref.clone();
        loop {
            if is_a(&current.kind, vim_type) {
                return Ok(Some(current));
            }
            if !seen.insert(current.clone()) {
                return Ok(None);
            }
            let found = self
                .vim
                .retrieve(&RetrieveSpec::objects(vec![current.clone()], &current.kind, &["parent"]))
                .await?;
            current = match found.first().and_then(|oc| oc.get("parent")).and_then(MoRef::from_value) {
                Some(p) => p,
                None => return Ok(None),
            };
        }
    }

    // ── Properties ──────────────────────────────────────────────────

    /// Read `keys` of one entity in a single property-collector call.
    ///
    /// An entity that vanished mid-call yields `Transient`; keys the server
    /// could not read are absent from the map.
    pub async fn get_properties(
        &self,
        handle: &InventoryHandle,
        keys: &[&str],
    ) -> VsResult<Map<String, Value>> {
        let moref = handle.require_moref()?;
        let found = self
            .vim
            .retrieve(&RetrieveSpec::objects(vec![moref.clone()], &moref.kind, keys))
            .await?;
        let oc = found.into_iter().next().ok_or_else(|| {
            VsError::transient(format!("{} '{}' vanished during property retrieval", handle.kind, handle.id))
                .with_details(serde_json::json!({ "fault": "ManagedObjectNotFound" }))
        })?;
        if let Some(m) = oc.missing.iter().find(|m| m.fault == "ManagedObjectNotFound") {
            return Err(VsError::transient(format!(
                "{} '{}' vanished while reading '{}'",
                handle.kind, handle.id, m.path
            )));
        }
        Ok(oc.props.into_iter().collect())
    }

    /// Names of many objects of mixed types, in one call.
    pub async fn names_of(&self, objects: &[MoRef]) -> VsResult<HashMap<MoRef, String>> {
        if objects.is_empty() {
            return Ok(HashMap::new());
        }
        let mut types: Vec<&str> = objects.iter().map(|o| o.kind.as_str()).collect();
        types.sort_unstable();
        types.dedup();
        let spec = RetrieveSpec {
            target: crate::types::RetrieveTarget::Objects(objects.to_vec()),
            props: types.into_iter().map(|t| PropSpec::new(t, &["name"])).collect(),
        };
        Ok(self
            .vim
            .retrieve(&spec)
            .await?
            .into_iter()
            .map(|oc| {
                let name = oc.name().unwrap_or_default().to_string();
                (oc.obj, name)
            })
            .collect())
    }

    // ── Listing ─────────────────────────────────────────────────────

    /// Direct children of a container, optionally filtered by kind.
    pub async fn list_children(
        &self,
        handle: &InventoryHandle,
        type_filter: Option<InventoryKind>,
    ) -> VsResult<Vec<InventoryHandle>> {
        let moref = handle.require_moref()?;
        let edges = child_edges(&moref.kind);
        if edges.is_empty() {
            return Ok(Vec::new());
        }
        let found = self
            .vim
            .retrieve(&RetrieveSpec::objects(vec![moref.clone()], &moref.kind, edges))
            .await?;
        let oc = match found.into_iter().next() {
            Some(oc) => oc,
            None => return Ok(Vec::new()),
        };
        Ok(edges
            .iter()
            .flat_map(|edge| refs(&oc, edge))
            .filter_map(|r| {
                let kind = match type_filter {
                    Some(k) if k.matches_vim_type(&r.kind) => k,
                    Some(_) => return None,
                    None => InventoryKind::from_vim_type(&r.kind)?,
                };
                Some(InventoryHandle::from_moref(kind, &r))
            })
            .collect())
    }

    /// Every descendant of `kind` below `handle`, via a container view that is
    /// destroyed before returning.
    pub async fn recursive_descendants(
        &self,
        handle: &InventoryHandle,
        kind: InventoryKind,
    ) -> VsResult<Vec<InventoryHandle>> {
        let vim_type = kind
            .vim_type()
            .ok_or_else(|| VsError::protocol(format!("{kind} is not a managed-object type")))?;
        let container = handle.require_moref()?;
        let contents = self
            .view_contents(&container, &[vim_type], vec![PropSpec::new(vim_type, &["name"])])
            .await?;
        Ok(contents
            .into_iter()
            .filter(|oc| kind.matches_vim_type(&oc.obj.kind))
            .map(|oc| InventoryHandle::from_moref(kind, &oc.obj))
            .collect())
    }

    /// Read `props` for every object of `types` below `container`.
    pub async fn view_contents(
        &self,
        container: &MoRef,
        types: &[&str],
        props: Vec<PropSpec>,
    ) -> VsResult<Vec<ObjectContent>> {
        let view = ContainerView::create(self.vim.clone(), container, types, true).await?;
        let result = self
            .vim
            .retrieve(&RetrieveSpec::view(view.moref().clone(), props))
            .await;
        if let Err(e) = view.destroy().await {
            tracing::warn!(error = %e, "DestroyView failed");
        }
        result
    }

    /// All entities of `kind` in the inventory (or below `scope`), with the
    /// requested properties.
    pub async fn list_all(
        &self,
        kind: InventoryKind,
        scope: Option<&InventoryHandle>,
        keys: &[&str],
    ) -> VsResult<Vec<ObjectContent>> {
        let vim_type = kind
            .vim_type()
            .ok_or_else(|| VsError::protocol(format!("{kind} is not a managed-object type")))?;
        let container = match scope {
            Some(s) => s.require_moref()?,
            None => self.root(),
        };
        let contents = self
            .view_contents(&container, &[vim_type], vec![PropSpec::new(vim_type, keys)])
            .await?;
        Ok(contents
            .into_iter()
            .filter(|oc| kind.matches_vim_type(&oc.obj.kind))
            .collect())
    }

    /// Snapshot tree of a virtual machine, flattened in pre-order.
    pub async fn snapshot_descendants(&self, vm: &InventoryHandle) -> VsResult<SnapshotTree> {
        let props = self.get_properties(vm, &["snapshot"]).await?;
        let info = match props.get("snapshot") {
            Some(v) if !v.is_null() => v,
            _ => return Ok(SnapshotTree::default()),
        };
        let mut snapshots = Vec::new();
        flatten_snapshots(as_list(info.get("rootSnapshotList")), 0, &mut snapshots);
        let current_moid = str_at(info, "currentSnapshot.value");
        let current = current_moid.and_then(|m| snapshots.iter().find(|s| s.moid == m).cloned());
        Ok(SnapshotTree { snapshots, current })
    }

    // ── Non-managed-object kinds ────────────────────────────────────

    async fn named_non_vim(
        &self,
        kind: InventoryKind,
        name: &str,
        scope: Option<&InventoryHandle>,
    ) -> VsResult<Vec<(InventoryHandle, String)>> {
        let records = self.list_records(kind, scope).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.name == name)
            .map(|r| {
                let path = format!("{}/{}", r.container, r.name);
                (InventoryHandle::opaque(kind, r.id), path)
            })
            .collect())
    }

    /// Every entity of a non-managed-object kind, with its name.
    pub async fn list_records(
        &self,
        kind: InventoryKind,
        scope: Option<&InventoryHandle>,
    ) -> VsResult<Vec<NamedRecord>> {
        match kind {
            InventoryKind::TagCategory => {
                let details = self.rest_details("/api/cis/tagging/category", &[], "/api/cis/tagging/category").await?;
                Ok(details.into_iter().map(|d| NamedRecord::from_rest("categories", d)).collect())
            }
            InventoryKind::Tag => {
                let details = self.rest_details("/api/cis/tagging/tag", &[], "/api/cis/tagging/tag").await?;
                Ok(details
                    .into_iter()
                    .filter(|d| match scope {
                        Some(s) => str_at(d, "category_id") == Some(s.id.as_str()),
                        None => true,
                    })
                    .map(|d| {
                        let category = string_at(&d, "category_id");
                        NamedRecord::from_rest(&category, d)
                    })
                    .collect())
            }
            InventoryKind::ContentLibrary => {
                let details = self.rest_details("/api/content/library", &[], "/api/content/library").await?;
                Ok(details.into_iter().map(|d| NamedRecord::from_rest("libraries", d)).collect())
            }
            InventoryKind::ContentLibraryItem => {
                let library = scope.ok_or_else(|| {
                    VsError::protocol("content library items are looked up within a library")
                })?;
                let details = self
                    .rest_details(
                        "/api/content/library/item",
                        &[("library_id", library.id.clone())],
                        "/api/content/library/item",
                    )
                    .await?;
                Ok(details
                    .into_iter()
                    .map(|d| NamedRecord::from_rest(&library.id, d))
                    .collect())
            }
            InventoryKind::CustomFieldDefinition => {
                let manager = self
                    .vim
                    .service_content()
                    .custom_fields_manager
                    .clone()
                    .ok_or_else(|| VsError::protocol("server has no custom fields manager"))?;
                let found = self
                    .vim
                    .retrieve(&RetrieveSpec::objects(vec![manager], "CustomFieldsManager", &["field"]))
                    .await?;
                let fields = found.first().and_then(|oc| oc.get("field").cloned());
                Ok(as_list(fields.as_ref())
                    .into_iter()
                    .map(|f| NamedRecord {
                        id: crate::props::i64_at(f, "key").unwrap_or_default().to_string(),
                        name: string_at(f, "name"),
                        container: str_at(f, "managedObjectType").unwrap_or("global").to_string(),
                        record: f.clone(),
                    })
                    .collect())
            }
            InventoryKind::Role => {
                let manager = self
                    .vim
                    .service_content()
                    .authorization_manager
                    .clone()
                    .ok_or_else(|| VsError::protocol("server has no authorization manager"))?;
                let found = self
                    .vim
                    .retrieve(&RetrieveSpec::objects(vec![manager], "AuthorizationManager", &["roleList"]))
                    .await?;
                let roles = found.first().and_then(|oc| oc.get("roleList").cloned());
                Ok(as_list(roles.as_ref())
                    .into_iter()
                    .map(|r| NamedRecord {
                        id: crate::props::i64_at(r, "roleId").unwrap_or_default().to_string(),
                        name: string_at(r, "name"),
                        container: "roles".to_string(),
                        record: r.clone(),
                    })
                    .collect())
            }
            InventoryKind::Extension => {
                let manager = self
                    .vim
                    .service_content()
                    .extension_manager
                    .clone()
                    .ok_or_else(|| VsError::protocol("server has no extension manager"))?;
                let found = self
                    .vim
                    .retrieve(&RetrieveSpec::objects(vec![manager], "ExtensionManager", &["extensionList"]))
                    .await?;
                let list = found.first().and_then(|oc| oc.get("extensionList").cloned());
                Ok(as_list(list.as_ref())
                    .into_iter()
                    .map(|e| NamedRecord {
                        id: string_at(e, "key"),
                        name: string_at(e, "key"),
                        container: "extensions".to_string(),
                        record: e.clone(),
                    })
                    .collect())
            }
            InventoryKind::FirstClassDisk => {
                let datastore = scope
                    .ok_or_else(|| VsError::protocol("first-class disks are looked up within a datastore"))?
                    .require_moref()?;
                self.list_disks(&datastore).await
            }
            other => Err(VsError::protocol(format!("{other} is a managed-object type"))),
        }
    }

    /// First-class disks on one datastore.
    pub async fn list_disks(&self, datastore: &MoRef) -> VsResult<Vec<NamedRecord>> {
        let manager = self
            .vim
            .service_content()
            .vstorage_object_manager
            .clone()
            .ok_or_else(|| VsError::protocol("server has no VStorageObjectManager"))?;
        let ids = self
            .vim
            .invoke(&manager, "ListVStorageObject", vec![("datastore", datastore.into())])
            .await?;
        let mut out = Vec::new();
        for id in as_list(Some(&ids)) {
            let disk_id = string_at(id, "id");
            let obj = self
                .vim
                .invoke(
                    &manager,
                    "RetrieveVStorageObject",
                    vec![
                        ("id", crate::xml::SoapObject::new().field("id", disk_id.as_str()).into()),
                        ("datastore", datastore.into()),
                    ],
                )
                .await?;
            out.push(NamedRecord {
                id: disk_id,
                name: string_at(&obj, "config.name"),
                container: datastore.value.clone(),
                record: obj,
            });
        }
        Ok(out)
    }

    async fn rest_details(
        &self,
        list_path: &str,
        query: &[(&str, String)],
        item_prefix: &str,
    ) -> VsResult<Vec<Value>> {
        let ids = self
            .rest
            .request(crate::api::HttpMethod::Get, list_path, query, None)
            .await?;
        let mut out = Vec::new();
        for id in as_list(Some(&ids)) {
            if let Some(id) = id.as_str() {
                out.push(self.rest.get(&format!("{item_prefix}/{id}")).await?);
            }
        }
        Ok(out)
    }
}

/// A non-managed-object entity: identifier, name and raw record.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedRecord {
    pub id: String,
    pub name: String,
    /// Category id, library id, datastore moid or a fixed collection label.
    pub container: String,
    pub record: Value,
}

impl NamedRecord {
    fn from_rest(container: &str, record: Value) -> Self {
        Self {
            id: string_at(&record, "id"),
            name: string_at(&record, "name"),
            container: container.to_string(),
            record,
        }
    }
}
