//! Shared types for the vSphere core: managed-object references, inventory
//! handles and paths, service content, property-collector records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use vsops_core::{VsError, VsResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Managed object reference
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A SOAP managed-object reference: server type name plus MOID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MoRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl MoRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Decode from the `{"type": .., "value": ..}` shape produced by the XML decoder.
    pub fn from_value(v: &Value) -> Option<Self> {
        let kind = v.get("type")?.as_str()?;
        let value = v.get("value")?.as_str()?;
        Some(Self::new(kind, value))
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({ "type": self.kind, "value": self.value })
    }
}

impl fmt::Display for MoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Whether server type `actual` is `wanted` or one of its subtypes.
pub fn is_a(actual: &str, wanted: &str) -> bool {
    if actual == wanted {
        return true;
    }
    matches!(
        (wanted, actual),
        ("ComputeResource", "ClusterComputeResource")
            | ("Folder", "StoragePod")
            | ("Network", "DistributedVirtualPortgroup")
            | ("Network", "OpaqueNetwork")
            | ("DistributedVirtualSwitch", "VmwareDistributedVirtualSwitch")
            | ("ResourcePool", "VirtualApp")
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Inventory handles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed set of entity classes the core can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InventoryKind {
    Datacenter,
    Folder,
    Cluster,
    Host,
    ResourcePool,
    VirtualMachine,
    Datastore,
    DatastoreCluster,
    Network,
    DistributedSwitch,
    DistributedPortgroup,
    ContentLibrary,
    ContentLibraryItem,
    Tag,
    TagCategory,
    CustomFieldDefinition,
    FirstClassDisk,
    Extension,
    Role,
}

impl InventoryKind {
    /// Managed-object type used for container views, or `None` for entities
    /// that live behind REST or a manager object.
    pub fn vim_type(&self) -> Option<&'static str> {
        Some(match self {
            Self::Datacenter => "Datacenter",
            Self::Folder => "Folder",
            Self::Cluster => "ClusterComputeResource",
            Self::Host => "HostSystem",
            Self::ResourcePool => "ResourcePool",
            Self::VirtualMachine => "VirtualMachine",
            Self::Datastore => "Datastore",
            Self::DatastoreCluster => "StoragePod",
            Self::Network => "Network",
            Self::DistributedSwitch => "DistributedVirtualSwitch",
            Self::DistributedPortgroup => "DistributedVirtualPortgroup",
            _ => return None,
        })
    }

    /// Whether a server object of type `actual` belongs to this kind.
    pub fn matches_vim_type(&self, actual: &str) -> bool {
        match self {
            // A storage pod is a folder subtype but is addressed as its own kind.
            Self::Folder => actual == "Folder",
            _ => self.vim_type().map(|t| is_a(actual, t)).unwrap_or(false),
        }
    }

    pub fn from_vim_type(actual: &str) -> Option<Self> {
        Self::VIM_KINDS
            .iter()
            .copied()
            .find(|k| k.matches_vim_type(actual))
    }

    const VIM_KINDS: [InventoryKind; 11] = [
        Self::Datacenter,
        Self::Folder,
        Self::Cluster,
        Self::Host,
        Self::ResourcePool,
        Self::VirtualMachine,
        Self::Datastore,
        Self::DatastoreCluster,
        Self::DistributedPortgroup,
        Self::Network,
        Self::DistributedSwitch,
    ];
}

impl fmt::Display for InventoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Stable, opaque reference to one inventory entity.
///
/// Equality and hashing use the identifier only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryHandle {
    pub kind: InventoryKind,
    pub id: String,
    /// Concrete server type for SOAP-resident entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vim_type: Option<String>,
}

impl InventoryHandle {
    pub fn from_moref(kind: InventoryKind, moref: &MoRef) -> Self {
        Self {
            kind,
            id: moref.value.clone(),
            vim_type: Some(moref.kind.clone()),
        }
    }

    /// Handle for an entity addressed by a non-SOAP identifier.
    pub fn opaque(kind: InventoryKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            vim_type: None,
        }
    }

    pub fn moref(&self) -> Option<MoRef> {
        self.vim_type
            .as_ref()
            .map(|t| MoRef::new(t.clone(), self.id.clone()))
    }

    pub fn require_moref(&self) -> VsResult<MoRef> {
        self.moref().ok_or_else(|| {
            VsError::protocol(format!("{} '{}' is not a managed object", self.kind, self.id))
        })
    }
}

impl PartialEq for InventoryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for InventoryHandle {}

impl Hash for InventoryHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Which identifier a by-id lookup uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Moid,
    BiosUuid,
    InstanceUuid,
}

/// Selector for lookups that document the duplicate-name ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSelector {
    /// Fail with `Ambiguous` when several entities match without a scope.
    #[default]
    Unique,
    First,
    Last,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Inventory paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Well-known datacenter root folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderClass {
    Vm,
    Host,
    Network,
    Datastore,
}

impl FolderClass {
    pub fn datacenter_property(&self) -> &'static str {
        match self {
            Self::Vm => "vmFolder",
            Self::Host => "hostFolder",
            Self::Network => "networkFolder",
            Self::Datastore => "datastoreFolder",
        }
    }

    pub fn segment(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Host => "host",
            Self::Network => "network",
            Self::Datastore => "datastore",
        }
    }
}

/// Case-sensitive sequence of names from the root folder down.
///
/// Empty segments (leading, trailing or doubled separators) are dropped, so
/// `"DC1/vm/apps/"` and `"/DC1/vm/apps"` are the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InventoryPath {
    segments: Vec<String>,
}

impl InventoryPath {
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Path to a folder under a datacenter's well-known root folder.
    pub fn under(datacenter: &str, class: FolderClass, folder: &str) -> Self {
        let mut path = Self::parse(datacenter).child(class.segment());
        path.segments.extend(Self::parse(folder).segments);
        path
    }

    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for InventoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl FromStr for InventoryPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Service content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The subset of `ServiceContent` the core uses.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceContent {
    pub root_folder: MoRef,
    pub property_collector: MoRef,
    pub view_manager: MoRef,
    pub session_manager: MoRef,
    pub search_index: MoRef,
    pub custom_fields_manager: Option<MoRef>,
    pub authorization_manager: Option<MoRef>,
    pub extension_manager: Option<MoRef>,
    pub vstorage_object_manager: Option<MoRef>,
    /// `VirtualCenter` or `HostAgent`
    pub api_type: String,
    pub api_version: String,
}

impl ServiceContent {
    pub fn from_value(v: &Value) -> VsResult<Self> {
        let required = |name: &str| {
            v.get(name).and_then(MoRef::from_value).ok_or_else(|| {
                VsError::protocol(format!("ServiceContent is missing '{name}'"))
            })
        };
        let optional = |name: &str| v.get(name).and_then(MoRef::from_value);
        let about = v.get("about");
        let about_str = |name: &str| {
            about
                .and_then(|a| a.get(name))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self {
            root_folder: required("rootFolder")?,
            property_collector: required("propertyCollector")?,
            view_manager: required("viewManager")?,
            session_manager: required("sessionManager")?,
            search_index: required("searchIndex")?,
            custom_fields_manager: optional("customFieldsManager"),
            authorization_manager: optional("authorizationManager"),
            extension_manager: optional("extensionManager"),
            vstorage_object_manager: optional("vStorageObjectManager"),
            api_type: about_str("apiType"),
            api_version: about_str("apiVersion"),
        })
    }

    pub fn is_vcenter(&self) -> bool {
        self.api_type == "VirtualCenter"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Property collector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which objects a retrieval starts from.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrieveTarget {
    /// Exactly these objects.
    Objects(Vec<MoRef>),
    /// Every object listed by a container view.
    View(MoRef),
}

/// Properties to read for one server type (subtypes included).
#[derive(Debug, Clone, PartialEq)]
pub struct PropSpec {
    pub vim_type: String,
    pub paths: Vec<String>,
}

impl PropSpec {
    pub fn new(vim_type: impl Into<String>, paths: &[&str]) -> Self {
        Self {
            vim_type: vim_type.into(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// One batched property-collector request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveSpec {
    pub target: RetrieveTarget,
    pub props: Vec<PropSpec>,
}

impl RetrieveSpec {
    pub fn objects(objs: Vec<MoRef>, vim_type: &str, paths: &[&str]) -> Self {
        Self {
            target: RetrieveTarget::Objects(objs),
            props: vec![PropSpec::new(vim_type, paths)],
        }
    }

    pub fn view(view: MoRef, props: Vec<PropSpec>) -> Self {
        Self {
            target: RetrieveTarget::View(view),
            props,
        }
    }
}

/// A property the server could not read for an object.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingProperty {
    pub path: String,
    pub fault: String,
}

/// Properties returned for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectContent {
    pub obj: MoRef,
    pub props: BTreeMap<String, Value>,
    pub missing: Vec<MissingProperty>,
}

impl ObjectContent {
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.props.get(path)
    }

    pub fn name(&self) -> Option<&str> {
        self.props.get("name").and_then(Value::as_str)
    }
}
