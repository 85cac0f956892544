//! In-memory vCenter for tests.
//!
//! [`FakeVim`] keeps managed objects as flat property maps keyed by the
//! property path the code under test requests, answers property-collector
//! reads (object lists and container views) and implements the methods the
//! operation families call, mutating its own state so idempotence can be
//! checked with two successive runs. [`FakeRest`] does the same for the
//! tagging and content-library services, [`FakeMob`] scripts MOB pages.

use crate::api::{HttpMethod, MobApi, RestApi, VimApi};
use crate::error::from_fault;
use crate::ops::OpContext;
use crate::props::{as_list, i64_at, str_at, string_at};
use crate::session::{Channels, Session};
use crate::task::CancelSignal;
use crate::types::{is_a, MoRef, ObjectContent, RetrieveSpec, RetrieveTarget, ServiceContent};
use crate::xml::SoapValue;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vsops_core::{OpResult, VsError, VsResult};

pub fn task_running(progress: i64) -> Value {
    json!({ "state": "running", "progress": progress, "cancelable": true })
}

pub fn task_success(result: Value) -> Value {
    json!({ "state": "success", "result": result })
}

pub fn task_error(fault: &str, message: &str) -> Value {
    json!({
        "state": "error",
        "error": { "fault": { "_type": fault }, "localizedMessage": message }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Whole server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct FakeVcenter {
    pub vim: Arc<FakeVim>,
    pub rest: Arc<FakeRest>,
    pub mob: Arc<FakeMob>,
}

impl FakeVcenter {
    pub fn new() -> Self {
        Self {
            vim: Arc::new(FakeVim::new()),
            rest: Arc::new(FakeRest::default()),
            mob: Arc::new(FakeMob::default()),
        }
    }

    pub fn session(&self) -> Session {
        Session::from_channels(
            "vc.example:443",
            Channels {
                vim: self.vim.clone(),
                vsan: self.vim.clone(),
                sms: self.vim.clone(),
                rest: self.rest.clone(),
                mob: self.mob.clone(),
            },
        )
    }

    pub fn context(&self, dry_run: bool) -> OpContext {
        OpContext::new(
            Arc::new(self.session()),
            CancelSignal::never(),
            dry_run,
            Duration::from_secs(3600),
        )
    }

    /// Run one operation end to end and close the session.
    pub async fn run(&self, operation: &str, params: Value, dry_run: bool) -> OpResult {
        self.run_with(operation, params, self.context(dry_run)).await
    }

    pub async fn run_with(&self, operation: &str, params: Value, ctx: OpContext) -> OpResult {
        let params = params.as_object().cloned().unwrap_or_default();
        let result = crate::ops::execute(operation, &params, &ctx).await;
        ctx.session().close().await.unwrap();
        result
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  SOAP side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Datacenter plus its four root folders.
#[derive(Debug, Clone)]
pub struct FakeDatacenter {
    pub moref: MoRef,
    pub vm_folder: MoRef,
    pub host_folder: MoRef,
    pub datastore_folder: MoRef,
    pub network_folder: MoRef,
}

type Handler = Arc<dyn Fn(&MoRef, &Map<String, Value>) -> VsResult<Value> + Send + Sync>;

#[derive(Default)]
struct VimState {
    order: Vec<MoRef>,
    objects: HashMap<MoRef, BTreeMap<String, Value>>,
    next_id: u64,
    calls: Vec<(String, MoRef, Map<String, Value>)>,
    views: HashMap<MoRef, (MoRef, Vec<String>)>,
    fail_next_retrieve: Option<VsError>,
    queued_tasks: VecDeque<Vec<Value>>,
    task_infos: HashMap<MoRef, VecDeque<Value>>,
    logouts: usize,
}

impl VimState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn add(&mut self, kind: &str, prefix: &str, props: Vec<(&str, Value)>) -> MoRef {
        let moref = MoRef::new(kind, self.id(prefix));
        self.add_with(moref.clone(), props);
        moref
    }

    fn add_with(&mut self, moref: MoRef, props: Vec<(&str, Value)>) {
        let map = props.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        self.order.push(moref.clone());
        self.objects.insert(moref, map);
    }

    fn get(&self, r: &MoRef, path: &str) -> Option<&Value> {
        self.objects.get(r).and_then(|p| p.get(path))
    }

    fn set(&mut self, r: &MoRef, path: &str, v: Value) {
        if let Some(props) = self.objects.get_mut(r) {
            props.insert(path.to_string(), v);
        }
    }

    fn list(&self, r: &MoRef, path: &str) -> Vec<Value> {
        as_list(self.get(r, path)).into_iter().cloned().collect()
    }

    fn push(&mut self, r: &MoRef, path: &str, v: Value) {
        let mut items = self.list(r, path);
        items.push(v);
        self.set(r, path, Value::Array(items));
    }

    fn require(&self, r: &MoRef) -> VsResult<()> {
        if self.objects.contains_key(r) {
            Ok(())
        } else {
            Err(from_fault(
                "ManagedObjectNotFound",
                "The object has already been deleted or has not been completely created",
                Some(json!({ "obj": r.to_value() })),
            ))
        }
    }

    fn new_task(&mut self, kind: &str, result: Value) -> Value {
        let infos = self
            .queued_tasks
            .pop_front()
            .unwrap_or_else(|| vec![task_success(result)]);
        let task = self.add(kind, "task", vec![]);
        self.task_infos.insert(task.clone(), infos.into());
        task.to_value()
    }

    fn next_info(&mut self, task: &MoRef) -> Option<Value> {
        let queue = self.task_infos.get_mut(task)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    fn is_descendant(&self, obj: &MoRef, container: &MoRef) -> bool {
        let mut current = obj.clone();
        for _ in 0..64 {
            let parent = match self.get(&current, "parent").and_then(MoRef::from_value) {
                Some(p) => p,
                None => return false,
            };
            if &parent == container {
                return true;
            }
            current = parent;
        }
        false
    }
}

pub struct FakeVim {
    content: ServiceContent,
    state: Mutex<VimState>,
    handlers: Mutex<HashMap<String, Handler>>,
}

pub const SMS_SERVICE: (&str, &str) = ("SmsServiceInstance", "ServiceInstance");
pub const SMS_STORAGE_MANAGER: (&str, &str) = ("SmsStorageManager", "StorageManager");

impl FakeVim {
    fn new() -> Self {
        let content = ServiceContent {
            root_folder: MoRef::new("Folder", "group-d1"),
            property_collector: MoRef::new("PropertyCollector", "propertyCollector"),
            view_manager: MoRef::new("ViewManager", "ViewManager"),
            session_manager: MoRef::new("SessionManager", "SessionManager"),
            search_index: MoRef::new("SearchIndex", "SearchIndex"),
            custom_fields_manager: Some(MoRef::new("CustomFieldsManager", "CustomFieldsManager")),
            authorization_manager: Some(MoRef::new("AuthorizationManager", "AuthorizationManager")),
            extension_manager: Some(MoRef::new("ExtensionManager", "ExtensionManager")),
            vstorage_object_manager: Some(MoRef::new(
                "VcenterVStorageObjectManager",
                "VStorageObjectManager",
            )),
            api_type: "VirtualCenter".into(),
            api_version: "8.0.2.0".into(),
        };
        let mut st = VimState::default();
        st.add_with(
            content.root_folder.clone(),
            vec![("name", json!("Datacenters")), ("childEntity", json!([]))],
        );
        let managers = [
            (content.custom_fields_manager.clone(), "field", json!([])),
            (
                content.authorization_manager.clone(),
                "roleList",
                json!([
                    {"roleId": -5, "system": true, "name": "NoAccess", "info": {"label": "No access", "summary": "Used for restricting granted access"}},
                    {"roleId": -2, "system": true, "name": "ReadOnly", "info": {"label": "Read-only", "summary": "See details of objects, but not make changes"}, "privilege": ["System.Anonymous", "System.Read", "System.View"]},
                    {"roleId": -1, "system": true, "name": "Admin", "info": {"label": "Administrator", "summary": "Full access rights"}, "privilege": ["System.Anonymous", "System.Read", "System.View"]}
                ]),
            ),
            (content.extension_manager.clone(), "extensionList", json!([])),
            (content.vstorage_object_manager.clone(), "_disks", json!([])),
        ];
        for (moref, key, value) in managers {
            if let Some(moref) = moref {
                st.add_with(moref, vec![(key, value)]);
            }
        }
        st.add_with(
            MoRef::new(SMS_STORAGE_MANAGER.0, SMS_STORAGE_MANAGER.1),
            vec![("_providers", json!([]))],
        );
        Self {
            content,
            state: Mutex::new(st),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    // ── Builders ────────────────────────────────────────────────────

    pub fn datacenter(&self, name: &str) -> FakeDatacenter {
        let mut st = self.state.lock().unwrap();
        let root = self.content.root_folder.clone();
        let dc = MoRef::new("Datacenter", st.id("datacenter"));
        let folder = |st: &mut VimState, label: &str| {
            st.add("Folder", "group", vec![
                ("name", json!(label)),
                ("parent", dc.to_value()),
                ("childEntity", json!([])),
            ])
        };
        let vm_folder = folder(&mut st, "vm");
        let host_folder = folder(&mut st, "host");
        let datastore_folder = folder(&mut st, "datastore");
        let network_folder = folder(&mut st, "network");
        st.add_with(dc.clone(), vec![
            ("name", json!(name)),
            ("parent", root.to_value()),
            ("vmFolder", vm_folder.to_value()),
            ("hostFolder", host_folder.to_value()),
            ("datastoreFolder", datastore_folder.to_value()),
            ("networkFolder", network_folder.to_value()),
        ]);
        // The datacenter was registered after its folders; keep creation
        // order parent-first for views.
        if let Some(pos) = st.order.iter().position(|r| r == &dc) {
            let moved = st.order.remove(pos);
            let first = st.order.iter().position(|r| r == &vm_folder).unwrap_or(0);
            st.order.insert(first, moved);
        }
        st.push(&root, "childEntity", dc.to_value());
        FakeDatacenter {
            moref: dc,
            vm_folder,
            host_folder,
            datastore_folder,
            network_folder,
        }
    }

    pub fn folder(&self, parent: &MoRef, name: &str) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let f = st.add("Folder", "group", vec![
            ("name", json!(name)),
            ("parent", parent.to_value()),
            ("childEntity", json!([])),
        ]);
        st.push(parent, "childEntity", f.to_value());
        f
    }

    pub fn vm(&self, folder: &MoRef, name: &str) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let vm = st.add("VirtualMachine", "vm", vec![
            ("name", json!(name)),
            ("parent", folder.to_value()),
            ("runtime.powerState", json!("poweredOff")),
            ("customValue", json!([])),
        ]);
        st.push(folder, "childEntity", vm.to_value());
        vm
    }

    pub fn cluster(&self, host_folder: &MoRef, name: &str) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let cluster = MoRef::new("ClusterComputeResource", st.id("domain-c"));
        let pool = st.add("ResourcePool", "resgroup", vec![
            ("name", json!("Resources")),
            ("parent", cluster.to_value()),
            ("resourcePool", json!([])),
            ("vm", json!([])),
        ]);
        st.add_with(cluster.clone(), vec![
            ("name", json!(name)),
            ("parent", host_folder.to_value()),
            ("host", json!([])),
            ("resourcePool", pool.to_value()),
            ("datastore", json!([])),
            (
                "configurationEx",
                json!({
                    "_type": "ClusterConfigInfoEx",
                    "drsConfig": {"enabled": false, "defaultVmBehavior": "fullyAutomated", "vmotionRate": 3},
                    "drsVmConfig": [],
                    "dasConfig": {"enabled": false},
                    "vsanConfigInfo": {"enabled": false},
                    "systemVMsConfig": {"allowedDatastores": []},
                }),
            ),
        ]);
        st.push(host_folder, "childEntity", cluster.to_value());
        cluster
    }

    /// A host under a cluster (or directly under a host folder), with its
    /// configuration managers.
    pub fn host(&self, parent: &MoRef, name: &str) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let service = st.add("HostServiceSystem", "serviceSystem", vec![("serviceInfo.service", json!([]))]);
        let access = st.add("HostAccessManager", "hostAccessManager", vec![
            ("lockdownMode", json!("lockdownDisabled")),
            ("_exceptions", json!([])),
        ]);
        let datetime = st.add("HostDateTimeSystem", "dateTimeSystem", vec![(
            "dateTimeInfo.ntpConfig.server",
            json!([]),
        )]);
        let vsan = st.add("HostVsanSystem", "vsanSystem", vec![("config", json!({"enabled": false}))]);
        let host = st.add("HostSystem", "host", vec![
            ("name", json!(name)),
            ("parent", parent.to_value()),
            ("runtime.inMaintenanceMode", json!(false)),
            ("config.network.vswitch", json!([])),
            ("configManager.serviceSystem", service.to_value()),
            ("configManager.hostAccessManager", access.to_value()),
            ("configManager.dateTimeSystem", datetime.to_value()),
            ("configManager.vsanSystem", vsan.to_value()),
        ]);
        if is_a(&parent.kind, "ComputeResource") {
            st.push(parent, "host", host.to_value());
        } else {
            st.push(parent, "childEntity", host.to_value());
        }
        host
    }

    /// A host configuration manager (`serviceSystem`, `hostAccessManager`, ...).
    pub fn manager(&self, host: &MoRef, name: &str) -> MoRef {
        let st = self.state.lock().unwrap();
        st.get(host, &format!("configManager.{name}"))
            .and_then(MoRef::from_value)
            .unwrap()
    }

    pub fn host_service(&self, host: &MoRef, key: &str, running: bool, policy: &str) {
        let system = self.manager(host, "serviceSystem");
        let mut st = self.state.lock().unwrap();
        st.push(&system, "serviceInfo.service", json!({
            "key": key,
            "label": format!("{key} daemon"),
            "required": false,
            "uninstallable": true,
            "running": running,
            "policy": policy,
            "sourcePackage": {"sourcePackageName": "esx-base", "description": "This VIB contains all of the base functionality of vSphere ESXi."}
        }));
    }

    pub fn datastore(&self, folder: &MoRef, name: &str, capacity: i64, free: i64) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let id = st.id("datastore");
        let ds = MoRef::new("Datastore", &id);
        st.add_with(ds.clone(), vec![
            ("name", json!(name)),
            ("parent", folder.to_value()),
            ("summary.capacity", json!(capacity)),
            ("summary.freeSpace", json!(free)),
            ("summary.uncommitted", json!(0)),
            ("summary.type", json!("VMFS")),
            ("summary.url", json!(format!("ds:///vmfs/volumes/{id}/"))),
            ("summary.accessible", json!(true)),
        ]);
        st.push(folder, "childEntity", ds.to_value());
        ds
    }

    pub fn dvswitch(&self, folder: &MoRef, name: &str) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let id = st.id("dvs");
        let dvs = MoRef::new("VmwareDistributedVirtualSwitch", &id);
        st.add_with(dvs.clone(), vec![
            ("name", json!(name)),
            ("parent", folder.to_value()),
            ("config.uuid", json!(format!("50 2a {id}"))),
            ("config.maxMtu", json!(1500)),
            ("summary.numPorts", json!(0)),
            ("summary.productInfo.version", json!("8.0.0")),
            ("summary.hostMember", json!([])),
        ]);
        st.push(folder, "childEntity", dvs.to_value());
        dvs
    }

    pub fn portgroup(&self, dvs: &MoRef, name: &str, vlan: i64) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let folder = st.get(dvs, "parent").and_then(MoRef::from_value).unwrap();
        let pg = st.add("DistributedVirtualPortgroup", "dvportgroup", vec![
            ("name", json!(name)),
            ("parent", folder.to_value()),
            ("config.distributedVirtualSwitch", dvs.to_value()),
            ("config.numPorts", json!(8)),
            ("config.defaultPortConfig.vlan.vlanId", json!(vlan)),
            ("config.type", json!("earlyBinding")),
            ("config.uplink", json!(false)),
        ]);
        st.push(&folder, "childEntity", pg.to_value());
        pg
    }

    pub fn role(&self, id: i64, name: &str, privileges: &[&str]) {
        let manager = self.content.authorization_manager.clone().unwrap();
        let mut st = self.state.lock().unwrap();
        st.push(&manager, "roleList", json!({
            "roleId": id, "system": false, "name": name,
            "info": {"label": name, "summary": format!("{name} role")},
            "privilege": privileges,
        }));
    }

    pub fn extension(&self, key: &str, label: &str, version: &str) {
        let manager = self.content.extension_manager.clone().unwrap();
        let mut st = self.state.lock().unwrap();
        st.push(&manager, "extensionList", json!({
            "key": key, "version": version, "company": "VMware, Inc.", "type": "",
            "description": {"label": label, "summary": format!("{label} extension")},
            "lastHeartbeatTime": "2024-01-01T00:00:00Z",
        }));
    }

    pub fn custom_field(&self, name: &str, mo_type: Option<&str>) -> i64 {
        let manager = self.content.custom_fields_manager.clone().unwrap();
        let mut st = self.state.lock().unwrap();
        add_field(&mut st, &manager, name, mo_type)
    }

    pub fn disk(&self, datastore: &MoRef, name: &str, capacity_mb: i64) -> String {
        let manager = self.content.vstorage_object_manager.clone().unwrap();
        let mut st = self.state.lock().unwrap();
        add_disk(&mut st, &manager, datastore, name, capacity_mb)
    }

    pub fn vasa_provider(&self, name: &str, url: &str) -> MoRef {
        let mut st = self.state.lock().unwrap();
        add_provider(&mut st, name, url)
    }

    pub fn set_prop(&self, moref: &MoRef, path: &str, value: impl Into<Value>) {
        self.state.lock().unwrap().set(moref, path, value.into());
    }

    pub fn prop(&self, moref: &MoRef, path: &str) -> Option<Value> {
        self.state.lock().unwrap().get(moref, path).cloned()
    }

    /// A `Task` whose successive polls return `infos`; the last one repeats.
    pub fn task(&self, infos: Vec<Value>) -> MoRef {
        self.scripted_task("Task", infos)
    }

    /// An `SmsTask`, polled with `QueryTaskInfo`.
    pub fn storage_task(&self, infos: Vec<Value>) -> MoRef {
        self.scripted_task("SmsTask", infos)
    }

    fn scripted_task(&self, kind: &str, infos: Vec<Value>) -> MoRef {
        let mut st = self.state.lock().unwrap();
        let task = st.add(kind, "task", vec![]);
        st.task_infos.insert(task.clone(), infos.into());
        task
    }

    /// Script the polls of the next task a method creates.
    pub fn next_task(&self, infos: Vec<Value>) {
        self.state.lock().unwrap().queued_tasks.push_back(infos);
    }

    pub fn fail_next_retrieve(&self, err: VsError) {
        self.state.lock().unwrap().fail_next_retrieve = Some(err);
    }

    /// Override (or add) a method.
    pub fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(&MoRef, &Map<String, Value>) -> VsResult<Value> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _, _)| m == method)
            .count()
    }

    /// Arguments of every call to `method`, in order.
    pub fn calls(&self, method: &str) -> Vec<Map<String, Value>> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _, _)| m == method)
            .map(|(_, _, a)| a.clone())
            .collect()
    }

    pub fn last_args(&self, method: &str) -> Option<Map<String, Value>> {
        self.calls(method).pop()
    }

    pub fn mutating_calls(&self) -> usize {
        const READS: [&str; 12] = [
            "RetrievePropertiesEx",
            "CreateContainerView",
            "DestroyView",
            "FindAllByUuid",
            "QueryLockdownExceptions",
            "ListVStorageObject",
            "RetrieveVStorageObject",
            "RetrieveEntityPermissions",
            "QueryStorageManager",
            "QueryProvider",
            "QueryProviderInfo",
            "QueryTaskInfo",
        ];
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, _, _)| !READS.contains(&m.as_str()) && m != "Logout")
            .count()
    }

    pub fn open_views(&self) -> usize {
        self.state.lock().unwrap().views.len()
    }

    pub fn logout_count(&self) -> usize {
        self.state.lock().unwrap().logouts
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn retrieve_sync(&self, spec: &RetrieveSpec) -> VsResult<Vec<ObjectContent>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(("RetrievePropertiesEx".into(), self.content.property_collector.clone(), Map::new()));
        if let Some(err) = st.fail_next_retrieve.take() {
            return Err(err);
        }
        let objects: Vec<MoRef> = match &spec.target {
            RetrieveTarget::Objects(list) => {
                for r in list {
                    st.require(r)?;
                }
                list.clone()
            }
            RetrieveTarget::View(view) => {
                let (container, types) = st.views.get(view).cloned().ok_or_else(|| {
                    from_fault("ManagedObjectNotFound", "view is gone", None)
                })?;
                st.order
                    .iter()
                    .filter(|r| types.iter().any(|t| is_a(&r.kind, t)))
                    .filter(|r| st.is_descendant(r, &container))
                    .cloned()
                    .collect()
            }
        };

        let mut out = Vec::new();
        for obj in objects {
            let specs: Vec<_> = spec.props.iter().filter(|p| is_a(&obj.kind, &p.vim_type)).collect();
            if specs.is_empty() {
                continue;
            }
            if st.task_infos.contains_key(&obj) {
                if let Some(info) = st.next_info(&obj) {
                    st.set(&obj, "info", info);
                }
            }
            let all = specs.iter().any(|p| p.paths.is_empty());
            let stored = st.objects.get(&obj).cloned().unwrap_or_default();
            let props = stored
                .into_iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .filter(|(k, _)| all || specs.iter().any(|p| p.paths.iter().any(|path| path == k)))
                .collect();
            out.push(ObjectContent {
                obj,
                props,
                missing: Vec::new(),
            });
        }
        Ok(out)
    }

    fn invoke_sync(&self, this: &MoRef, method: &str, args: Map<String, Value>) -> VsResult<Value> {
        let handler = self.handlers.lock().unwrap().get(method).cloned();
        {
            let mut st = self.state.lock().unwrap();
            st.calls.push((method.to_string(), this.clone(), args.clone()));
        }
        if let Some(handler) = handler {
            return handler(this, &args);
        }
        let mut st = self.state.lock().unwrap();
        builtin(&mut st, this, method, &args)
    }
}

#[async_trait]
impl VimApi for FakeVim {
    fn service_content(&self) -> &ServiceContent {
        &self.content
    }

    async fn retrieve(&self, spec: &RetrieveSpec) -> VsResult<Vec<ObjectContent>> {
        self.retrieve_sync(spec)
    }

    async fn invoke(&self, this: &MoRef, method: &str, args: Vec<(&str, SoapValue)>) -> VsResult<Value> {
        let args = args
            .iter()
            .map(|(k, v)| (k.to_string(), soap_to_json(v)))
            .collect();
        self.invoke_sync(this, method, args)
    }

    async fn logout(&self) -> VsResult<()> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(("Logout".into(), self.content.session_manager.clone(), Map::new()));
        st.logouts += 1;
        Ok(())
    }
}

/// The JSON shape of a request argument, as the handlers see it.
pub fn soap_to_json(v: &SoapValue) -> Value {
    match v {
        SoapValue::Str(s) => json!(s),
        SoapValue::Int(n) => json!(n),
        SoapValue::Bool(b) => json!(b),
        SoapValue::Ref(r) | SoapValue::AnyRef(r) => r.to_value(),
        SoapValue::Typed { text, .. } => json!(text),
        SoapValue::List(items) => Value::Array(items.iter().map(soap_to_json).collect()),
        SoapValue::Obj(obj) => {
            let mut map = Map::new();
            if let Some(t) = &obj.xsi_type {
                map.insert("_type".into(), json!(t));
            }
            for (name, value) in &obj.fields {
                map.insert(name.clone(), soap_to_json(value));
            }
            Value::Object(map)
        }
    }
}

fn arg_ref(args: &Map<String, Value>, key: &str) -> VsResult<MoRef> {
    args.get(key)
        .and_then(MoRef::from_value)
        .ok_or_else(|| from_fault("InvalidArgument", &format!("missing {key}"), None))
}

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> &'a str {
    args.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn add_field(st: &mut VimState, manager: &MoRef, name: &str, mo_type: Option<&str>) -> i64 {
    st.next_id += 1;
    let key = 100 + st.next_id as i64;
    let mut def = json!({"key": key, "name": name, "type": "string"});
    if let Some(t) = mo_type {
        def["managedObjectType"] = json!(t);
    }
    st.push(manager, "field", def);
    key
}

fn add_disk(st: &mut VimState, manager: &MoRef, datastore: &MoRef, name: &str, mb: i64) -> String {
    let id = format!("fcd-{}", st.id("disk"));
    st.push(manager, "_disks", json!({
        "id": {"id": id},
        "datastore": datastore.to_value(),
        "config": {
            "id": {"id": id},
            "name": name,
            "capacityInMB": mb,
            "consumptionType": ["disk"],
            "backing": {"datastore": datastore.to_value(), "filePath": format!("[{}] fcd/{name}.vmdk", datastore.value), "provisioningType": "thin"}
        }
    }));
    id
}

fn add_provider(st: &mut VimState, name: &str, url: &str) -> MoRef {
    let provider = st.add("SmsProvider", "provider", vec![]);
    let uid = format!("uid-{}", provider.value);
    st.set(&provider, "_info", json!({"name": name, "url": url, "uid": uid}));
    let manager = MoRef::new(SMS_STORAGE_MANAGER.0, SMS_STORAGE_MANAGER.1);
    st.push(&manager, "_providers", provider.to_value());
    provider
}

fn disk_index(st: &VimState, manager: &MoRef, id: &str) -> VsResult<usize> {
    st.list(manager, "_disks")
        .iter()
        .position(|d| str_at(d, "id.id") == Some(id))
        .ok_or_else(|| from_fault("NotFound", &format!("disk {id} not found"), None))
}

fn builtin(
    st: &mut VimState,
    this: &MoRef,
    method: &str,
    args: &Map<String, Value>,
) -> VsResult<Value> {
    match method {
        // ── Views and search ───────────────────────────────────────
        "CreateContainerView" => {
            let container = arg_ref(args, "container")?;
            st.require(&container)?;
            let types = as_list(args.get("type"))
                .into_iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect();
            let view = MoRef::new("ContainerView", format!("session[fake]{}", st.id("view")));
            st.views.insert(view.clone(), (container, types));
            Ok(view.to_value())
        }
        "DestroyView" => {
            st.views.remove(this);
            Ok(Value::Null)
        }
        "FindAllByUuid" => {
            let uuid = arg_str(args, "uuid");
            let vm_search = args.get("vmSearch").and_then(Value::as_bool).unwrap_or(true);
            let instance = args.get("instanceUuid").and_then(Value::as_bool).unwrap_or(false);
            let (kind, path) = match (vm_search, instance) {
                (true, true) => ("VirtualMachine", "config.instanceUuid"),
                (true, false) => ("VirtualMachine", "config.uuid"),
                (false, _) => ("HostSystem", "hardware.systemInfo.uuid"),
            };
            let found: Vec<Value> = st
                .order
                .iter()
                .filter(|r| r.kind == kind)
                .filter(|r| st.get(r, path).and_then(Value::as_str) == Some(uuid))
                .map(MoRef::to_value)
                .collect();
            Ok(Value::Array(found))
        }

        // ── Tasks ───────────────────────────────────────────────────
        "CancelTask" => {
            st.task_infos.insert(
                this.clone(),
                vec![task_error("RequestCanceled", "The task was canceled by a user.")].into(),
            );
            Ok(Value::Null)
        }
        "QueryTaskInfo" => st
            .next_info(this)
            .ok_or_else(|| from_fault("ManagedObjectNotFound", "no such task", None)),

        // ── Host services ───────────────────────────────────────────
        "UpdateServicePolicy" | "StartService" | "StopService" | "RestartService" => {
            let id = arg_str(args, "id").to_string();
            let mut services = st.list(this, "serviceInfo.service");
            let svc = services
                .iter_mut()
                .find(|s| str_at(s, "key") == Some(id.as_str()))
                .ok_or_else(|| from_fault("NotFound", &format!("service {id} not found"), None))?;
            match method {
                "UpdateServicePolicy" => svc["policy"] = json!(arg_str(args, "policy")),
                "StopService" => svc["running"] = json!(false),
                _ => svc["running"] = json!(true),
            }
            st.set(this, "serviceInfo.service", Value::Array(services));
            Ok(Value::Null)
        }

        // ── Lockdown ────────────────────────────────────────────────
        "ChangeLockdownMode" => {
            st.set(this, "lockdownMode", json!(arg_str(args, "mode")));
            Ok(Value::Null)
        }
        "QueryLockdownExceptions" => Ok(Value::Array(st.list(this, "_exceptions"))),
        "UpdateLockdownExceptions" => {
            let users = args.get("users").cloned().unwrap_or(json!([]));
            st.set(this, "_exceptions", Value::Array(as_list(Some(&users)).into_iter().cloned().collect()));
            Ok(Value::Null)
        }

        // ── Maintenance mode, time ──────────────────────────────────
        "EnterMaintenanceMode_Task" | "ExitMaintenanceMode_Task" => {
            st.set(this, "runtime.inMaintenanceMode", json!(method == "EnterMaintenanceMode_Task"));
            Ok(st.new_task("Task", Value::Null))
        }
        "UpdateDateTimeConfig" => {
            let servers = args
                .get("config")
                .and_then(|c| c.get("ntpConfig"))
                .and_then(|n| n.get("server"))
                .cloned()
                .unwrap_or(json!([]));
            st.set(
                this,
                "dateTimeInfo.ntpConfig.server",
                Value::Array(as_list(Some(&servers)).into_iter().cloned().collect()),
            );
            Ok(Value::Null)
        }

        // ── Clusters ────────────────────────────────────────────────
        "ReconfigureComputeResource_Task" => {
            let spec = args.get("spec").cloned().unwrap_or(Value::Null);
            let mut config = st.get(this, "configurationEx").cloned().unwrap_or(json!({}));
            if let Some(drs) = spec.get("drsConfig").and_then(Value::as_object) {
                for (k, v) in drs.iter().filter(|(k, _)| k.as_str() != "_type") {
                    config["drsConfig"][k] = v.clone();
                }
            }
            for update in as_list(spec.get("drsVmConfigSpec")) {
                let info = update.get("info").cloned().unwrap_or(Value::Null);
                let key = match str_at(update, "operation") {
                    Some("remove") => update.get("removeKey").cloned(),
                    _ => info.get("key").cloned(),
                };
                let mut list: Vec<Value> = as_list(config.get("drsVmConfig"))
                    .into_iter()
                    .filter(|e| e.get("key") != key.as_ref())
                    .cloned()
                    .collect();
                if str_at(update, "operation") != Some("remove") {
                    let mut entry = info.clone();
                    if let Some(m) = entry.as_object_mut() {
                        m.remove("_type");
                    }
                    list.push(entry);
                }
                config["drsVmConfig"] = Value::Array(list);
            }
            let updates: Vec<Value> = spec
                .get("systemVMsConfig")
                .map(|s| as_list(s.get("allowedDatastores")).into_iter().cloned().collect())
                .unwrap_or_default();
            if !updates.is_empty() {
                let mut list: Vec<Value> = as_list(config.pointer("/systemVMsConfig/allowedDatastores"))
                    .into_iter()
                    .cloned()
                    .collect();
                for update in &updates {
                    match str_at(update, "operation") {
                        Some("remove") => list.retain(|d| Some(d) != update.get("removeKey")),
                        Some("add") => list.extend(update.get("datastore").cloned()),
                        _ => {}
                    }
                }
                config["systemVMsConfig"]["allowedDatastores"] = Value::Array(list);
            }
            st.set(this, "configurationEx", config);
            Ok(st.new_task("Task", Value::Null))
        }

        // ── Custom attributes ───────────────────────────────────────
        "AddCustomFieldDef" => {
            let name = arg_str(args, "name").to_string();
            let mo_type = args.get("moType").and_then(Value::as_str).map(str::to_string);
            let duplicate = st.list(this, "field").iter().any(|f| {
                str_at(f, "name") == Some(name.as_str())
                    && str_at(f, "managedObjectType") == mo_type.as_deref()
            });
            if duplicate {
                return Err(from_fault("DuplicateName", &format!("'{name}' already exists"), None));
            }
            let key = add_field(st, this, &name, mo_type.as_deref());
            Ok(json!({"key": key, "name": name}))
        }
        "RemoveCustomFieldDef" => {
            let key = args.get("key").and_then(Value::as_i64).unwrap_or_default();
            let mut fields = st.list(this, "field");
            let before = fields.len();
            fields.retain(|f| i64_at(f, "key") != Some(key));
            if fields.len() == before {
                return Err(from_fault("InvalidArgument", &format!("no field {key}"), None));
            }
            st.set(this, "field", Value::Array(fields));
            Ok(Value::Null)
        }
        "SetField" => {
            let entity = arg_ref(args, "entity")?;
            st.require(&entity)?;
            let key = args.get("key").and_then(Value::as_i64).unwrap_or_default();
            let value = arg_str(args, "value").to_string();
            let mut values: Vec<Value> = st
                .list(&entity, "customValue")
                .into_iter()
                .filter(|v| i64_at(v, "key") != Some(key))
                .collect();
            values.push(json!({"key": key, "value": value}));
            st.set(&entity, "customValue", Value::Array(values));
            Ok(Value::Null)
        }

        // ── First-class disks ───────────────────────────────────────
        "ListVStorageObject" => {
            let ds = arg_ref(args, "datastore")?;
            Ok(Value::Array(
                st.list(this, "_disks")
                    .iter()
                    .filter(|d| d.get("datastore") == Some(&ds.to_value()))
                    .map(|d| d["id"].clone())
                    .collect(),
            ))
        }
        "RetrieveVStorageObject" => {
            let id = str_at(args.get("id").unwrap_or(&Value::Null), "id").unwrap_or_default().to_string();
            let idx = disk_index(st, this, &id)?;
            Ok(json!({"config": st.list(this, "_disks")[idx]["config"].clone()}))
        }
        "CreateDisk_Task" => {
            let spec = args.get("spec").cloned().unwrap_or(Value::Null);
            let ds = spec
                .get("backingSpec")
                .and_then(|b| b.get("datastore"))
                .and_then(MoRef::from_value)
                .ok_or_else(|| from_fault("InvalidArgument", "no datastore", None))?;
            let name = string_at(&spec, "name");
            let mb = i64_at(&spec, "capacityInMB").unwrap_or_default();
            let id = add_disk(st, this, &ds, &name, mb);
            Ok(st.new_task("Task", json!({"config": {"id": {"id": id}, "name": name, "capacityInMB": mb}})))
        }
        "ExtendDisk_Task" => {
            let id = str_at(args.get("id").unwrap_or(&Value::Null), "id").unwrap_or_default().to_string();
            let idx = disk_index(st, this, &id)?;
            let mut disks = st.list(this, "_disks");
            disks[idx]["config"]["capacityInMB"] = args.get("newCapacityInMB").cloned().unwrap_or(Value::Null);
            st.set(this, "_disks", Value::Array(disks));
            Ok(st.new_task("Task", Value::Null))
        }
        "DeleteVStorageObject_Task" => {
            let id = str_at(args.get("id").unwrap_or(&Value::Null), "id").unwrap_or_default().to_string();
            let idx = disk_index(st, this, &id)?;
            let mut disks = st.list(this, "_disks");
            disks.remove(idx);
            st.set(this, "_disks", Value::Array(disks));
            Ok(st.new_task("Task", Value::Null))
        }

        // ── vSAN ────────────────────────────────────────────────────
        "UpdateVsan_Task" => {
            let config = args.get("config").cloned().unwrap_or(Value::Null);
            let uuid = str_at(&config, "clusterInfo.uuid")
                .unwrap_or("52e7c9a0-0b6f-4f1c-9d7e-1a2b3c4d5e6f")
                .to_string();
            st.set(this, "config", json!({
                "enabled": config.get("enabled").cloned().unwrap_or(json!(true)),
                "clusterInfo": {"uuid": uuid, "nodeUuid": format!("node-{}", this.value)},
            }));
            Ok(st.new_task("Task", Value::Null))
        }
        "VsanHealthRepairClusterObjectsImmediate" => {
            let cluster = arg_ref(args, "cluster")?;
            st.require(&cluster)?;
            Ok(st.new_task("Task", Value::Null))
        }

        // ── Permissions ─────────────────────────────────────────────
        "RetrieveEntityPermissions" => {
            let entity = arg_ref(args, "entity")?;
            st.require(&entity)?;
            Ok(Value::Array(st.list(&entity, "_permissions")))
        }
        "SetEntityPermissions" => {
            let entity = arg_ref(args, "entity")?;
            st.require(&entity)?;
            let mut perms = st.list(&entity, "_permissions");
            for p in as_list(args.get("permission")) {
                let principal = str_at(p, "principal").unwrap_or_default();
                perms.retain(|e| str_at(e, "principal") != Some(principal));
                let mut entry = p.clone();
                if let Some(m) = entry.as_object_mut() {
                    m.remove("_type");
                    m.insert("entity".into(), entity.to_value());
                }
                perms.push(entry);
            }
            st.set(&entity, "_permissions", Value::Array(perms));
            Ok(Value::Null)
        }
        "RemoveEntityPermission" => {
            let entity = arg_ref(args, "entity")?;
            let user = arg_str(args, "user").to_string();
            let mut perms = st.list(&entity, "_permissions");
            let before = perms.len();
            perms.retain(|e| str_at(e, "principal") != Some(user.as_str()));
            if perms.len() == before {
                return Err(from_fault("NotFound", &format!("no permission for {user}"), None));
            }
            st.set(&entity, "_permissions", Value::Array(perms));
            Ok(Value::Null)
        }

        // ── Storage monitoring ──────────────────────────────────────
        "QueryStorageManager" => Ok(MoRef::new(SMS_STORAGE_MANAGER.0, SMS_STORAGE_MANAGER.1).to_value()),
        "QueryProvider" => Ok(Value::Array(st.list(this, "_providers"))),
        "QueryProviderInfo" => st
            .get(this, "_info")
            .cloned()
            .ok_or_else(|| from_fault("ManagedObjectNotFound", "no such provider", None)),
        "RegisterProvider_Task" => {
            let spec = args.get("providerSpec").cloned().unwrap_or(Value::Null);
            let provider = add_provider(st, &string_at(&spec, "name"), &string_at(&spec, "url"));
            Ok(st.new_task("SmsTask", provider.to_value()))
        }
        "UnregisterProvider_Task" => {
            let uid = arg_str(args, "providerId").to_string();
            let mut providers = st.list(this, "_providers");
            providers.retain(|p| {
                MoRef::from_value(p)
                    .and_then(|r| st.get(&r, "_info").cloned())
                    .map(|info| string_at(&info, "uid") != uid)
                    .unwrap_or(true)
            });
            st.set(this, "_providers", Value::Array(providers));
            Ok(st.new_task("SmsTask", Value::Null))
        }

        _ => Err(from_fault(
            "MethodNotFound",
            &format!("fake vCenter does not implement {method} on {this}"),
            None,
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  REST side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct RestState {
    next_id: u64,
    categories: Vec<Value>,
    tags: Vec<Value>,
    attached: Vec<(String, Value)>,
    libraries: Vec<Value>,
    items: Vec<Value>,
    files: HashMap<String, Vec<(String, Vec<u8>)>>,
    sessions: BTreeMap<String, Value>,
    prepare_polls: usize,
    broken_files: Vec<String>,
    blobs: HashMap<String, Vec<u8>>,
    calls: Vec<(HttpMethod, String, Vec<(String, String)>)>,
    failures: Vec<(HttpMethod, String, VsError)>,
    logouts: usize,
}

impl RestState {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}:{:04}", self.next_id)
    }
}

#[derive(Default)]
pub struct FakeRest {
    state: Mutex<RestState>,
}

fn not_found(path: &str) -> VsError {
    VsError::not_found(format!("404 Not Found: {path}")).with_details(json!({"status": 404}))
}

impl FakeRest {
    pub fn add_category(&self, name: &str, cardinality: &str, associable: &[&str]) -> String {
        let mut st = self.state.lock().unwrap();
        let id = st.id("urn:vmomi:InventoryServiceCategory");
        st.categories.push(json!({
            "id": id, "name": name, "description": "", "cardinality": cardinality,
            "associable_types": associable, "used_by": [],
        }));
        id
    }

    pub fn add_tag(&self, category_id: &str, name: &str) -> String {
        let mut st = self.state.lock().unwrap();
        let id = st.id("urn:vmomi:InventoryServiceTag");
        st.tags.push(json!({
            "id": id, "name": name, "description": "", "category_id": category_id, "used_by": [],
        }));
        id
    }

    pub fn attach(&self, tag_id: &str, object: &MoRef) {
        let mut st = self.state.lock().unwrap();
        st.attached.push((tag_id.to_string(), json!({"type": object.kind, "id": object.value})));
    }

    pub fn add_library(&self, name: &str) -> String {
        let mut st = self.state.lock().unwrap();
        let id = st.id("lib");
        st.libraries.push(json!({
            "id": id, "name": name, "description": format!("{name} library"), "type": "LOCAL",
            "creation_time": "2024-01-01T00:00:00.000Z", "server_guid": "guid-1", "version": "2",
        }));
        id
    }

    pub fn add_item(&self, library_id: &str, name: &str, files: &[(&str, &[u8])]) -> String {
        let mut st = self.state.lock().unwrap();
        let id = st.id("item");
        st.items.push(json!({"id": id, "library_id": library_id, "name": name, "type": "ovf"}));
        st.files.insert(
            id.clone(),
            files.iter().map(|(n, b)| (n.to_string(), b.to_vec())).collect(),
        );
        id
    }

    /// Files stay `PREPARING` for this many status reads.
    pub fn prepare_polls(&self, n: usize) {
        self.state.lock().unwrap().prepare_polls = n;
    }

    /// Preparing `file` ends in the `ERROR` state.
    pub fn break_file(&self, file: &str) {
        self.state.lock().unwrap().broken_files.push(file.to_string());
    }

    /// Every `method` request whose path starts with `path_prefix` fails with `err`.
    pub fn fail_on(&self, method: HttpMethod, path_prefix: &str, err: VsError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((method, path_prefix.to_string(), err));
    }

    pub fn categories(&self) -> Vec<Value> {
        self.state.lock().unwrap().categories.clone()
    }

    pub fn tags(&self) -> Vec<Value> {
        self.state.lock().unwrap().tags.clone()
    }

    pub fn attached_to(&self, object: &MoRef) -> Vec<String> {
        let obj = json!({"type": object.kind, "id": object.value});
        let mut ids: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .attached
            .iter()
            .filter(|(_, o)| o == &obj)
            .map(|(t, _)| t.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Download sessions, including their final `state` and `deleted` flag.
    pub fn download_sessions(&self) -> Vec<Value> {
        self.state.lock().unwrap().sessions.values().cloned().collect()
    }

    pub fn count(&self, method: HttpMethod, path_prefix: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(m, p, _)| *m == method && p.starts_with(path_prefix))
            .count()
    }

    pub fn logout_count(&self) -> usize {
        self.state.lock().unwrap().logouts
    }

    fn route(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> VsResult<Value> {
        use HttpMethod::*;
        let mut st = self.state.lock().unwrap();
        st.calls.push((
            method,
            path.to_string(),
            query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        ));
        if let Some((_, _, err)) = st
            .failures
            .iter()
            .find(|(m, prefix, _)| *m == method && path.starts_with(prefix.as_str()))
        {
            return Err(err.clone());
        }
        let q = |key: &str| query.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone());
        let body = body.unwrap_or(Value::Null);
        let segs: Vec<&str> = path.trim_start_matches("/api/").split('/').collect();

        match (method, segs.as_slice()) {
            // ── Tagging ─────────────────────────────────────────────
            (Get, ["cis", "tagging", "category"]) => {
                Ok(json!(st.categories.iter().map(|c| c["id"].clone()).collect::<Vec<_>>()))
            }
            (Get, ["cis", "tagging", "tag"]) => {
                Ok(json!(st.tags.iter().map(|c| c["id"].clone()).collect::<Vec<_>>()))
            }
            (Get, ["cis", "tagging", coll, id]) => {
                let list = if *coll == "category" { &st.categories } else { &st.tags };
                list.iter()
                    .find(|c| c["id"] == *id)
                    .cloned()
                    .ok_or_else(|| not_found(path))
            }
            (Post, ["cis", "tagging", "category"]) => {
                let id = st.id("urn:vmomi:InventoryServiceCategory");
                let mut record = body.clone();
                record["id"] = json!(id);
                record["used_by"] = json!([]);
                st.categories.push(record);
                Ok(json!(id))
            }
            (Post, ["cis", "tagging", "tag"]) => {
                let category = string_at(&body, "category_id");
                if !st.categories.iter().any(|c| c["id"] == category.as_str()) {
                    return Err(not_found(&category));
                }
                let id = st.id("urn:vmomi:InventoryServiceTag");
                let mut record = body.clone();
                record["id"] = json!(id);
                record["used_by"] = json!([]);
                st.tags.push(record);
                Ok(json!(id))
            }
            (Patch, ["cis", "tagging", coll, id]) => {
                let list = if *coll == "category" { &mut st.categories } else { &mut st.tags };
                let record = list
                    .iter_mut()
                    .find(|c| c["id"] == *id)
                    .ok_or_else(|| not_found(path))?;
                if let Some(fields) = body.as_object() {
                    for (k, v) in fields {
                        record[k] = v.clone();
                    }
                }
                Ok(Value::Null)
            }
            (Delete, ["cis", "tagging", coll, id]) => {
                let id = id.to_string();
                let list = if *coll == "category" { &mut st.categories } else { &mut st.tags };
                let before = list.len();
                list.retain(|c| c["id"] != id.as_str());
                if list.len() == before {
                    return Err(not_found(path));
                }
                if *coll == "category" {
                    st.tags.retain(|t| t["category_id"] != id.as_str());
                }
                Ok(Value::Null)
            }
            (Post, ["cis", "tagging", "tag-association"]) => {
                let object = body.get("object_id").cloned().unwrap_or(Value::Null);
                match q("action").as_deref() {
                    Some("list-attached-tags") => Ok(json!(st
                        .attached
                        .iter()
                        .filter(|(_, o)| *o == object)
                        .map(|(t, _)| t.clone())
                        .collect::<Vec<_>>())),
                    _ => Err(VsError::protocol("unknown tag-association action")),
                }
            }
            (Post, ["cis", "tagging", "tag-association", tag]) => {
                let tag = tag.to_string();
                if !st.tags.iter().any(|t| t["id"] == tag.as_str()) {
                    return Err(not_found(path));
                }
                let object = body.get("object_id").cloned().unwrap_or(Value::Null);
                match q("action").as_deref() {
                    Some("attach") => {
                        if !st.attached.iter().any(|(t, o)| *t == tag && *o == object) {
                            st.attached.push((tag, object));
                        }
                    }
                    Some("detach") => st.attached.retain(|(t, o)| !(*t == tag && *o == object)),
                    _ => return Err(VsError::protocol("unknown tag-association action")),
                }
                Ok(Value::Null)
            }

            // ── Content library ─────────────────────────────────────
            (Get, ["content", "library"]) => {
                Ok(json!(st.libraries.iter().map(|l| l["id"].clone()).collect::<Vec<_>>()))
            }
            (Get, ["content", "library", "item"]) => {
                let library = q("library_id").unwrap_or_default();
                Ok(json!(st
                    .items
                    .iter()
                    .filter(|i| i["library_id"] == library.as_str())
                    .map(|i| i["id"].clone())
                    .collect::<Vec<_>>()))
            }
            (Get, ["content", "library", "item", id]) => st
                .items
                .iter()
                .find(|i| i["id"] == *id)
                .cloned()
                .ok_or_else(|| not_found(path)),
            (Get, ["content", "library", "item", id, "file"]) => {
                let files = st.files.get(*id).ok_or_else(|| not_found(path))?;
                Ok(json!(files
                    .iter()
                    .map(|(n, b)| json!({"name": n, "size": b.len()}))
                    .collect::<Vec<_>>()))
            }
            (Get, ["content", "library", id]) => st
                .libraries
                .iter()
                .find(|l| l["id"] == *id)
                .cloned()
                .ok_or_else(|| not_found(path)),
            (Post, ["content", "library", "item", "download-session"]) => {
                let item = string_at(&body, "library_item_id");
                let files = st.files.get(&item).cloned().ok_or_else(|| not_found(&item))?;
                let sid = st.id("download-session");
                let states: Map<String, Value> = files
                    .iter()
                    .map(|(n, b)| (n.clone(), json!({"name": n, "size": b.len(), "status": "UNPREPARED", "polls": 0})))
                    .collect();
                st.sessions.insert(sid.clone(), json!({
                    "id": sid, "item": item, "state": "ACTIVE", "deleted": false, "files": states,
                }));
                Ok(json!(sid))
            }
            (Post, ["content", "library", "item", "download-session", sid]) => {
                let session = st.sessions.get_mut(*sid).ok_or_else(|| not_found(path))?;
                if q("action").as_deref() == Some("fail") {
                    session["state"] = json!("ERROR");
                    session["error_message"] = body.get("client_error_message").cloned().unwrap_or(Value::Null);
                }
                Ok(Value::Null)
            }
            (Delete, ["content", "library", "item", "download-session", sid]) => {
                let session = st.sessions.get_mut(*sid).ok_or_else(|| not_found(path))?;
                session["deleted"] = json!(true);
                Ok(Value::Null)
            }
            (Get, ["content", "library", "item", "download-session", sid, "file"]) => {
                let sid = sid.to_string();
                let polls = st.prepare_polls;
                let broken = st.broken_files.clone();
                let item = {
                    let session = st.sessions.get(&sid).ok_or_else(|| not_found(path))?;
                    string_at(session, "item")
                };
                let session = st.sessions.get_mut(&sid).ok_or_else(|| not_found(path))?;
                match q("file_name") {
                    None => Ok(json!(session["files"]
                        .as_object()
                        .map(|f| f.values().cloned().collect::<Vec<_>>())
                        .unwrap_or_default())),
                    Some(name) => {
                        let file = session["files"]
                            .get_mut(&name)
                            .ok_or_else(|| not_found(&name))?;
                        if file["status"] == "PREPARING" {
                            let seen = file["polls"].as_u64().unwrap_or(0) as usize + 1;
                            file["polls"] = json!(seen);
                            if broken.contains(&name) {
                                file["status"] = json!("ERROR");
                                file["error_message"] = json!({"default_message": "disk read failure"});
                            } else if seen > polls {
                                file["status"] = json!("PREPARED");
                                file["download_endpoint"] = json!({"uri": format!("https://vc.example/cls/data/{sid}/{name}")});
                            }
                        }
                        let out = file.clone();
                        if out["status"] == "PREPARED" {
                            let bytes = st
                                .files
                                .get(&item)
                                .and_then(|f| f.iter().find(|(n, _)| *n == name))
                                .map(|(_, b)| b.clone())
                                .unwrap_or_default();
                            st.blobs.insert(format!("https://vc.example/cls/data/{sid}/{name}"), bytes);
                        }
                        Ok(out)
                    }
                }
            }
            (Post, ["content", "library", "item", "download-session", sid, "file"]) => {
                let session = st.sessions.get_mut(*sid).ok_or_else(|| not_found(path))?;
                let name = string_at(&body, "file_name");
                let file = session["files"].get_mut(&name).ok_or_else(|| not_found(&name))?;
                file["status"] = json!("PREPARING");
                Ok(Value::Null)
            }

            _ => Err(not_found(path)),
        }
    }
}

#[async_trait]
impl RestApi for FakeRest {
    async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> VsResult<Value> {
        self.route(method, path, query, body)
    }

    async fn download(&self, url: &str, dest: &Path) -> VsResult<u64> {
        let bytes = self
            .state
            .lock()
            .unwrap()
            .blobs
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(url))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| VsError::transport(format!("write {}: {e}", dest.display())))?;
        Ok(bytes.len() as u64)
    }

    async fn logout(&self) -> VsResult<()> {
        self.state.lock().unwrap().logouts += 1;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  MOB side
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const MOB_VOID: &str = "<html><body><h1>Method Invocation Result: void</h1></body></html>";

#[derive(Default)]
pub struct FakeMob {
    responses: Mutex<VecDeque<String>>,
    posted: Mutex<Vec<(String, String, Vec<(String, String)>)>>,
    logouts: Mutex<usize>,
    logout_error: Mutex<Option<VsError>>,
}

impl FakeMob {
    /// Queue the HTML returned by the next form post.
    pub fn respond_with(&self, html: &str) {
        self.responses.lock().unwrap().push_back(html.to_string());
    }

    /// `(moid, method, form)` of every post.
    pub fn posted(&self) -> Vec<(String, String, Vec<(String, String)>)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn logout_count(&self) -> usize {
        *self.logouts.lock().unwrap()
    }

    pub fn fail_logout(&self, err: VsError) {
        *self.logout_error.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl MobApi for FakeMob {
    async fn invoke_form(&self, moid: &str, method: &str, form: &[(&str, String)]) -> VsResult<String> {
        self.posted.lock().unwrap().push((
            moid.to_string(),
            method.to_string(),
            form.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        ));
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MOB_VOID.to_string()))
    }

    async fn logout(&self) -> VsResult<()> {
        *self.logouts.lock().unwrap() += 1;
        match self.logout_error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
