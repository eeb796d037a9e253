//! In-memory vSphere backend for testing and development.
//!
//! Objects are stored as nested JSON property trees keyed by reference, so
//! retrieval and subscriptions behave like the real property collector:
//! projected dotted paths, missing properties omitted, vanished objects
//! reported as deleted. Tasks run synchronously on submit; guest-initiated
//! transitions (shutdown, reboot, reset) complete after a short delay.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::types::HeartbeatStatus;
use crate::vsphere::client::{ByteStream, DiskUploader, PropertyStream, TaskRequest, VimClient};
use crate::vsphere::device::{
    ControllerType, DeviceChange, DeviceOperation, DiskBacking, EthernetBacking, EthernetCard, FileOperation, VirtualController,
    VirtualDevice, VirtualDisk,
};
use crate::vsphere::mo::{self, kind, ManagedObjectReference, ObjectContent, QuestionInfo, TaskInfo, TaskState};
use crate::vsphere::specs::{
    ConfigSpec, CustomizationSpecItem, DeviceUrl, FileItem, ImportSpec, ImportSpecParams, ImportSpecResult,
    LeaseInfo,
};

type MoRef = ManagedObjectReference;

/// Default delay of guest-initiated state transitions.
const DEFAULT_GUEST_DELAY: Duration = Duration::from_millis(100);

fn lock_poisoned<T>(_: T) -> HypervisorError {
    HypervisorError::Internal("Lock poisoned".to_string())
}

fn reference(r: &MoRef) -> Value {
    json!({ "type": r.kind, "value": r.value })
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |value, part| value.get(part))
}

fn set_path(root: &mut Value, path: &[&str], value: Value) {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    if let Value::Object(map) = root {
        match path {
            [] => {}
            [last] => {
                map.insert(last.to_string(), value);
            }
            [head, rest @ ..] => set_path(map.entry(head.to_string()).or_insert(Value::Null), rest, value),
        }
    }
}

/// Two property paths overlap when one is a prefix of the other.
fn overlaps(a: &str, b: &str) -> bool {
    a == b || a.starts_with(&format!("{}.", b)) || b.starts_with(&format!("{}.", a))
}

fn set_device_key(device: &mut VirtualDevice, key: i32) {
    match device {
        VirtualDevice::EthernetCard(d) => d.key = key,
        VirtualDevice::Disk(d) => d.key = key,
        VirtualDevice::Controller(d) => d.key = key,
        VirtualDevice::Other(d) => d.key = key,
    }
}

fn set_controller_key(device: &mut VirtualDevice, key: i32) {
    match device {
        VirtualDevice::EthernetCard(d) => d.controller_key = Some(key),
        VirtualDevice::Disk(d) => d.controller_key = Some(key),
        VirtualDevice::Other(d) => d.controller_key = Some(key),
        VirtualDevice::Controller(_) => {}
    }
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Clone)]
struct PropertyChange {
    object: MoRef,
    path: String,
}

/// State of an import lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Ready,
    Completed,
    Aborted(String),
}

struct MockLease {
    pool: MoRef,
    folder: MoRef,
    host: Option<MoRef>,
    datastore: MoRef,
    params: ImportSpecParams,
    spec: ImportSpec,
    progress: Vec<i32>,
    state: LeaseState,
}

/// An answer submitted to a pending question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAnswer {
    pub vm: MoRef,
    pub question_id: String,
    pub answer: String,
}

#[derive(Default)]
struct MockState {
    objects: HashMap<MoRef, Value>,
    datacenters: Vec<MoRef>,
    /// Owning datacenter of folders and VMs
    owners: HashMap<MoRef, MoRef>,
    /// (datacenter, nesting depth, pool)
    pools: Vec<(MoRef, usize, MoRef)>,
    uuids: HashMap<String, MoRef>,
    ips: HashMap<MoRef, Vec<String>>,
    submitted: Vec<TaskRequest>,
    failures: HashMap<&'static str, String>,
    answers: Vec<RecordedAnswer>,
    pending_import: Option<(ImportSpecParams, MoRef)>,
    imports: Vec<ImportSpecParams>,
    leases: Vec<(MoRef, MockLease)>,
    custom_specs: HashMap<String, CustomizationSpecItem>,
    custom_fields: HashMap<String, i32>,
    field_values: HashMap<(MoRef, i32), String>,
    next_id: u64,
}

impl MockState {
    fn alloc(&mut self, kind: &str, prefix: &str) -> MoRef {
        self.next_id += 1;
        MoRef::new(kind, format!("{}-{}", prefix, self.next_id))
    }

    fn object_mut(&mut self, object: &MoRef) -> Result<&mut Value> {
        self.objects
            .get_mut(object)
            .ok_or_else(|| HypervisorError::ObjectDeleted(object.to_string()))
    }

    fn push_ref(&mut self, object: &MoRef, field: &str, item: &MoRef) -> Result<()> {
        let value = self.object_mut(object)?;
        match value.get_mut(field).and_then(Value::as_array_mut) {
            Some(list) => list.push(reference(item)),
            None => set_path(value, &[field], json!([reference(item)])),
        }
        Ok(())
    }

    fn refs(&self, object: &MoRef, field: &str) -> Vec<MoRef> {
        self.objects
            .get(object)
            .and_then(|v| v.get(field))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn name_of(&self, object: &MoRef) -> Option<String> {
        self.objects
            .get(object)
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    fn next_ip(&mut self) -> String {
        self.next_id += 1;
        format!("10.0.{}.{}", (self.next_id / 250) % 250, self.next_id % 250 + 1)
    }

    /// Register a new VM below `folder`.
    fn insert_vm(&mut self, folder: &MoRef, vm: MoRef, value: Value) -> Result<()> {
        if let Some(uuid) = get_path(&value, "config.instanceUuid").and_then(Value::as_str) {
            self.uuids.insert(uuid.to_string(), vm.clone());
        }
        if let Some(dc) = self.owners.get(folder).cloned() {
            self.owners.insert(vm.clone(), dc);
        }
        self.objects.insert(vm.clone(), value);
        self.push_ref(folder, "childEntity", &vm)
    }

    /// Apply a reconfiguration to the VM property tree `vm`.
    fn apply_config(&mut self, vm: &mut Value, spec: &ConfigSpec) -> std::result::Result<(), String> {
        let vm_name = vm.get("name").and_then(Value::as_str).unwrap_or("vm").to_string();
        let mut devices: Vec<VirtualDevice> = get_path(vm, "config.hardware.device")
            .map(|d| serde_json::from_value(d.clone()))
            .transpose()
            .map_err(|e| format!("corrupt device list: {}", e))?
            .unwrap_or_default();

        // Temporary (negative) keys of devices added in this change.
        let mut assigned: HashMap<i32, i32> = HashMap::new();
        for change in &spec.device_change {
            let mut device = change.device.clone();
            match change.operation {
                DeviceOperation::Add => {
                    if let Some(controller) = device.controller_key() {
                        if let Some(&key) = assigned.get(&controller) {
                            set_controller_key(&mut device, key);
                        }
                    }
                    if device.key() < 0 {
                        let next_key = devices.iter().map(|d| d.key()).max().unwrap_or(99).max(99) + 1;
                        assigned.insert(device.key(), next_key);
                        set_device_key(&mut device, next_key);
                    }
                    if let (Some(controller), Some(unit)) = (device.controller_key(), device.unit_number()) {
                        if unit < 0 {
                            let used = devices.iter().filter(|d| d.controller_key() == Some(controller)).count();
                            if let Some(slot) = device.unit_number_mut() {
                                *slot = used as i32;
                            }
                        }
                    }
                    match &mut device {
                        VirtualDevice::Disk(disk)
                            if change.file_operation == Some(FileOperation::Create)
                                && disk.backing.file_name.is_empty() =>
                        {
                            let datastore = disk
                                .backing
                                .datastore
                                .as_ref()
                                .and_then(|d| self.name_of(d))
                                .unwrap_or_else(|| "datastore1".to_string());
                            let index = devices.iter().filter(|d| matches!(d, VirtualDevice::Disk(_))).count();
                            disk.backing.file_name = if index == 0 {
                                format!("[{}] {}/{}.vmdk", datastore, vm_name, vm_name)
                            } else {
                                format!("[{}] {}/{}_{}.vmdk", datastore, vm_name, vm_name, index)
                            };
                        }
                        VirtualDevice::EthernetCard(card) if card.mac_address.is_none() => {
                            self.next_id += 1;
                            card.mac_address = Some(format!("00:50:56:00:{:02x}:{:02x}", self.next_id / 256 % 256, self.next_id % 256));
                        }
                        _ => {}
                    }
                    devices.push(device);
                }
                DeviceOperation::Edit => {
                    let slot = devices
                        .iter_mut()
                        .find(|d| d.key() == device.key())
                        .ok_or_else(|| format!("device {} not found", device.key()))?;
                    *slot = device;
                }
                DeviceOperation::Remove => {
                    let before = devices.len();
                    devices.retain(|d| d.key() != device.key());
                    if devices.len() == before {
                        return Err(format!("device {} not found", device.key()));
                    }
                }
            }
        }

        let devices = serde_json::to_value(devices).map_err(|e| e.to_string())?;
        set_path(vm, &["config", "hardware", "device"], devices);
        if let Some(cpus) = spec.num_cpus {
            set_path(vm, &["config", "hardware", "numCPU"], json!(cpus));
        }
        if let Some(memory) = spec.memory_mb {
            set_path(vm, &["config", "hardware", "memoryMB"], json!(memory));
        }
        if let Some(enabled) = spec.cpu_hot_add_enabled {
            set_path(vm, &["config", "cpuHotAddEnabled"], json!(enabled));
        }
        if let Some(enabled) = spec.memory_hot_add_enabled {
            set_path(vm, &["config", "memoryHotAddEnabled"], json!(enabled));
        }
        if let Some(enabled) = spec.nested_hv_enabled {
            set_path(vm, &["config", "nestedHVEnabled"], json!(enabled));
        }
        Ok(())
    }
}

/// Shared state plus the change feed subscriptions listen on.
#[derive(Clone)]
struct Store {
    state: Arc<RwLock<MockState>>,
    changes: broadcast::Sender<PropertyChange>,
}

impl Store {
    fn read(&self) -> Result<RwLockReadGuard<'_, MockState>> {
        self.state.read().map_err(lock_poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MockState>> {
        self.state.write().map_err(lock_poisoned)
    }

    fn notify(&self, object: &MoRef, path: &str) {
        // No subscribers is fine.
        let _ = self.changes.send(PropertyChange {
            object: object.clone(),
            path: path.to_string(),
        });
    }

    fn get(&self, object: &MoRef, path: &str) -> Result<Value> {
        let state = self.read()?;
        let value = state
            .objects
            .get(object)
            .ok_or_else(|| HypervisorError::ObjectDeleted(object.to_string()))?;
        Ok(get_path(value, path).cloned().unwrap_or(Value::Null))
    }

    fn set(&self, object: &MoRef, path: &str, value: Value) -> Result<()> {
        {
            let mut state = self.write()?;
            let parts: Vec<&str> = path.split('.').collect();
            set_path(state.object_mut(object)?, &parts, value);
        }
        self.notify(object, path);
        Ok(())
    }

    fn set_many(&self, object: &MoRef, updates: &[(&str, Value)]) -> Result<()> {
        for (path, value) in updates {
            self.set(object, path, value.clone())?;
        }
        Ok(())
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

/// References created by [`MockVimClient::add_datacenter`].
#[derive(Debug, Clone)]
pub struct MockDatacenter {
    pub reference: MoRef,
    pub vm_folder: MoRef,
    pub host_folder: MoRef,
}

/// Builder for a VM or template placed with [`MockVimClient::add_vm`].
#[derive(Debug, Clone)]
pub struct VmFixture {
    name: String,
    instance_uuid: String,
    template: bool,
    num_cpu: i32,
    memory_mb: i32,
    devices: Vec<VirtualDevice>,
    host: Option<MoRef>,
    datastores: Vec<MoRef>,
    powered_on: bool,
    guest_state: mo::GuestState,
    heartbeat: HeartbeatStatus,
    tools_running: bool,
    ips: Vec<String>,
    dns_servers: Vec<String>,
    question: Option<QuestionInfo>,
    snapshot: bool,
}

impl VmFixture {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_uuid: uuid::Uuid::new_v4().to_string(),
            template: false,
            num_cpu: 2,
            memory_mb: 2048,
            devices: Vec::new(),
            host: None,
            datastores: Vec::new(),
            powered_on: false,
            guest_state: mo::GuestState::NotRunning,
            heartbeat: HeartbeatStatus::Gray,
            tools_running: false,
            ips: Vec::new(),
            dns_servers: Vec::new(),
            question: None,
            snapshot: false,
        }
    }

    /// A template with one SCSI controller, a 10 GB disk and one NIC.
    pub fn template(name: impl Into<String>) -> Self {
        let name = name.into();
        let file = format!("[datastore1] {}/{}.vmdk", name, name);
        Self::new(name)
            .as_template()
            .with_scsi_controller(1000)
            .with_disk(2000, 1000, 0, file, 10)
            .with_nic(4000)
    }

    pub fn as_template(mut self) -> Self {
        self.template = true;
        self
    }

    pub fn with_instance_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.instance_uuid = uuid.into();
        self
    }

    pub fn with_hardware(mut self, num_cpu: i32, memory_mb: i32) -> Self {
        self.num_cpu = num_cpu;
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_scsi_controller(mut self, key: i32) -> Self {
        self.devices.push(VirtualDevice::Controller(VirtualController {
            key,
            controller_type: ControllerType::ParaVirtual,
            bus_number: 0,
            device: Vec::new(),
        }));
        self
    }

    pub fn with_disk(mut self, key: i32, controller: i32, unit: i32, file: impl Into<String>, size_gb: i64) -> Self {
        self.devices.push(VirtualDevice::Disk(VirtualDisk {
            key,
            controller_key: Some(controller),
            unit_number: Some(unit),
            capacity_in_kb: size_gb * 1024 * 1024,
            backing: DiskBacking {
                file_name: file.into(),
                thin_provisioned: Some(true),
                disk_mode: "persistent".to_string(),
                ..Default::default()
            },
        }));
        self
    }

    pub fn with_nic(mut self, key: i32) -> Self {
        self.devices.push(VirtualDevice::EthernetCard(EthernetCard {
            key,
            ..Default::default()
        }));
        self
    }

    pub fn with_nic_on(mut self, key: i32, network: &MoRef, name: &str) -> Self {
        self.devices.push(VirtualDevice::EthernetCard(EthernetCard {
            key,
            backing: Some(EthernetBacking::Network {
                device_name: name.to_string(),
                network: network.clone(),
            }),
            ..Default::default()
        }));
        self
    }

    pub fn on_host(mut self, host: &MoRef) -> Self {
        self.host = Some(host.clone());
        self
    }

    pub fn with_datastore(mut self, datastore: &MoRef) -> Self {
        self.datastores.push(datastore.clone());
        self
    }

    /// Powered on with running tools and a green heartbeat.
    pub fn running(mut self) -> Self {
        self.powered_on = true;
        self.guest_state = mo::GuestState::Running;
        self.heartbeat = HeartbeatStatus::Green;
        self.tools_running = true;
        self
    }

    pub fn with_guest_state(mut self, state: mo::GuestState) -> Self {
        self.guest_state = state;
        self
    }

    pub fn with_heartbeat(mut self, status: HeartbeatStatus) -> Self {
        self.heartbeat = status;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ips.push(ip.into());
        self
    }

    pub fn with_dns_server(mut self, server: impl Into<String>) -> Self {
        self.dns_servers.push(server.into());
        self
    }

    pub fn with_question(mut self, question: QuestionInfo) -> Self {
        self.question = Some(question);
        self
    }

    /// Give the VM a current snapshot (linked clone source).
    pub fn with_snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    fn to_value(&self, snapshot: Option<&MoRef>) -> Result<Value> {
        let devices = serde_json::to_value(&self.devices).map_err(|e| HypervisorError::Internal(e.to_string()))?;
        let guest_state = serde_json::to_value(self.guest_state).map_err(|e| HypervisorError::Internal(e.to_string()))?;
        let net = if self.powered_on && !self.ips.is_empty() {
            json!([{ "network": "VM Network", "ipAddress": self.ips }])
        } else {
            json!([])
        };
        Ok(json!({
            "name": self.name,
            "config": {
                "instanceUuid": self.instance_uuid,
                "template": self.template,
                "hardware": { "numCPU": self.num_cpu, "memoryMB": self.memory_mb, "device": devices },
            },
            "datastore": self.datastores.iter().map(reference).collect::<Vec<_>>(),
            "guest": {
                "guestState": guest_state,
                "toolsRunningStatus": if self.tools_running { "guestToolsRunning" } else { "guestToolsNotRunning" },
                "net": net,
                "ipStack": [{ "dnsConfig": { "ipAddress": self.dns_servers } }],
            },
            "guestHeartbeatStatus": self.heartbeat,
            "snapshot": { "currentSnapshot": snapshot.map(reference) },
            "runtime": {
                "powerState": if self.powered_on { "poweredOn" } else { "poweredOff" },
                "host": self.host.as_ref().map(reference),
                "question": self.question,
            },
            "recentTask": [],
        }))
    }
}

// =============================================================================
// MOCK CLIENT
// =============================================================================

/// In-memory [`VimClient`].
pub struct MockVimClient {
    store: Store,
    guest_delay: Duration,
}

impl MockVimClient {
    pub fn new() -> Self {
        info!("Creating mock vSphere backend");
        let (changes, _) = broadcast::channel(256);
        Self {
            store: Store {
                state: Arc::new(RwLock::new(MockState::default())),
                changes,
            },
            guest_delay: DEFAULT_GUEST_DELAY,
        }
    }

    /// Delay of guest-initiated transitions.
    pub fn with_guest_delay(mut self, delay: Duration) -> Self {
        self.guest_delay = delay;
        self
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    pub fn add_datacenter(&self, name: &str) -> Result<MockDatacenter> {
        let mut state = self.store.write()?;
        let dc = state.alloc(kind::DATACENTER, "datacenter");
        let vm_folder = state.alloc(kind::FOLDER, "group-v");
        let host_folder = state.alloc(kind::FOLDER, "group-h");

        state.objects.insert(vm_folder.clone(), json!({ "name": "vm", "childEntity": [] }));
        state.objects.insert(host_folder.clone(), json!({ "name": "host", "childEntity": [] }));
        state.objects.insert(
            dc.clone(),
            json!({
                "name": name,
                "vmFolder": reference(&vm_folder),
                "hostFolder": reference(&host_folder),
                "datastore": [],
                "network": [],
            }),
        );
        state.owners.insert(vm_folder.clone(), dc.clone());
        state.owners.insert(host_folder.clone(), dc.clone());
        state.datacenters.push(dc.clone());

        Ok(MockDatacenter {
            reference: dc,
            vm_folder,
            host_folder,
        })
    }

    pub fn add_folder(&self, parent: &MoRef, name: &str) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let folder = state.alloc(kind::FOLDER, "group");
        state.objects.insert(folder.clone(), json!({ "name": name, "childEntity": [] }));
        if let Some(dc) = state.owners.get(parent).cloned() {
            state.owners.insert(folder.clone(), dc);
        }
        state.push_ref(parent, "childEntity", &folder)?;
        Ok(folder)
    }

    /// A standard port group.
    pub fn add_network(&self, dc: &MockDatacenter, name: &str) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let network = state.alloc(kind::NETWORK, "network");
        state.objects.insert(network.clone(), json!({ "name": name }));
        state.push_ref(&dc.reference, "network", &network)?;
        Ok(network)
    }

    /// A distributed port group on a new switch with `switch_uuid`.
    pub fn add_portgroup(&self, dc: &MockDatacenter, name: &str, switch_uuid: &str) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let switch = state.alloc("VmwareDistributedVirtualSwitch", "dvs");
        let portgroup = state.alloc(kind::DISTRIBUTED_PORTGROUP, "dvportgroup");
        state.objects.insert(switch.clone(), json!({ "name": format!("{}-switch", name), "uuid": switch_uuid }));
        state.objects.insert(
            portgroup.clone(),
            json!({
                "name": name,
                "key": portgroup.value,
                "config": { "distributedVirtualSwitch": reference(&switch) },
            }),
        );
        state.push_ref(&dc.reference, "network", &portgroup)?;
        Ok(portgroup)
    }

    pub fn add_datastore(&self, dc: &MockDatacenter, name: &str) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let datastore = state.alloc(kind::DATASTORE, "datastore");
        state.objects.insert(datastore.clone(), json!({ "name": name, "info": { "name": name } }));
        state.push_ref(&dc.reference, "datastore", &datastore)?;
        Ok(datastore)
    }

    pub fn add_host(&self, name: &str, networks: &[MoRef], datastores: &[MoRef]) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let host = state.alloc(kind::HOST_SYSTEM, "host");
        state.objects.insert(
            host.clone(),
            json!({
                "name": name,
                "network": networks.iter().map(reference).collect::<Vec<_>>(),
                "datastore": datastores.iter().map(reference).collect::<Vec<_>>(),
            }),
        );
        Ok(host)
    }

    /// A standalone host wrapped in a compute resource below `parent`
    /// (usually the host folder).
    pub fn add_compute_resource(&self, dc: &MockDatacenter, parent: &MoRef, name: &str, host: &MoRef) -> Result<MoRef> {
        self.add_placement_target(dc, parent, kind::COMPUTE_RESOURCE, "domain-s", name, &[host.clone()], None)
    }

    pub fn add_cluster(
        &self,
        dc: &MockDatacenter,
        parent: &MoRef,
        name: &str,
        hosts: &[MoRef],
        drs_enabled: bool,
    ) -> Result<MoRef> {
        self.add_placement_target(
            dc,
            parent,
            kind::CLUSTER_COMPUTE_RESOURCE,
            "domain-c",
            name,
            hosts,
            Some(drs_enabled),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn add_placement_target(
        &self,
        dc: &MockDatacenter,
        parent: &MoRef,
        target_kind: &str,
        prefix: &str,
        name: &str,
        hosts: &[MoRef],
        drs_enabled: Option<bool>,
    ) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let target = state.alloc(target_kind, prefix);
        let pool = state.alloc(kind::RESOURCE_POOL, "resgroup");

        let mut networks: Vec<MoRef> = Vec::new();
        let mut datastores: Vec<MoRef> = Vec::new();
        for host in hosts {
            for network in state.refs(host, "network") {
                if !networks.contains(&network) {
                    networks.push(network);
                }
            }
            for datastore in state.refs(host, "datastore") {
                if !datastores.contains(&datastore) {
                    datastores.push(datastore);
                }
            }
        }

        let mut value = json!({
            "name": name,
            "host": hosts.iter().map(reference).collect::<Vec<_>>(),
            "resourcePool": reference(&pool),
            "datastore": datastores.iter().map(reference).collect::<Vec<_>>(),
            "network": networks.iter().map(reference).collect::<Vec<_>>(),
        });
        if let Some(enabled) = drs_enabled {
            set_path(&mut value, &["configuration", "drsConfig", "enabled"], json!(enabled));
        }

        state.objects.insert(pool.clone(), json!({ "name": "Resources", "owner": reference(&target) }));
        state.objects.insert(target.clone(), value);
        state.pools.push((dc.reference.clone(), 0, pool));
        state.push_ref(parent, "childEntity", &target)?;
        Ok(target)
    }

    /// A resource pool `depth` levels below the root pool of `owner`.
    pub fn add_resource_pool(&self, dc: &MockDatacenter, owner: &MoRef, name: &str, depth: usize) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let pool = state.alloc(kind::RESOURCE_POOL, "resgroup");
        state.objects.insert(pool.clone(), json!({ "name": name, "owner": reference(owner) }));
        state.pools.push((dc.reference.clone(), depth, pool.clone()));
        Ok(pool)
    }

    pub fn add_vm(&self, folder: &MoRef, fixture: VmFixture) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let vm = state.alloc(kind::VIRTUAL_MACHINE, "vm");
        let snapshot = if fixture.snapshot {
            let snapshot = state.alloc("VirtualMachineSnapshot", "snapshot");
            state.objects.insert(snapshot.clone(), json!({ "name": format!("snapshot-{}", fixture.name) }));
            Some(snapshot)
        } else {
            None
        };
        let value = fixture.to_value(snapshot.as_ref())?;
        if !fixture.ips.is_empty() {
            state.ips.insert(vm.clone(), fixture.ips.clone());
        }
        state.insert_vm(folder, vm.clone(), value)?;
        Ok(vm)
    }

    /// Attach a task in `task_state` to the VM's recent tasks.
    pub fn add_recent_task(&self, vm: &MoRef, task_state: TaskState) -> Result<MoRef> {
        let task = {
            let mut state = self.store.write()?;
            let task = state.alloc(kind::TASK, "task");
            let info = TaskInfo {
                key: task.value.clone(),
                state: task_state,
                queue_time: Some(Utc::now()),
                ..Default::default()
            };
            let info = serde_json::to_value(info).map_err(|e| HypervisorError::Internal(e.to_string()))?;
            state.objects.insert(task.clone(), json!({ "info": info }));
            state.push_ref(vm, "recentTask", &task)?;
            task
        };
        self.store.notify(vm, "recentTask");
        Ok(task)
    }

    /// Overwrite one property and notify subscribers.
    pub fn set_property(&self, object: &MoRef, path: &str, value: Value) -> Result<()> {
        self.store.set(object, path, value)
    }

    /// Delete an object without unlinking it from its parent.
    pub fn remove_object(&self, object: &MoRef) -> Result<()> {
        self.store.write()?.objects.remove(object);
        Ok(())
    }

    /// Make the next task of `operation` (e.g. `"clone"`) fail with `fault`.
    pub fn fail_next(&self, operation: &'static str, fault: impl Into<String>) -> Result<()> {
        self.store.write()?.failures.insert(operation, fault.into());
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn submitted(&self) -> Vec<TaskRequest> {
        self.store.read().map(|s| s.submitted.clone()).unwrap_or_default()
    }

    pub fn answers(&self) -> Vec<RecordedAnswer> {
        self.store.read().map(|s| s.answers.clone()).unwrap_or_default()
    }

    pub fn imports(&self) -> Vec<ImportSpecParams> {
        self.store.read().map(|s| s.imports.clone()).unwrap_or_default()
    }

    /// State and progress reports of every lease, in creation order.
    pub fn leases(&self) -> Vec<(LeaseState, Vec<i32>)> {
        self.store
            .read()
            .map(|s| s.leases.iter().map(|(_, l)| (l.state.clone(), l.progress.clone())).collect())
            .unwrap_or_default()
    }

    /// A property value, `None` if the object or the property is absent.
    pub fn property(&self, object: &MoRef, path: &str) -> Option<Value> {
        self.store.get(object, path).ok().filter(|v| !v.is_null())
    }

    /// First VM or template named `name`.
    pub fn find_by_name(&self, name: &str) -> Option<MoRef> {
        let state = self.store.read().ok()?;
        let mut found: Vec<&MoRef> = state
            .objects
            .iter()
            .filter(|(r, v)| r.is(kind::VIRTUAL_MACHINE) && v.get("name").and_then(Value::as_str) == Some(name))
            .map(|(r, _)| r)
            .collect();
        found.sort();
        found.first().map(|r| (*r).clone())
    }

    /// Typed view of a VM's full property tree.
    pub fn vm(&self, object: &MoRef) -> Option<mo::VirtualMachine> {
        let state = self.store.read().ok()?;
        let value = state.objects.get(object)?.clone();
        let mut vm: mo::VirtualMachine = serde_json::from_value(value).ok()?;
        vm.reference = object.clone();
        Some(vm)
    }

    pub fn custom_field(&self, object: &MoRef, name: &str) -> Option<String> {
        let state = self.store.read().ok()?;
        let key = state.custom_fields.get(name)?;
        state.field_values.get(&(object.clone(), *key)).cloned()
    }

    pub fn custom_spec_names(&self) -> Vec<String> {
        self.store
            .read()
            .map(|s| s.custom_specs.keys().cloned().collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Task execution
    // =========================================================================

    /// Apply `updates` to `object` after the guest delay.
    fn later(&self, object: &MoRef, updates: Vec<(&'static str, Value)>) {
        let store = self.store.clone();
        let object = object.clone();
        let delay = self.guest_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = store.set_many(&object, &updates) {
                debug!(object = %object, error = %e, "Delayed guest transition dropped");
            }
        });
    }

    fn execute(&self, request: &TaskRequest) -> Result<Option<MoRef>> {
        match request {
            TaskRequest::Clone { vm, folder, name, spec } => {
                let clone = {
                    let mut state = self.store.write()?;
                    let mut value = state
                        .objects
                        .get(vm)
                        .cloned()
                        .ok_or_else(|| HypervisorError::ObjectDeleted(vm.to_string()))?;
                    let clone = state.alloc(kind::VIRTUAL_MACHINE, "vm");

                    set_path(&mut value, &["name"], json!(name));
                    if let Some(config) = &spec.config {
                        state.apply_config(&mut value, config).map_err(HypervisorError::Backend)?;
                    }
                    set_path(&mut value, &["config", "template"], json!(false));
                    set_path(&mut value, &["config", "instanceUuid"], json!(uuid::Uuid::new_v4().to_string()));
                    set_path(&mut value, &["runtime", "powerState"], json!("poweredOff"));
                    set_path(&mut value, &["runtime", "question"], Value::Null);
                    if let Some(host) = &spec.location.host {
                        set_path(&mut value, &["runtime", "host"], reference(host));
                    }
                    if let Some(pool) = &spec.location.pool {
                        set_path(&mut value, &["resourcePool"], reference(pool));
                    }
                    if let Some(datastore) = &spec.location.datastore {
                        set_path(&mut value, &["datastore"], json!([reference(datastore)]));
                    }
                    set_path(&mut value, &["guest", "guestState"], json!("notRunning"));
                    set_path(&mut value, &["guest", "toolsRunningStatus"], json!("guestToolsNotRunning"));
                    set_path(&mut value, &["guest", "net"], json!([]));
                    set_path(&mut value, &["guestHeartbeatStatus"], json!("gray"));
                    set_path(&mut value, &["snapshot"], Value::Null);
                    set_path(&mut value, &["recentTask"], json!([]));

                    state.insert_vm(folder, clone.clone(), value)?;
                    clone
                };
                self.store.notify(folder, "childEntity");
                Ok(Some(clone))
            }
            TaskRequest::PowerOn { vm } => {
                let ips = {
                    let mut state = self.store.write()?;
                    match state.ips.get(vm).cloned() {
                        Some(ips) => ips,
                        None => {
                            let ips = vec![state.next_ip()];
                            state.ips.insert(vm.clone(), ips.clone());
                            ips
                        }
                    }
                };
                self.store.set_many(
                    vm,
                    &[
                        ("runtime.powerState", json!("poweredOn")),
                        ("guest.guestState", json!("running")),
                        ("guest.toolsRunningStatus", json!("guestToolsRunning")),
                        ("guestHeartbeatStatus", json!("green")),
                        ("guest.net", json!([{ "network": "VM Network", "ipAddress": ips }])),
                    ],
                )?;
                Ok(None)
            }
            TaskRequest::PowerOff { vm } => {
                self.store.set_many(
                    vm,
                    &[
                        ("runtime.powerState", json!("poweredOff")),
                        ("guest.guestState", json!("notRunning")),
                        ("guestHeartbeatStatus", json!("gray")),
                        ("guest.net", json!([])),
                    ],
                )?;
                Ok(None)
            }
            TaskRequest::Reset { vm } => {
                self.store.set(vm, "guestHeartbeatStatus", json!("red"))?;
                self.later(
                    vm,
                    vec![
                        ("guest.guestState", json!("running")),
                        ("guestHeartbeatStatus", json!("green")),
                    ],
                );
                Ok(None)
            }
            TaskRequest::Reconfigure { vm, spec } => {
                {
                    let mut state = self.store.write()?;
                    let mut value = state
                        .objects
                        .get(vm)
                        .cloned()
                        .ok_or_else(|| HypervisorError::ObjectDeleted(vm.to_string()))?;
                    state.apply_config(&mut value, spec).map_err(HypervisorError::Backend)?;
                    state.objects.insert(vm.clone(), value);
                }
                self.store.notify(vm, "config");
                Ok(None)
            }
            TaskRequest::CreateSnapshot { vm, name, .. } => {
                let snapshot = {
                    let mut state = self.store.write()?;
                    let snapshot = state.alloc("VirtualMachineSnapshot", "snapshot");
                    state.objects.insert(snapshot.clone(), json!({ "name": name }));
                    snapshot
                };
                self.store.set(vm, "snapshot.currentSnapshot", reference(&snapshot))?;
                Ok(Some(snapshot))
            }
            TaskRequest::Destroy { vm } => {
                let mut state = self.store.write()?;
                state.objects.remove(vm);
                state.uuids.retain(|_, r| r != vm);
                state.ips.remove(vm);
                let item = reference(vm);
                for value in state.objects.values_mut() {
                    if let Some(children) = value.get_mut("childEntity").and_then(Value::as_array_mut) {
                        children.retain(|c| c != &item);
                    }
                }
                Ok(None)
            }
        }
    }
}

impl Default for MockVimClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VimClient for MockVimClient {
    async fn retrieve(&self, objects: &[MoRef], properties: &[&str]) -> Result<Vec<ObjectContent>> {
        let state = self.store.read()?;
        objects
            .iter()
            .map(|object| {
                let value = state
                    .objects
                    .get(object)
                    .ok_or_else(|| HypervisorError::ObjectDeleted(object.to_string()))?;
                let mut projected = Map::new();
                for property in properties {
                    if let Some(found) = get_path(value, property) {
                        projected.insert(property.to_string(), found.clone());
                    }
                }
                Ok(ObjectContent {
                    obj: object.clone(),
                    properties: projected,
                })
            })
            .collect()
    }

    async fn watch(&self, object: &MoRef, property: &str) -> Result<PropertyStream> {
        // Subscribe before reading so no change can slip in between.
        let receiver = self.store.changes.subscribe();
        let current = self.store.get(object, property)?;

        let store = self.store.clone();
        let object = object.clone();
        let property = property.to_string();
        let updates = stream::unfold(receiver, move |mut receiver| {
            let store = store.clone();
            let object = object.clone();
            let property = property.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(change) if change.object == object && overlaps(&change.path, &property) => {
                            return Some((store.get(&object, &property), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            return Some((store.get(&object, &property), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::once(async move { Ok(current) }).chain(updates).boxed())
    }

    async fn datacenters(&self) -> Result<Vec<MoRef>> {
        Ok(self.store.read()?.datacenters.clone())
    }

    async fn resource_pools(&self, datacenter: &MoRef, path: &str) -> Result<Vec<MoRef>> {
        let depth = path.matches("/*").count();
        let pools: Vec<MoRef> = self
            .store
            .read()?
            .pools
            .iter()
            .filter(|(dc, d, _)| dc == datacenter && *d == depth)
            .map(|(_, _, pool)| pool.clone())
            .collect();
        if pools.is_empty() {
            return Err(HypervisorError::not_found(path, "no resource pools match"));
        }
        Ok(pools)
    }

    async fn find_by_instance_uuid(&self, datacenter: Option<&MoRef>, uuid: &str) -> Result<Option<MoRef>> {
        let state = self.store.read()?;
        let Some(found) = state.uuids.get(uuid) else {
            return Ok(None);
        };
        match datacenter {
            Some(dc) if state.owners.get(found) != Some(dc) => Ok(None),
            _ => Ok(Some(found.clone())),
        }
    }

    #[instrument(skip(self, request), fields(operation = request.operation()))]
    async fn submit(&self, request: TaskRequest) -> Result<MoRef> {
        let (task, failure) = {
            let mut state = self.store.write()?;
            state.submitted.push(request.clone());
            let task = state.alloc(kind::TASK, "task");
            (task, state.failures.remove(request.operation()))
        };

        let queued = Utc::now();
        let outcome = match failure {
            Some(fault) => Err(fault),
            None => self.execute(&request).map_err(|e| e.to_string()),
        };
        let info = match outcome {
            Ok(result) => TaskInfo {
                key: task.value.clone(),
                state: TaskState::Success,
                result,
                queue_time: Some(queued),
                complete_time: Some(Utc::now()),
                ..Default::default()
            },
            Err(fault) => {
                warn!(fault = %fault, "Mock task failed");
                TaskInfo {
                    key: task.value.clone(),
                    state: TaskState::Error,
                    error: Some(fault),
                    queue_time: Some(queued),
                    complete_time: Some(Utc::now()),
                    ..Default::default()
                }
            }
        };

        let info = serde_json::to_value(info).map_err(|e| HypervisorError::Internal(e.to_string()))?;
        self.store.write()?.objects.insert(task.clone(), json!({ "info": info }));
        Ok(task)
    }

    async fn wait_for_task(&self, task: &MoRef) -> Result<TaskInfo> {
        let info = self.store.get(task, "info")?;
        serde_json::from_value(info).map_err(|e| HypervisorError::Internal(e.to_string()))
    }

    async fn shutdown_guest(&self, vm: &MoRef) -> Result<()> {
        self.store.set(vm, "guest.guestState", json!("shuttingDown"))?;
        self.later(
            vm,
            vec![
                ("guest.guestState", json!("notRunning")),
                ("runtime.powerState", json!("poweredOff")),
                ("guestHeartbeatStatus", json!("gray")),
                ("guest.net", json!([])),
            ],
        );
        Ok(())
    }

    async fn reboot_guest(&self, vm: &MoRef) -> Result<()> {
        self.store.set(vm, "guestHeartbeatStatus", json!("gray"))?;
        self.later(vm, vec![("guestHeartbeatStatus", json!("green"))]);
        Ok(())
    }

    async fn mark_as_template(&self, vm: &MoRef) -> Result<()> {
        self.store.set(vm, "config.template", json!(true))
    }

    async fn answer_vm(&self, vm: &MoRef, question_id: &str, answer: &str) -> Result<()> {
        self.store.write()?.answers.push(RecordedAnswer {
            vm: vm.clone(),
            question_id: question_id.to_string(),
            answer: answer.to_string(),
        });
        self.store.set(vm, "runtime.question", Value::Null)
    }

    async fn create_import_spec(
        &self,
        ovf_descriptor: &str,
        _pool: &MoRef,
        datastore: &MoRef,
        params: &ImportSpecParams,
    ) -> Result<ImportSpecResult> {
        let href = Regex::new(r#"href="([^"]+)""#).map_err(|e| HypervisorError::Internal(e.to_string()))?;
        let Some(file) = href.captures(ovf_descriptor).and_then(|c| c.get(1)) else {
            return Ok(ImportSpecResult {
                error: vec!["descriptor references no disk".to_string()],
                ..Default::default()
            });
        };

        let mut state = self.store.write()?;
        state.imports.push(params.clone());
        state.pending_import = Some((params.clone(), datastore.clone()));

        let controller = VirtualDevice::Controller(VirtualController {
            key: -100,
            controller_type: ControllerType::ParaVirtual,
            bus_number: 0,
            device: Vec::new(),
        });
        let disk = VirtualDevice::Disk(VirtualDisk {
            key: -101,
            controller_key: Some(-100),
            unit_number: Some(0),
            capacity_in_kb: 10 * 1024 * 1024,
            backing: DiskBacking {
                datastore: Some(datastore.clone()),
                thin_provisioned: Some(params.disk_provisioning == "thin"),
                disk_mode: "persistent".to_string(),
                ..Default::default()
            },
        });

        Ok(ImportSpecResult {
            import_spec: ImportSpec {
                config_spec: ConfigSpec {
                    num_cpus: Some(1),
                    memory_mb: Some(1024),
                    device_change: vec![DeviceChange::add(controller), DeviceChange::create(disk)],
                    ..Default::default()
                },
            },
            file_item: vec![FileItem {
                device_id: "disk-0".to_string(),
                path: file.as_str().to_string(),
                size: None,
            }],
            ..Default::default()
        })
    }

    async fn import_vapp(
        &self,
        pool: &MoRef,
        spec: &ImportSpec,
        folder: &MoRef,
        host: Option<&MoRef>,
    ) -> Result<MoRef> {
        let mut state = self.store.write()?;
        let (params, datastore) = state
            .pending_import
            .take()
            .ok_or_else(|| HypervisorError::Backend("no import spec was created".to_string()))?;
        let lease = state.alloc(kind::LEASE, "lease");
        state.leases.push((
            lease.clone(),
            MockLease {
                pool: pool.clone(),
                folder: folder.clone(),
                host: host.cloned(),
                datastore,
                params,
                spec: spec.clone(),
                progress: Vec::new(),
                state: LeaseState::Ready,
            },
        ));
        Ok(lease)
    }

    async fn lease_wait(&self, lease: &MoRef) -> Result<LeaseInfo> {
        let state = self.store.read()?;
        let (_, found) = state
            .leases
            .iter()
            .find(|(r, _)| r == lease)
            .ok_or_else(|| HypervisorError::ObjectDeleted(lease.to_string()))?;
        if found.state != LeaseState::Ready {
            return Err(HypervisorError::Backend(format!("lease {} is no longer ready", lease)));
        }
        Ok(LeaseInfo {
            device_url: vec![DeviceUrl {
                import_key: "disk-0".to_string(),
                url: format!("https://*/nfc/{}/disk-0.vmdk", lease.value),
            }],
        })
    }

    async fn lease_progress(&self, lease: &MoRef, percent: i32) -> Result<()> {
        let mut state = self.store.write()?;
        if let Some((_, found)) = state.leases.iter_mut().find(|(r, _)| r == lease) {
            found.progress.push(percent);
        }
        Ok(())
    }

    async fn lease_complete(&self, lease: &MoRef) -> Result<()> {
        let mut state = self.store.write()?;
        let index = state
            .leases
            .iter()
            .position(|(r, _)| r == lease)
            .ok_or_else(|| HypervisorError::ObjectDeleted(lease.to_string()))?;

        let (folder, pool, host, datastore, params, spec) = {
            let found = &state.leases[index].1;
            (
                found.folder.clone(),
                found.pool.clone(),
                found.host.clone(),
                found.datastore.clone(),
                found.params.clone(),
                found.spec.clone(),
            )
        };

        let vm = state.alloc(kind::VIRTUAL_MACHINE, "vm");
        let mut value = json!({
            "name": params.entity_name,
            "config": {
                "instanceUuid": uuid::Uuid::new_v4().to_string(),
                "template": false,
                "hardware": { "numCPU": 1, "memoryMB": 1024, "device": [] },
            },
            "datastore": [reference(&datastore)],
            "guest": { "guestState": "notRunning", "net": [] },
            "guestHeartbeatStatus": "gray",
            "runtime": { "powerState": "poweredOff", "host": host.as_ref().map(reference) },
            "resourcePool": reference(&pool),
            "recentTask": [],
        });
        state
            .apply_config(&mut value, &spec.config_spec)
            .map_err(HypervisorError::Backend)?;
        state.insert_vm(&folder, vm, value)?;
        state.leases[index].1.state = LeaseState::Completed;
        Ok(())
    }

    async fn lease_abort(&self, lease: &MoRef, reason: &str) -> Result<()> {
        let mut state = self.store.write()?;
        if let Some((_, found)) = state.leases.iter_mut().find(|(r, _)| r == lease) {
            found.state = LeaseState::Aborted(reason.to_string());
        }
        Ok(())
    }

    async fn customization_spec_exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.read()?.custom_specs.contains_key(name))
    }

    async fn create_customization_spec(&self, item: CustomizationSpecItem) -> Result<()> {
        let mut state = self.store.write()?;
        if state.custom_specs.contains_key(&item.info.name) {
            return Err(HypervisorError::Backend(format!(
                "customization spec {} already exists",
                item.info.name
            )));
        }
        state.custom_specs.insert(item.info.name.clone(), item);
        Ok(())
    }

    async fn customization_spec(&self, name: &str) -> Result<CustomizationSpecItem> {
        self.store
            .read()?
            .custom_specs
            .get(name)
            .cloned()
            .ok_or_else(|| HypervisorError::not_found(name, "customization spec not found"))
    }

    async fn custom_field_key(&self, name: &str) -> Result<Option<i32>> {
        Ok(self.store.read()?.custom_fields.get(name).copied())
    }

    async fn add_custom_field(&self, name: &str, _kind: &str) -> Result<i32> {
        let mut state = self.store.write()?;
        let key = 100 + state.custom_fields.len() as i32;
        state.custom_fields.insert(name.to_string(), key);
        Ok(key)
    }

    async fn set_custom_field(&self, entity: &MoRef, key: i32, value: &str) -> Result<()> {
        let mut state = self.store.write()?;
        if !state.objects.contains_key(entity) {
            return Err(HypervisorError::ObjectDeleted(entity.to_string()));
        }
        state.field_values.insert((entity.clone(), key), value.to_string());
        Ok(())
    }
}

// =============================================================================
// UPLOADER
// =============================================================================

/// One upload received by [`RecordingUploader`].
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub url: String,
    pub content_type: String,
    pub length: u64,
    pub body: Vec<u8>,
}

/// [`DiskUploader`] that keeps what it receives.
#[derive(Default)]
pub struct RecordingUploader {
    uploads: Mutex<Vec<RecordedUpload>>,
    reject_with: Option<u16>,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the body, then answer with HTTP `status`.
    pub fn rejecting(status: u16) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            reject_with: Some(status),
        }
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DiskUploader for RecordingUploader {
    async fn upload(&self, url: &str, content_type: &str, length: u64, mut body: ByteStream) -> Result<()> {
        let mut received = Vec::new();
        while let Some(chunk) = body.next().await {
            received.extend_from_slice(&chunk?);
        }

        self.uploads.lock().map_err(lock_poisoned)?.push(RecordedUpload {
            url: url.to_string(),
            content_type: content_type.to_string(),
            length,
            body: received,
        });

        match self.reject_with {
            Some(status) => Err(HypervisorError::BadResponse {
                status,
                body: "upload rejected".to_string(),
            }),
            None => Ok(()),
        }
    }
}
