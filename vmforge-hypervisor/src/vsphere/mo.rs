//! Typed views over managed object property sets.
//!
//! The backend returns projected properties as JSON objects; each view
//! below deserializes from such a projection. Every field is optional on
//! the wire so a view can be filled from any subset of its properties.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::HeartbeatStatus;
use crate::vsphere::device::VirtualDevice;

/// Backend-assigned identifier of an inventory entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagedObjectReference {
    /// Type tag, e.g. `VirtualMachine`, `Folder`
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque id, e.g. `vm-42`
    pub value: String,
}

impl ManagedObjectReference {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for ManagedObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Type tags of the entities this library walks.
pub mod kind {
    pub const FOLDER: &str = "Folder";
    pub const VIRTUAL_MACHINE: &str = "VirtualMachine";
    pub const DATACENTER: &str = "Datacenter";
    pub const COMPUTE_RESOURCE: &str = "ComputeResource";
    pub const CLUSTER_COMPUTE_RESOURCE: &str = "ClusterComputeResource";
    pub const HOST_SYSTEM: &str = "HostSystem";
    pub const RESOURCE_POOL: &str = "ResourcePool";
    pub const DATASTORE: &str = "Datastore";
    pub const NETWORK: &str = "Network";
    pub const DISTRIBUTED_PORTGROUP: &str = "DistributedVirtualPortgroup";
    pub const TASK: &str = "Task";
    pub const LEASE: &str = "HttpNfcLease";
}

/// Projected properties of one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectContent {
    pub obj: ManagedObjectReference,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// INVENTORY
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Datacenter {
    #[serde(skip)]
    pub reference: ManagedObjectReference,
    pub name: String,
    pub host_folder: ManagedObjectReference,
    pub vm_folder: ManagedObjectReference,
    pub datastore: Vec<ManagedObjectReference>,
    pub network: Vec<ManagedObjectReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Folder {
    pub name: String,
    pub child_entity: Vec<ManagedObjectReference>,
}

/// Any entity read only for its name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Named {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputeResource {
    #[serde(skip)]
    pub reference: ManagedObjectReference,
    pub name: String,
    pub host: Vec<ManagedObjectReference>,
    pub resource_pool: Option<ManagedObjectReference>,
    pub datastore: Vec<ManagedObjectReference>,
    pub network: Vec<ManagedObjectReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterComputeResource {
    #[serde(skip)]
    pub reference: ManagedObjectReference,
    pub name: String,
    pub configuration: Option<ClusterConfigInfo>,
    pub host: Vec<ManagedObjectReference>,
    pub resource_pool: Option<ManagedObjectReference>,
    pub datastore: Vec<ManagedObjectReference>,
    pub network: Vec<ManagedObjectReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfigInfo {
    pub drs_config: Option<DrsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DrsConfig {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostSystem {
    #[serde(skip)]
    pub reference: ManagedObjectReference,
    pub name: String,
    pub network: Vec<ManagedObjectReference>,
    pub datastore: Vec<ManagedObjectReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Datastore {
    pub name: String,
    pub info: Option<DatastoreInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatastoreInfo {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResourcePool {
    #[serde(skip)]
    pub reference: ManagedObjectReference,
    pub name: String,
    pub owner: Option<ManagedObjectReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DistributedVirtualPortgroup {
    #[serde(skip)]
    pub reference: ManagedObjectReference,
    pub name: String,
    pub key: String,
    pub config: Option<PortgroupConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortgroupConfig {
    pub distributed_virtual_switch: Option<ManagedObjectReference>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DistributedVirtualSwitch {
    pub uuid: String,
}

// =============================================================================
// VIRTUAL MACHINE
// =============================================================================

/// Properties fetched whenever a VM is resolved by path.
pub const VM_PROPERTIES: &[&str] = &[
    "name",
    "config",
    "datastore",
    "guest",
    "guestHeartbeatStatus",
    "snapshot.currentSnapshot",
    "runtime",
    "resourcePool",
    "recentTask",
];

/// Properties fetched when a VM is resolved by instance UUID.
pub const VM_UUID_PROPERTIES: &[&str] = &[
    "name",
    "config",
    "runtime",
    "guest",
    "guestHeartbeatStatus",
    "resourcePool",
    "recentTask",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachine {
    #[serde(skip)]
    pub reference: ManagedObjectReference,
    pub name: String,
    pub config: Option<VirtualMachineConfigInfo>,
    pub datastore: Vec<ManagedObjectReference>,
    pub guest: Option<GuestInfo>,
    pub guest_heartbeat_status: Option<HeartbeatStatus>,
    pub snapshot: Option<SnapshotInfo>,
    pub runtime: Option<RuntimeInfo>,
    pub resource_pool: Option<ManagedObjectReference>,
    pub recent_task: Vec<ManagedObjectReference>,
}

impl VirtualMachine {
    /// Devices of the VM, empty if the config was not fetched.
    pub fn devices(&self) -> &[VirtualDevice] {
        self.config
            .as_ref()
            .map(|c| c.hardware.device.as_slice())
            .unwrap_or(&[])
    }

    pub fn guest_state(&self) -> GuestState {
        self.guest.as_ref().map(|g| g.guest_state).unwrap_or_default()
    }

    pub fn power_state(&self) -> PowerState {
        self.runtime.as_ref().map(|r| r.power_state).unwrap_or_default()
    }

    pub fn pending_question(&self) -> Option<&QuestionInfo> {
        self.runtime.as_ref().and_then(|r| r.question.as_ref())
    }

    pub fn current_snapshot(&self) -> Option<&ManagedObjectReference> {
        self.snapshot.as_ref().and_then(|s| s.current_snapshot.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualMachineConfigInfo {
    pub instance_uuid: Option<String>,
    pub template: bool,
    pub hardware: VirtualHardware,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VirtualHardware {
    #[serde(rename = "numCPU")]
    pub num_cpu: i32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: i32,
    pub device: Vec<VirtualDevice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuestInfo {
    pub guest_state: GuestState,
    pub tools_running_status: Option<String>,
    pub net: Vec<GuestNicInfo>,
    pub ip_stack: Vec<GuestStackInfo>,
}

impl GuestInfo {
    pub fn tools_running(&self) -> bool {
        self.tools_running_status.as_deref() == Some("guestToolsRunning")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuestNicInfo {
    pub network: Option<String>,
    pub ip_address: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuestStackInfo {
    pub dns_config: Option<DnsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsConfig {
    pub ip_address: Vec<String>,
}

/// Guest operating system state as seen by the tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestState {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "notRunning")]
    NotRunning,
    #[serde(rename = "shuttingDown", alias = "shuttingdown")]
    ShuttingDown,
    #[serde(rename = "resetting")]
    Resetting,
    #[serde(rename = "standby")]
    Standby,
    #[default]
    #[serde(rename = "unknown", other)]
    Unknown,
}

/// Virtual hardware power state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    #[default]
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeInfo {
    pub power_state: PowerState,
    pub host: Option<ManagedObjectReference>,
    pub question: Option<QuestionInfo>,
}

/// A question blocking the VM until answered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionInfo {
    pub id: String,
    pub text: String,
    pub choice: ChoiceOption,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChoiceOption {
    pub choice_info: Vec<ElementDescription>,
}

/// One selectable answer: `key` is submitted, `summary` is shown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementDescription {
    pub key: String,
    pub label: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotInfo {
    pub current_snapshot: Option<ManagedObjectReference>,
}

// =============================================================================
// TASKS
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    #[default]
    Queued,
    Running,
    Success,
    Error,
}

/// Outcome of an asynchronous backend operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskInfo {
    pub key: String,
    pub state: TaskState,
    /// Fault message when `state` is `Error`
    pub error: Option<String>,
    /// Object produced by the task (e.g. the new VM of a clone)
    pub result: Option<ManagedObjectReference>,
    pub queue_time: Option<DateTime<Utc>>,
    pub complete_time: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Time between queueing and completion, if both are known.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.complete_time? - self.queue_time?)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Task {
    pub info: TaskInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vm_view_from_partial_projection() {
        let vm: VirtualMachine = serde_json::from_value(json!({
            "name": "web-01",
            "guest": { "guestState": "shuttingdown" },
            "runtime": {
                "powerState": "poweredOn",
                "question": {
                    "id": "q1",
                    "text": "Insert disk 2",
                    "choice": { "choiceInfo": [{ "key": "0", "label": "Retry", "summary": "Retry" }] }
                }
            },
            "snapshot": { "currentSnapshot": { "type": "VirtualMachineSnapshot", "value": "snap-1" } }
        }))
        .unwrap();

        assert_eq!(vm.guest_state(), GuestState::ShuttingDown);
        assert_eq!(vm.power_state(), PowerState::PoweredOn);
        assert_eq!(vm.pending_question().unwrap().choice.choice_info[0].key, "0");
        assert_eq!(vm.current_snapshot().unwrap().value, "snap-1");
        assert!(vm.devices().is_empty());
    }

    #[test]
    fn test_unknown_guest_state() {
        let info: GuestInfo = serde_json::from_value(json!({ "guestState": "hibernating" })).unwrap();
        assert_eq!(info.guest_state, GuestState::Unknown);
    }

    #[test]
    fn test_hardware_field_names() {
        let hw: VirtualHardware =
            serde_json::from_value(json!({ "numCPU": 2, "memoryMB": 4096 })).unwrap();
        assert_eq!(hw.num_cpu, 2);
        assert_eq!(hw.memory_mb, 4096);
    }
}
