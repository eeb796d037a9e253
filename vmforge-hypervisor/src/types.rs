//! Type definitions for VM configuration and status.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

// =============================================================================
// VM CONFIGURATION
// =============================================================================

/// CPU and memory sizing for a clone.
///
/// Values `<= 0` inherit the template's setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Flavor {
    /// Number of virtual CPUs
    pub num_cpus: i32,
    /// Memory size in MiB
    pub memory_mb: i64,
}

impl Flavor {
    /// Create a flavor with explicit CPU and memory.
    pub fn new(num_cpus: i32, memory_mb: i64) -> Self {
        Self { num_cpus, memory_mb }
    }
}

/// Disk provisioning mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provisioning {
    #[default]
    Thin,
    Thick,
}

/// A data disk requested by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Disk {
    /// Size in GiB
    pub size_gb: u64,
    /// Datastore name (defaults to the VM's datastore)
    pub datastore: Option<String>,
    /// Controller name or type (e.g. "scsi", "pvscsi-1000")
    pub controller: String,
    /// Provisioning mode
    pub provisioning: Provisioning,
    /// Backing file assigned by the backend, e.g. `[ds1] web-01/web-01_1.vmdk`.
    ///
    /// Filled in after the disk is attached; this is how the disk is
    /// identified afterwards, not its position.
    pub disk_file: Option<String>,
}

impl Disk {
    /// Create a thin-provisioned disk of `size_gb` GiB.
    pub fn new(size_gb: u64) -> Self {
        Self {
            size_gb,
            ..Default::default()
        }
    }

    /// Capacity in KiB as the backend expresses it.
    pub fn capacity_kb(&self) -> i64 {
        (self.size_gb as i64) * 1024 * 1024
    }

    /// Set the datastore.
    pub fn with_datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = Some(datastore.into());
        self
    }

    /// Set the controller.
    pub fn with_controller(mut self, controller: impl Into<String>) -> Self {
        self.controller = controller.into();
        self
    }

    /// Set an existing backing file (for resize of template disks).
    pub fn with_disk_file(mut self, file: impl Into<String>) -> Self {
        self.disk_file = Some(file.into());
        self
    }
}

/// Operation applied to a network on an existing VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkOperation {
    #[default]
    Add,
    Remove,
}

/// A network the VM should be attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    /// Network or port group name
    pub name: String,
    /// Operation when reconfiguring an existing VM
    pub operation: NetworkOperation,
    /// Device key of the NIC to remove
    pub device_key: Option<i32>,
}

impl Network {
    /// Network to attach by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Network whose NIC with `device_key` should be removed.
    pub fn remove(name: impl Into<String>, device_key: i32) -> Self {
        Self {
            name: name.into(),
            operation: NetworkOperation::Remove,
            device_key: Some(device_key),
        }
    }
}

/// Static network settings applied through guest customization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSetting {
    pub ip: Option<String>,
    pub subnet_mask: Option<String>,
    pub gateway: Option<String>,
    pub dns_server: Option<String>,
}

impl NetworkSetting {
    /// Static IP customization needs at least an address and a mask.
    pub fn is_static(&self) -> bool {
        matches!(
            (self.ip.as_deref(), self.subnet_mask.as_deref()),
            (Some(ip), Some(mask)) if !ip.is_empty() && !mask.is_empty()
        )
    }
}

/// Where a VM should be placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    /// A standalone host (compute resource) by name.
    Host { name: String },
    /// A cluster by name, optionally pinned to one of its hosts.
    Cluster {
        name: String,
        #[serde(default)]
        host_system: Option<String>,
    },
    /// A resource pool by managed object id.
    ResourcePool { moid: String },
}

impl Destination {
    /// Name of the host or cluster, if the destination has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Destination::Host { name } | Destination::Cluster { name, .. } => Some(name),
            Destination::ResourcePool { .. } => None,
        }
    }

    /// Host override inside a cluster.
    pub fn host_system(&self) -> Option<&str> {
        match self {
            Destination::Cluster { host_system, .. } => {
                host_system.as_deref().filter(|h| !h.is_empty())
            }
            _ => None,
        }
    }
}

/// Clone source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Template {
    /// Inventory path of the template
    pub name: String,
    /// Instance UUID; when set, lookup is by UUID instead of by path
    pub instance_uuid: Option<String>,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_uuid: None,
        }
    }
}

/// Automated answer to a pending VM question.
///
/// `pattern` is a regular expression matched against the question text;
/// `answer` is either a choice summary (matched case-insensitively) or a
/// literal choice key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionResponse {
    pub pattern: String,
    pub answer: String,
}

impl QuestionResponse {
    pub fn new(pattern: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            answer: answer.into(),
        }
    }
}

// =============================================================================
// VM STATUS
// =============================================================================

/// Provider-independent VM state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    Running,
    Stopped,
    Suspended,
    #[default]
    Unknown,
}

/// Guest heartbeat as reported by the guest tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    /// Guest operating system is responding normally.
    Green,
    /// Intermittent heartbeat, may be due to guest load.
    Yellow,
    /// Tools are not installed or not running.
    Gray,
    /// No heartbeat; the guest may have stopped responding.
    Red,
}

/// Set of acceptable heartbeat statuses for a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatMask(u8);

impl HeartbeatMask {
    pub const GREEN: Self = Self(1 << 0);
    pub const YELLOW: Self = Self(1 << 1);
    pub const GRAY: Self = Self(1 << 2);
    pub const RED: Self = Self(1 << 3);

    /// Healthy or intermittently responding guest.
    pub const ALIVE: Self = Self(Self::GREEN.0 | Self::YELLOW.0);
    /// Tools gone or no heartbeat at all.
    pub const DOWN: Self = Self(Self::GRAY.0 | Self::RED.0);

    /// Returns true if `status` is one of the accepted statuses.
    pub fn contains(self, status: HeartbeatStatus) -> bool {
        self.0 & Self::from(status).0 != 0
    }
}

impl From<HeartbeatStatus> for HeartbeatMask {
    fn from(status: HeartbeatStatus) -> Self {
        match status {
            HeartbeatStatus::Green => Self::GREEN,
            HeartbeatStatus::Yellow => Self::YELLOW,
            HeartbeatStatus::Gray => Self::GRAY,
            HeartbeatStatus::Red => Self::RED,
        }
    }
}

impl BitOr for HeartbeatMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
