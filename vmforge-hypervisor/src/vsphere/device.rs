//! Virtual devices and device-change specs.
//!
//! Only the device kinds this library reads or writes are modelled:
//! ethernet cards, disks and their controllers. Anything else is carried
//! as [`VirtualDevice::Other`] so device lists round-trip.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{HypervisorError, Result};
use crate::vsphere::mo::ManagedObjectReference;

/// Unit number reserved for the SCSI controller itself.
const SCSI_RESERVED_UNIT: i32 = 7;

// =============================================================================
// DEVICES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum VirtualDevice {
    EthernetCard(EthernetCard),
    Disk(VirtualDisk),
    Controller(VirtualController),
    Other(GenericDevice),
}

impl VirtualDevice {
    pub fn key(&self) -> i32 {
        match self {
            VirtualDevice::EthernetCard(d) => d.key,
            VirtualDevice::Disk(d) => d.key,
            VirtualDevice::Controller(d) => d.key,
            VirtualDevice::Other(d) => d.key,
        }
    }

    pub fn unit_number(&self) -> Option<i32> {
        match self {
            VirtualDevice::EthernetCard(d) => d.unit_number,
            VirtualDevice::Disk(d) => d.unit_number,
            VirtualDevice::Controller(_) => None,
            VirtualDevice::Other(d) => d.unit_number,
        }
    }

    pub fn unit_number_mut(&mut self) -> Option<&mut i32> {
        match self {
            VirtualDevice::EthernetCard(d) => d.unit_number.as_mut(),
            VirtualDevice::Disk(d) => d.unit_number.as_mut(),
            VirtualDevice::Controller(_) => None,
            VirtualDevice::Other(d) => d.unit_number.as_mut(),
        }
    }

    pub fn controller_key(&self) -> Option<i32> {
        match self {
            VirtualDevice::EthernetCard(d) => d.controller_key,
            VirtualDevice::Disk(d) => d.controller_key,
            VirtualDevice::Controller(_) => None,
            VirtualDevice::Other(d) => d.controller_key,
        }
    }

    /// Backing file of a disk device.
    pub fn backing_file(&self) -> Option<&str> {
        match self {
            VirtualDevice::Disk(d) => Some(d.backing.file_name.as_str()),
            _ => None,
        }
    }

    /// Device name in the form the backend's finder uses, e.g. `pvscsi-1000`.
    pub fn name(&self) -> String {
        match self {
            VirtualDevice::EthernetCard(d) => format!("ethernet-{}", d.key),
            VirtualDevice::Disk(d) => format!("disk-{}", d.key),
            VirtualDevice::Controller(d) => format!("{}-{}", d.controller_type.prefix(), d.key),
            VirtualDevice::Other(d) => format!("{}-{}", d.type_name.to_lowercase(), d.key),
        }
    }
}

/// Network adapter model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    E1000,
    E1000e,
    #[default]
    Vmxnet3,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthernetCard {
    pub key: i32,
    pub controller_key: Option<i32>,
    pub unit_number: Option<i32>,
    pub adapter: AdapterType,
    pub backing: Option<EthernetBacking>,
    pub connectable: Option<Connectable>,
    pub mac_address: Option<String>,
}

/// What an ethernet card is plugged into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EthernetBacking {
    /// Standard port group.
    #[serde(rename_all = "camelCase")]
    Network {
        device_name: String,
        network: ManagedObjectReference,
    },
    /// Distributed port group.
    #[serde(rename_all = "camelCase")]
    DistributedPortgroup {
        switch_uuid: String,
        portgroup_key: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Connectable {
    pub start_connected: bool,
    pub allow_guest_control: bool,
    pub connected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VirtualDisk {
    pub key: i32,
    pub controller_key: Option<i32>,
    pub unit_number: Option<i32>,
    pub capacity_in_kb: i64,
    pub backing: DiskBacking,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskBacking {
    /// Datastore path, e.g. `[ds1] web-01/web-01.vmdk`; empty lets the backend choose
    pub file_name: String,
    pub datastore: Option<ManagedObjectReference>,
    pub thin_provisioned: Option<bool>,
    pub disk_mode: String,
}

/// Disk controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControllerType {
    Ide,
    Sata,
    Nvme,
    LsiLogic,
    LsiLogicSas,
    ParaVirtual,
    BusLogic,
}

impl ControllerType {
    pub fn prefix(&self) -> &'static str {
        match self {
            ControllerType::Ide => "ide",
            ControllerType::Sata => "sata",
            ControllerType::Nvme => "nvme",
            ControllerType::LsiLogic => "lsilogic",
            ControllerType::LsiLogicSas => "lsilogic-sas",
            ControllerType::ParaVirtual => "pvscsi",
            ControllerType::BusLogic => "buslogic",
        }
    }

    pub fn is_scsi(&self) -> bool {
        matches!(
            self,
            ControllerType::LsiLogic
                | ControllerType::LsiLogicSas
                | ControllerType::ParaVirtual
                | ControllerType::BusLogic
        )
    }

    /// Number of unit slots on one controller.
    pub fn max_units(&self) -> i32 {
        match self {
            ControllerType::Ide => 2,
            ControllerType::Sata => 30,
            ControllerType::Nvme => 15,
            _ => 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualController {
    pub key: i32,
    pub controller_type: ControllerType,
    #[serde(default)]
    pub bus_number: i32,
    /// Keys of the devices attached to this controller
    #[serde(default)]
    pub device: Vec<i32>,
}

impl VirtualController {
    fn free_unit(&self, used: &HashSet<i32>) -> Option<i32> {
        (0..self.controller_type.max_units()).find(|unit| {
            !(self.controller_type.is_scsi() && *unit == SCSI_RESERVED_UNIT) && !used.contains(unit)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenericDevice {
    pub key: i32,
    pub type_name: String,
    pub controller_key: Option<i32>,
    pub unit_number: Option<i32>,
}

// =============================================================================
// DEVICE CHANGES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceOperation {
    Add,
    Remove,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Create,
    Destroy,
}

/// One entry of a reconfigure's device-change list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    #[serde(default)]
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl DeviceChange {
    pub fn add(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: None,
            device,
        }
    }

    /// Add a disk whose backing file must be created.
    pub fn create(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Add,
            file_operation: Some(FileOperation::Create),
            device,
        }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Edit,
            file_operation: None,
            device,
        }
    }

    pub fn remove(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation: None,
            device,
        }
    }
}

// =============================================================================
// DEVICE LIST
// =============================================================================

/// Helpers over the device list of one VM.
#[derive(Debug, Clone, Default)]
pub struct DeviceList(pub Vec<VirtualDevice>);

impl DeviceList {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        Self(devices)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.0.iter()
    }

    pub fn find_by_key(&self, key: i32) -> Option<&VirtualDevice> {
        self.0.iter().find(|d| d.key() == key)
    }

    pub fn ethernet_cards(&self) -> impl Iterator<Item = &EthernetCard> {
        self.0.iter().filter_map(|d| match d {
            VirtualDevice::EthernetCard(card) => Some(card),
            _ => None,
        })
    }

    pub fn disks(&self) -> impl Iterator<Item = &VirtualDisk> {
        self.0.iter().filter_map(|d| match d {
            VirtualDevice::Disk(disk) => Some(disk),
            _ => None,
        })
    }

    fn controllers(&self) -> impl Iterator<Item = &VirtualController> {
        self.0.iter().filter_map(|d| match d {
            VirtualDevice::Controller(c) => Some(c),
            _ => None,
        })
    }

    fn used_units(&self, controller_key: i32) -> HashSet<i32> {
        self.0
            .iter()
            .filter(|d| d.controller_key() == Some(controller_key))
            .filter_map(|d| d.unit_number())
            .collect()
    }

    /// Find a disk controller by family (`scsi`, `ide`, `sata`, `nvme`, or
    /// empty for SCSI) or by device name (`pvscsi-1000`).
    ///
    /// A family lookup returns the first controller with a free slot.
    pub fn find_disk_controller(&self, name: &str) -> Result<&VirtualController> {
        let matches_family = |c: &VirtualController| match name {
            "" | "scsi" => c.controller_type.is_scsi(),
            "ide" => c.controller_type == ControllerType::Ide,
            "sata" => c.controller_type == ControllerType::Sata,
            "nvme" => c.controller_type == ControllerType::Nvme,
            _ => false,
        };

        match name {
            "" | "scsi" | "ide" | "sata" | "nvme" => self
                .controllers()
                .filter(|c| matches_family(c))
                .find(|c| c.free_unit(&self.used_units(c.key)).is_some())
                .ok_or_else(|| {
                    HypervisorError::not_found(
                        if name.is_empty() { "scsi" } else { name },
                        "no disk controller with a free slot",
                    )
                }),
            _ => self
                .controllers()
                .find(|c| VirtualDevice::Controller((*c).clone()).name() == name)
                .ok_or_else(|| {
                    HypervisorError::InvalidConfig(format!("{} is not a valid controller", name))
                }),
        }
    }

    /// Attach `disk` to `controller`: next free unit and a fresh negative key.
    pub fn assign_controller(&self, disk: &mut VirtualDisk, controller: &VirtualController) -> Result<()> {
        let unit = controller
            .free_unit(&self.used_units(controller.key))
            .ok_or_else(|| {
                HypervisorError::InvalidConfig(format!(
                    "controller {} has no free unit",
                    controller.key
                ))
            })?;
        let lowest = self.0.iter().map(|d| d.key()).filter(|k| *k < 0).min().unwrap_or(0);

        disk.controller_key = Some(controller.key);
        disk.unit_number = Some(unit);
        disk.key = lowest - 1;
        Ok(())
    }

    /// Backing files of disks present in `self` but not in `before`.
    pub fn added_disk_files(&self, before: &DeviceList) -> Vec<String> {
        let known: HashSet<i32> = before.iter().map(|d| d.key()).collect();
        self.disks()
            .filter(|d| !known.contains(&d.key))
            .map(|d| d.backing.file_name.clone())
            .collect()
    }
}

/// Build a new disk device ready to be attached.
///
/// A non-empty `name` gets a `.vmdk` extension if it lacks one; an empty
/// name lets the backend pick the file.
pub fn create_disk(
    devices: &DeviceList,
    controller: &VirtualController,
    datastore: ManagedObjectReference,
    name: &str,
    thin_provisioned: bool,
    capacity_in_kb: i64,
) -> Result<VirtualDisk> {
    let mut file_name = name.to_string();
    if !file_name.is_empty() && Path::new(&file_name).extension().map_or(true, |e| e != "vmdk") {
        file_name.push_str(".vmdk");
    }

    let mut disk = VirtualDisk {
        capacity_in_kb,
        backing: DiskBacking {
            file_name,
            datastore: Some(datastore),
            thin_provisioned: Some(thin_provisioned),
            disk_mode: "persistent".to_string(),
        },
        ..Default::default()
    };
    devices.assign_controller(&mut disk, controller)?;
    Ok(disk)
}
