//! Request payloads submitted to the backend: reconfigure, relocate, clone,
//! guest customization and OVF import.

use serde::{Deserialize, Serialize};

use crate::vsphere::device::DeviceChange;
use crate::vsphere::mo::ManagedObjectReference;

// =============================================================================
// CONFIG / CLONE
// =============================================================================

/// Changes applied to a VM's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigSpec {
    #[serde(rename = "numCPUs")]
    pub num_cpus: Option<i32>,
    #[serde(rename = "memoryMB")]
    pub memory_mb: Option<i64>,
    pub cpu_hot_add_enabled: Option<bool>,
    pub memory_hot_add_enabled: Option<bool>,
    #[serde(rename = "nestedHVEnabled")]
    pub nested_hv_enabled: Option<bool>,
    /// Applied by the backend in order
    pub device_change: Vec<DeviceChange>,
}

/// Disk move type used for linked clones.
pub const DISK_MOVE_CHILD_BACKING: &str = "createNewChildDiskBacking";

/// Where a clone lands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelocateSpec {
    pub pool: Option<ManagedObjectReference>,
    pub host: Option<ManagedObjectReference>,
    pub datastore: Option<ManagedObjectReference>,
    pub disk_move_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloneSpec {
    pub location: RelocateSpec,
    pub template: bool,
    pub power_on: bool,
    pub config: Option<ConfigSpec>,
    pub customization: Option<CustomizationSpec>,
    /// Snapshot to clone from (linked clones)
    pub snapshot: Option<ManagedObjectReference>,
}

// =============================================================================
// GUEST CUSTOMIZATION
// =============================================================================

/// A stored customization spec as held by the backend's spec manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomizationSpecItem {
    pub info: CustomizationSpecInfo,
    pub spec: CustomizationSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomizationSpecInfo {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomizationSpec {
    pub identity: CustomizationIdentity,
    #[serde(rename = "globalIPSettings")]
    pub global_ip_settings: GlobalIpSettings,
    pub nic_setting_map: Vec<AdapterMapping>,
}

/// Guest identity; only the Linux preparation is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CustomizationIdentity {
    #[serde(rename_all = "camelCase")]
    LinuxPrep {
        /// Host name source; `None` keeps the VM name
        host_name: Option<String>,
        domain: String,
        hw_clock_utc: bool,
    },
}

impl Default for CustomizationIdentity {
    fn default() -> Self {
        CustomizationIdentity::LinuxPrep {
            host_name: None,
            domain: "localdomain".to_string(),
            hw_clock_utc: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalIpSettings {
    pub dns_server_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterMapping {
    pub adapter: IpSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpSettings {
    pub ip: IpGenerator,
    pub subnet_mask: Option<String>,
    pub gateway: Vec<String>,
}

/// How a NIC obtains its address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IpGenerator {
    #[default]
    Dhcp,
    #[serde(rename_all = "camelCase")]
    Fixed { ip_address: String },
}

impl CustomizationSpecItem {
    /// The static-IP spec stored on first use: one fixed-address NIC whose
    /// address, mask and gateway are patched per clone.
    pub fn static_ip(name: &str) -> Self {
        Self {
            info: CustomizationSpecInfo {
                name: name.to_string(),
                description: "Static IP assignment for cloned VMs".to_string(),
                kind: "Linux".to_string(),
            },
            spec: CustomizationSpec {
                identity: CustomizationIdentity::default(),
                global_ip_settings: GlobalIpSettings::default(),
                nic_setting_map: vec![AdapterMapping {
                    adapter: IpSettings {
                        ip: IpGenerator::Fixed {
                            ip_address: String::new(),
                        },
                        subnet_mask: None,
                        gateway: Vec::new(),
                    },
                }],
            },
        }
    }
}

// =============================================================================
// OVF IMPORT
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportSpecParams {
    pub host_system: Option<ManagedObjectReference>,
    pub entity_name: String,
    pub disk_provisioning: String,
}

/// Result of parsing an OVF descriptor against a placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportSpecResult {
    pub import_spec: ImportSpec,
    pub file_item: Vec<FileItem>,
    pub error: Vec<String>,
    pub warning: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportSpec {
    pub config_spec: ConfigSpec,
}

impl ImportSpec {
    /// Rewrite unit numbers equal to 0 to -1 so the backend assigns them.
    pub fn reset_unit_numbers(&mut self) {
        for change in &mut self.config_spec.device_change {
            if let Some(unit) = change.device.unit_number_mut() {
                if *unit == 0 {
                    *unit = -1;
                }
            }
        }
    }
}

/// A file referenced by the descriptor that has to be uploaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileItem {
    pub device_id: String,
    /// Relative to the descriptor unless absolute
    pub path: String,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseInfo {
    pub device_url: Vec<DeviceUrl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceUrl {
    pub import_key: String,
    /// Upload target; `*` stands for the host the session connected to
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsphere::device::{DeviceChange, GenericDevice, VirtualDevice, VirtualDisk};

    #[test]
    fn test_reset_unit_numbers() {
        let mut spec = ImportSpec {
            config_spec: ConfigSpec {
                device_change: vec![
                    DeviceChange::add(VirtualDevice::Disk(VirtualDisk {
                        unit_number: Some(0),
                        ..Default::default()
                    })),
                    DeviceChange::add(VirtualDevice::Other(GenericDevice {
                        unit_number: Some(3),
                        ..Default::default()
                    })),
                ],
                ..Default::default()
            },
        };

        spec.reset_unit_numbers();

        let units: Vec<_> = spec
            .config_spec
            .device_change
            .iter()
            .map(|c| c.device.unit_number())
            .collect();
        assert_eq!(units, vec![Some(-1), Some(3)]);
    }

    #[test]
    fn test_static_ip_item_has_one_fixed_nic() {
        let item = CustomizationSpecItem::static_ip("static");
        assert_eq!(item.info.name, "static");
        assert_eq!(item.spec.nic_setting_map.len(), 1);
        assert!(matches!(
            item.spec.nic_setting_map[0].adapter.ip,
            IpGenerator::Fixed { .. }
        ));
    }
}
