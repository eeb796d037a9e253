//! Cloning a template into a new VM and reconciling its devices.

use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::types::{Destination, Disk, NetworkOperation, Provisioning};
use crate::vsphere::client::{retrieve_many, retrieve_one, TaskRequest};
use crate::vsphere::customization::update_custom_spec;
use crate::vsphere::device::{
    create_disk, AdapterType, Connectable, DeviceChange, DeviceList, EthernetBacking, EthernetCard, VirtualDevice,
};
use crate::vsphere::mo::{self, Datacenter, Datastore, HostSystem, ManagedObjectReference};
use crate::vsphere::placement::{choose_random, Location};
use crate::vsphere::specs::{CloneSpec, ConfigSpec, RelocateSpec, DISK_MOVE_CHILD_BACKING};
use crate::vsphere::VsphereVm;

/// Reconcile template disks against the disks to keep.
///
/// Disks are matched by backing file. A disk not listed is removed, a
/// listed disk is grown when the requested size is larger and left alone
/// when equal. Shrinking is refused.
pub fn resize_and_delete_vols(devices: &[VirtualDevice], keep: &[Disk]) -> Result<Vec<DeviceChange>> {
    let mut changes = Vec::new();
    for device in devices {
        let VirtualDevice::Disk(disk) = device else {
            continue;
        };
        let requested = keep
            .iter()
            .find(|d| d.disk_file.as_deref() == Some(disk.backing.file_name.as_str()));

        match requested {
            None => changes.push(DeviceChange::remove(device.clone())),
            Some(wanted) => {
                let capacity = wanted.capacity_kb();
                if disk.capacity_in_kb > capacity {
                    return Err(HypervisorError::ShrinkNotSupported {
                        disk: disk.backing.file_name.clone(),
                    });
                }
                if disk.capacity_in_kb < capacity {
                    let mut grown = disk.clone();
                    grown.capacity_in_kb = capacity;
                    changes.push(DeviceChange::edit(VirtualDevice::Disk(grown)));
                }
            }
        }
    }
    Ok(changes)
}

/// A new vmxnet3 NIC on `backing`, connected at power on.
fn new_network_device(key: i32, backing: EthernetBacking) -> DeviceChange {
    DeviceChange::add(VirtualDevice::EthernetCard(EthernetCard {
        key,
        adapter: AdapterType::Vmxnet3,
        backing: Some(backing),
        connectable: Some(Connectable {
            start_connected: true,
            allow_guest_control: true,
            connected: false,
        }),
        ..Default::default()
    }))
}

impl VsphereVm {
    /// Clone the configured template into this VM, then add disks, power
    /// on and wait for an address.
    #[instrument(skip(self, dc), fields(vm_name = %self.spec.name))]
    pub async fn clone_from_template(&mut self, dc: &Datacenter) -> Result<()> {
        self.datastore = choose_random(&self.spec.datastores)
            .filter(|d| !d.is_empty())
            .cloned();
        let datastore_ref = match &self.datastore {
            Some(name) => Some(self.find_datastore(dc, name).await?),
            None => None,
        };

        let template_filter = self.template_filter(self.datastore.as_deref());
        let template = self
            .find_vm(&template_filter)
            .await
            .map_err(|e| e.context("error retrieving template"))?;
        let location = self.resolve_location(dc).await?;

        let pin_host = match &self.spec.destination {
            Some(Destination::Host { .. }) => true,
            Some(destination @ Destination::Cluster { .. }) => {
                destination.host_system().is_some() || !self.cluster_drs_enabled(dc).await?
            }
            _ => false,
        };
        let mut relocate = RelocateSpec {
            pool: Some(location.resource_pool.clone()),
            host: if pin_host { location.host.clone() } else { None },
            datastore: datastore_ref,
            disk_move_type: None,
        };

        let mut config = self.clone_config(&template);
        config.device_change = self.reconfigure_networks(&template, &location).await?;
        if !self.spec.fixed_disks.is_empty() {
            config
                .device_change
                .extend(resize_and_delete_vols(template.devices(), &self.spec.fixed_disks)?);
        }

        let base = self
            .session
            .custom_specs()
            .checkout(self.client())
            .await
            .map_err(|e| e.context("error preparing custom spec"))?;
        let customization = update_custom_spec(&self.spec.network_setting, &template, base);

        let snapshot = if self.spec.use_linked_clones {
            relocate.disk_move_type = Some(DISK_MOVE_CHILD_BACKING.to_string());
            let current = template.current_snapshot().cloned().ok_or_else(|| {
                HypervisorError::InvalidConfig(format!(
                    "template {} has no snapshot to link clones to",
                    template.name
                ))
            })?;
            Some(current)
        } else {
            None
        };

        let spec = CloneSpec {
            location: relocate,
            template: false,
            power_on: false,
            config: Some(config),
            customization,
            snapshot,
        };

        info!(template = %template.name, linked = self.spec.use_linked_clones, "Cloning VM from template");
        self.session
            .run_task(TaskRequest::Clone {
                vm: template.reference.clone(),
                folder: dc.vm_folder.clone(),
                name: self.spec.name.clone(),
                spec,
            })
            .await
            .map_err(|e| e.context("error cloning vm from template"))?;

        let vm = self
            .find_self()
            .await
            .map_err(|e| e.context("failed to retrieve cloned VM"))?;
        if !self.spec.disks.is_empty() {
            self.reconfigure_disks(dc, &vm).await?;
        }
        self.start().await
    }

    /// CPU and memory for the clone; unset values inherit the template's.
    fn clone_config(&self, template: &mo::VirtualMachine) -> ConfigSpec {
        let hardware = template.config.as_ref().map(|c| &c.hardware);
        let num_cpus = if self.spec.flavor.num_cpus <= 0 {
            hardware.map(|h| h.num_cpu).unwrap_or_default()
        } else {
            self.spec.flavor.num_cpus
        };
        let memory_mb = if self.spec.flavor.memory_mb <= 0 {
            hardware.map(|h| h.memory_mb as i64).unwrap_or_default()
        } else {
            self.spec.flavor.memory_mb
        };

        ConfigSpec {
            num_cpus: Some(num_cpus),
            memory_mb: Some(memory_mb),
            cpu_hot_add_enabled: Some(true),
            memory_hot_add_enabled: Some(true),
            nested_hv_enabled: Some(self.spec.nested_hv),
            device_change: Vec::new(),
        }
    }

    /// Match the template's NICs positionally against the requested
    /// networks: extra NICs are removed, matched NICs rebacked and missing
    /// ones added.
    pub async fn reconfigure_networks(
        &self,
        template: &mo::VirtualMachine,
        location: &Location,
    ) -> Result<Vec<DeviceChange>> {
        let names = self.spec.network_names();
        let mapping = self.network_mapping(&names, &location.networks).await?;
        let lookup = |name: &str| {
            mapping
                .get(name)
                .cloned()
                .ok_or_else(|| HypervisorError::not_found(name, "could not find the network mapping"))
        };

        let mut changes = Vec::new();
        let mut index = 0;
        for device in template.devices() {
            let VirtualDevice::EthernetCard(card) = device else {
                continue;
            };
            let Some(name) = names.get(index) else {
                changes.push(DeviceChange::remove(device.clone()));
                continue;
            };
            let mut card = card.clone();
            card.backing = Some(self.ethernet_backing(&lookup(name)?, name).await?);
            changes.push(DeviceChange::edit(VirtualDevice::EthernetCard(card)));
            index += 1;
        }

        let mut key = -1;
        for name in names.iter().skip(index) {
            let backing = self.ethernet_backing(&lookup(name)?, name).await?;
            changes.push(new_network_device(key, backing));
            key -= 1;
        }

        debug!(changes = changes.len(), "Reconciled network devices");
        Ok(changes)
    }

    /// Device list of a VM as currently configured.
    pub async fn vm_devices(&self, vm: &ManagedObjectReference) -> Result<Vec<VirtualDevice>> {
        let view: mo::VirtualMachine = retrieve_one(self.client(), vm, &["config.hardware.device"]).await?;
        Ok(view.devices().to_vec())
    }

    /// Names of the datastores a VM uses.
    pub async fn vm_datastores(&self, vm: &mo::VirtualMachine) -> Result<Vec<String>> {
        let datastores: Vec<Datastore> = retrieve_many(self.client(), &vm.datastore, &["info"])
            .await
            .map_err(|e| e.context("error retrieving datastores used by vm"))?;
        Ok(datastores
            .into_iter()
            .filter_map(|d| d.info.map(|i| i.name))
            .collect())
    }

    /// Attach the requested data disks one by one, recording the backing
    /// file each one received.
    pub async fn reconfigure_disks(&mut self, dc: &Datacenter, vm: &mo::VirtualMachine) -> Result<()> {
        if self.datastore.is_none() {
            let names = self.vm_datastores(vm).await?;
            self.datastore = choose_random(&names).cloned();
        }

        for index in 0..self.spec.disks.len() {
            let disk = self.spec.disks[index].clone();
            let context = |what: &str| format!("{} while creating disks[{}]", what, index);

            let datastore = disk
                .datastore
                .clone()
                .or_else(|| self.datastore.clone())
                .ok_or_else(|| HypervisorError::InvalidConfig(context("no datastore available")))?;

            let before = DeviceList::new(self.vm_devices(&vm.reference).await?);
            let controller = before
                .find_disk_controller(&disk.controller)
                .map_err(|e| e.context(context("failed to get controller")))?
                .clone();
            let datastore_ref = self
                .find_datastore(dc, &datastore)
                .await
                .map_err(|e| e.context(context("failed to get datastore")))?;

            let device = create_disk(
                &before,
                &controller,
                datastore_ref,
                "",
                disk.provisioning == Provisioning::Thin,
                disk.capacity_kb(),
            )?;
            self.session
                .run_task(TaskRequest::Reconfigure {
                    vm: vm.reference.clone(),
                    spec: ConfigSpec {
                        device_change: vec![DeviceChange::create(VirtualDevice::Disk(device))],
                        ..Default::default()
                    },
                })
                .await
                .map_err(|e| e.context(context("failed to add device")))?;

            let after = DeviceList::new(self.vm_devices(&vm.reference).await?);
            let file = after
                .added_disk_files(&before)
                .into_iter()
                .next()
                .ok_or_else(|| HypervisorError::Internal(context("no new disk found")))?;
            info!(index, file = %file, "Attached disk");
            self.spec.disks[index].disk_file = Some(file);
        }
        Ok(())
    }

    /// Device changes adding or removing NICs on an existing VM.
    ///
    /// Adds come before removes. A removal names the NIC by device key and
    /// must be backed by the named network.
    pub async fn network_device_changes(&self, vm: &mo::VirtualMachine) -> Result<Vec<DeviceChange>> {
        let host_ref = vm
            .runtime
            .as_ref()
            .and_then(|r| r.host.clone())
            .ok_or_else(|| HypervisorError::Backend("host associated with vm not found".to_string()))?;
        let host: HostSystem = retrieve_one(self.client(), &host_ref, &["name", "network"])
            .await
            .map_err(|e| e.context("error while fetching host info"))?;
        let mapping = self.network_mapping(&self.spec.network_names(), &host.network).await?;
        let devices = DeviceList::new(vm.devices().to_vec());

        let mut adds = Vec::new();
        let mut removes = Vec::new();
        let mut key = -1;
        for network in &self.spec.networks {
            let Some(network_ref) = mapping.get(&network.name) else {
                return Err(HypervisorError::not_found(network.name.as_str(), "could not find the network mapping"));
            };
            let backing = self
                .ethernet_backing(network_ref, &network.name)
                .await
                .map_err(|e| e.context(format!("error creating spec for network: {}", network.name)))?;

            match network.operation {
                NetworkOperation::Add => {
                    adds.push(new_network_device(key, backing));
                    key -= 1;
                }
                NetworkOperation::Remove => {
                    let device_key = network.device_key.ok_or_else(|| {
                        HypervisorError::InvalidConfig(format!(
                            "device key not specified for network: {}",
                            network.name
                        ))
                    })?;
                    let mut on_network = devices
                        .ethernet_cards()
                        .filter(|c| c.backing.as_ref() == Some(&backing))
                        .peekable();
                    if on_network.peek().is_none() {
                        return Err(HypervisorError::not_found(
                            network.name.as_str(),
                            "no device on this network",
                        ));
                    }
                    let card = on_network.find(|c| c.key == device_key).ok_or_else(|| {
                        HypervisorError::not_found(
                            network.name.as_str(),
                            format!("device with key {} not found", device_key),
                        )
                    })?;
                    removes.push(DeviceChange::remove(VirtualDevice::EthernetCard(card.clone())));
                }
            }
        }

        adds.extend(removes);
        Ok(adds)
    }

    /// Apply the configured NIC additions and removals to the VM.
    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    pub async fn apply_network_changes(&self) -> Result<()> {
        let vm = self.find_self().await?;
        let device_change = self.network_device_changes(&vm).await?;
        if device_change.is_empty() {
            return Ok(());
        }
        self.session
            .run_task(TaskRequest::Reconfigure {
                vm: vm.reference.clone(),
                spec: ConfigSpec {
                    device_change,
                    ..Default::default()
                },
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsphere::device::{DeviceOperation, DiskBacking, VirtualDisk};

    fn disk(key: i32, file: &str, gb: i64) -> VirtualDevice {
        VirtualDevice::Disk(VirtualDisk {
            key,
            controller_key: Some(1000),
            unit_number: Some(0),
            capacity_in_kb: gb * 1024 * 1024,
            backing: DiskBacking {
                file_name: file.to_string(),
                ..Default::default()
            },
        })
    }

    #[test]
    fn test_unlisted_disk_is_removed() {
        let devices = vec![disk(2000, "[ds1] t/t.vmdk", 10), disk(2001, "[ds1] t/t_1.vmdk", 5)];
        let keep = vec![Disk::new(10).with_disk_file("[ds1] t/t.vmdk")];

        let changes = resize_and_delete_vols(&devices, &keep).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, DeviceOperation::Remove);
        assert_eq!(changes[0].device.key(), 2001);
    }

    #[test]
    fn test_growing_disk_is_edited() {
        let devices = vec![disk(2000, "[ds1] t/t.vmdk", 10)];
        let keep = vec![Disk::new(20).with_disk_file("[ds1] t/t.vmdk")];

        let changes = resize_and_delete_vols(&devices, &keep).unwrap();
        assert_eq!(changes[0].operation, DeviceOperation::Edit);
        match &changes[0].device {
            VirtualDevice::Disk(d) => assert_eq!(d.capacity_in_kb, 20 * 1024 * 1024),
            other => panic!("unexpected device {:?}", other),
        }
    }

    #[test]
    fn test_shrinking_disk_fails() {
        let devices = vec![disk(2000, "[ds1] t/t.vmdk", 10)];
        let keep = vec![Disk::new(5).with_disk_file("[ds1] t/t.vmdk")];

        assert!(matches!(
            resize_and_delete_vols(&devices, &keep),
            Err(HypervisorError::ShrinkNotSupported { .. })
        ));
    }

    #[test]
    fn test_equal_size_is_untouched() {
        let devices = vec![disk(2000, "[ds1] t/t.vmdk", 10)];
        let keep = vec![Disk::new(10).with_disk_file("[ds1] t/t.vmdk")];
        assert!(resize_and_delete_vols(&devices, &keep).unwrap().is_empty());
    }
}
