//! Inventory resolution: datacenters, VMs by path or UUID, placement
//! targets by name, datastores and hosts.

use std::collections::HashSet;
use tracing::{debug, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::types::Destination;
use crate::vsphere::client::{retrieve_many, retrieve_one};
use crate::vsphere::mo::{
    self, kind, ClusterComputeResource, ComputeResource, Datacenter, Folder, ManagedObjectReference, Named,
    VM_PROPERTIES, VM_UUID_PROPERTIES,
};
use crate::vsphere::{SearchFilter, VsphereVm};

const DATACENTER_PROPERTIES: &[&str] = &["name", "hostFolder", "vmFolder", "datastore", "network"];
const COMPUTE_PROPERTIES: &[&str] = &["name", "host", "resourcePool", "datastore", "network"];
const CLUSTER_PROPERTIES: &[&str] = &["name", "configuration", "host", "resourcePool", "datastore", "network"];

/// Split an inventory path on `/`, keeping escaped separators (`\/`) inside
/// names.
///
/// `vms\/test/rec\/1/vm` becomes `["vms/test", "rec/1", "vm"]`.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut rest = path;

    while let Some(pos) = rest.find('/') {
        let (head, tail) = rest.split_at(pos);
        if let Some(stripped) = head.strip_suffix('\\') {
            current.push_str(stripped);
            current.push('/');
        } else {
            current.push_str(head);
            segments.push(std::mem::take(&mut current));
        }
        rest = &tail[1..];
    }
    current.push_str(rest);
    segments.push(current);
    segments
}

/// Escape `/` inside a name for use as one path segment.
pub fn escape_segment(name: &str) -> String {
    name.replace('/', "\\/")
}

/// Inventory names are stored query-escaped.
fn unescape(name: &str) -> Result<String> {
    urlencoding::decode(&name.replace('+', " "))
        .map(|n| n.into_owned())
        .map_err(|e| HypervisorError::Backend(format!("invalid escaped name {:?}: {}", name, e)))
}

/// Outcome of a placement target search below one folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MobSearch {
    Found(ManagedObjectReference),
    /// The folder has no children at all
    Empty,
    /// Children exist but none matched
    Missing,
}

/// A VM or template with its full inventory path.
#[derive(Debug, Clone)]
pub struct VmListing {
    /// Folder path below the VM folder, `/` in names escaped as `\/`
    pub path: String,
    pub vm: mo::VirtualMachine,
}

/// Retrieve a view, mapping a deleted object to `None`.
async fn retrieve_live<T: serde::de::DeserializeOwned>(
    vm: &VsphereVm,
    object: &ManagedObjectReference,
    properties: &[&str],
) -> Result<Option<T>> {
    match retrieve_one::<T>(vm.client(), object, properties).await {
        Ok(view) => Ok(Some(view)),
        Err(e) if e.is_object_deleted() => {
            warn!(object = %object, "Skipping deleted object");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

impl VsphereVm {
    // =========================================================================
    // Datacenter
    // =========================================================================

    /// The datacenter the handle is configured against.
    #[instrument(skip(self), fields(datacenter = %self.spec.connection.datacenter))]
    pub async fn datacenter(&self) -> Result<Datacenter> {
        let wanted = &self.spec.connection.datacenter;
        let refs = self
            .client()
            .datacenters()
            .await
            .map_err(|e| HypervisorError::not_found(wanted.as_str(), e.to_string()))?;

        for reference in refs {
            let mut dc: Datacenter = retrieve_one(self.client(), &reference, DATACENTER_PROPERTIES).await?;
            if &dc.name == wanted {
                dc.reference = reference;
                return Ok(dc);
            }
        }
        Err(HypervisorError::not_found(wanted.as_str(), "datacenter not found"))
    }

    // =========================================================================
    // Virtual machines
    // =========================================================================

    /// Resolve a VM or template, then answer any pending question on it.
    #[instrument(skip(self), fields(vm_name = %filter.name))]
    pub async fn find_vm(&self, filter: &SearchFilter) -> Result<mo::VirtualMachine> {
        let vm = match &filter.instance_uuid {
            Some(_) => self.search_by_uuid(filter).await?,
            None => {
                let dc = self.datacenter().await?;
                self.search_tree(&dc.vm_folder, &filter.name).await?
            }
        };
        self.answer_question(&vm).await?;
        Ok(vm)
    }

    /// Look up this handle's VM.
    pub async fn find_self(&self) -> Result<mo::VirtualMachine> {
        self.find_vm(&SearchFilter::vm(&self.spec.name)).await
    }

    /// Returns false if the VM or template does not exist.
    pub async fn exists(&self, filter: &SearchFilter) -> Result<bool> {
        match self.find_vm(filter).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Walk the folder tree below `root` along the escaped `path`.
    ///
    /// Folders are only descended into before the last segment and VMs are
    /// only matched at the last segment. Every folder matching a segment is
    /// explored, in inventory order.
    pub async fn search_tree(&self, root: &ManagedObjectReference, path: &str) -> Result<mo::VirtualMachine> {
        let segments = split_path(path);
        let last = segments.len() - 1;
        let mut stack = vec![(root.clone(), 0usize)];

        while let Some((folder_ref, depth)) = stack.pop() {
            let Some(folder) = retrieve_live::<Folder>(self, &folder_ref, &["childEntity"]).await? else {
                continue;
            };

            let mut descend = Vec::new();
            for child in folder.child_entity {
                if child.is(kind::FOLDER) {
                    if depth == last {
                        continue;
                    }
                    let Some(named) = retrieve_live::<Named>(self, &child, &["name"]).await? else {
                        continue;
                    };
                    if unescape(&named.name)? == segments[depth] {
                        debug!(folder = %named.name, depth, "Descending into folder");
                        descend.push((child, depth + 1));
                    }
                } else if child.is(kind::VIRTUAL_MACHINE) {
                    if depth != last {
                        continue;
                    }
                    let Some(named) = retrieve_live::<Named>(self, &child, &["name"]).await? else {
                        continue;
                    };
                    if unescape(&named.name)? != segments[depth] {
                        continue;
                    }
                    if let Some(mut vm) = retrieve_live::<mo::VirtualMachine>(self, &child, VM_PROPERTIES).await? {
                        vm.reference = child;
                        return Ok(vm);
                    }
                }
            }
            stack.extend(descend.into_iter().rev());
        }

        Err(HypervisorError::not_found(path, "could not find the vm"))
    }

    /// Find a VM through the search index.
    pub async fn search_by_uuid(&self, filter: &SearchFilter) -> Result<mo::VirtualMachine> {
        let uuid = filter.instance_uuid.as_deref().unwrap_or_default();
        let dc = if filter.search_in_dc {
            Some(self.datacenter().await?)
        } else {
            None
        };

        let found = self
            .client()
            .find_by_instance_uuid(dc.as_ref().map(|d| &d.reference), uuid)
            .await?
            .ok_or_else(|| HypervisorError::not_found(uuid, "could not find the vm"))?;
        if !found.is(kind::VIRTUAL_MACHINE) {
            return Err(HypervisorError::not_found(uuid, "invalid object with uuid found"));
        }

        let mut vm: mo::VirtualMachine = retrieve_one(self.client(), &found, VM_UUID_PROPERTIES).await?;
        vm.reference = found;
        Ok(vm)
    }

    // =========================================================================
    // Placement targets
    // =========================================================================

    /// Depth-first search below `root` for a compute resource or cluster
    /// named `name`.
    pub async fn search_mob(&self, root: &ManagedObjectReference, name: &str) -> Result<MobSearch> {
        let top: Folder = retrieve_one(self.client(), root, &["childEntity"]).await?;
        if top.child_entity.is_empty() {
            return Ok(MobSearch::Empty);
        }

        let mut stack: Vec<ManagedObjectReference> = top.child_entity.into_iter().rev().collect();
        while let Some(child) = stack.pop() {
            if child.is(kind::FOLDER) {
                match retrieve_live::<Folder>(self, &child, &["childEntity"]).await? {
                    Some(folder) if !folder.child_entity.is_empty() => {
                        stack.extend(folder.child_entity.into_iter().rev());
                    }
                    _ => debug!(folder = %child, "Empty folder, continuing with siblings"),
                }
            } else if child.is(kind::COMPUTE_RESOURCE) || child.is(kind::CLUSTER_COMPUTE_RESOURCE) {
                let Some(named) = retrieve_live::<Named>(self, &child, &["name"]).await? else {
                    continue;
                };
                if named.name == name {
                    return Ok(MobSearch::Found(child));
                }
            }
        }
        Ok(MobSearch::Missing)
    }

    /// Find a placement target by name below the datacenter's host folder.
    pub async fn find_mob(&self, dc: &Datacenter, name: &str) -> Result<ManagedObjectReference> {
        match self.search_mob(&dc.host_folder, name).await? {
            MobSearch::Found(found) => Ok(found),
            MobSearch::Empty | MobSearch::Missing => {
                Err(HypervisorError::not_found(name, "could not find the mob"))
            }
        }
    }

    /// A standalone host (compute resource) by name.
    pub async fn find_compute_resource(&self, dc: &Datacenter, name: &str) -> Result<ComputeResource> {
        let reference = self.find_mob(dc, name).await?;
        let mut cr: ComputeResource = retrieve_one(self.client(), &reference, COMPUTE_PROPERTIES).await?;
        cr.reference = reference;
        Ok(cr)
    }

    /// A cluster by name.
    pub async fn find_cluster(&self, dc: &Datacenter, name: &str) -> Result<ClusterComputeResource> {
        let reference = self.find_mob(dc, name).await?;
        let mut cluster: ClusterComputeResource =
            retrieve_one(self.client(), &reference, CLUSTER_PROPERTIES).await?;
        cluster.reference = reference;
        Ok(cluster)
    }

    /// A datastore of the datacenter by name.
    pub async fn find_datastore(&self, dc: &Datacenter, name: &str) -> Result<ManagedObjectReference> {
        for reference in &dc.datastore {
            let ds: Named = retrieve_one(self.client(), reference, &["name"]).await?;
            if ds.name == name {
                return Ok(reference.clone());
            }
        }
        Err(HypervisorError::not_found(name, "datastore not found"))
    }

    /// A host among `hosts` by name.
    pub async fn find_host(&self, hosts: &[ManagedObjectReference], name: &str) -> Result<ManagedObjectReference> {
        for reference in hosts {
            let host: Named = retrieve_one(self.client(), reference, &["name"]).await?;
            if host.name == name {
                return Ok(reference.clone());
            }
        }
        Err(HypervisorError::not_found(name, "host system not found"))
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// All VMs and templates of the datacenter, or of every datacenter.
    ///
    /// Without `all_datacenters`, a cluster or host destination narrows the
    /// list to VMs running on its hosts (or on the host override).
    #[instrument(skip(self))]
    pub async fn list_virtual_machines(&self, all_datacenters: bool) -> Result<Vec<VmListing>> {
        if all_datacenters {
            let mut all = Vec::new();
            for reference in self.client().datacenters().await? {
                let dc: Datacenter = retrieve_one(self.client(), &reference, DATACENTER_PROPERTIES).await?;
                all.extend(self.vms_in_folder(&dc.vm_folder).await?);
            }
            return Ok(all);
        }

        let dc = self.datacenter().await?;
        let vms = self.vms_in_folder(&dc.vm_folder).await?;

        let Some(hosts) = self.destination_hosts(&dc).await? else {
            return Ok(vms);
        };

        let mut filtered = Vec::new();
        for listing in vms {
            let Some(host) = listing.vm.runtime.as_ref().and_then(|r| r.host.clone()) else {
                continue;
            };
            let named: Named = retrieve_one(self.client(), &host, &["name"]).await?;
            if hosts.contains(&named.name) {
                filtered.push(listing);
            }
        }
        Ok(filtered)
    }

    /// Names of the hosts the destination covers, if it narrows placement.
    async fn destination_hosts(&self, dc: &Datacenter) -> Result<Option<HashSet<String>>> {
        let Some(destination) = &self.spec.destination else {
            return Ok(None);
        };
        if let Some(host) = destination.host_system() {
            return Ok(Some(HashSet::from([host.to_string()])));
        }

        let hosts = match destination {
            Destination::Cluster { name, .. } => self.find_cluster(dc, name).await?.host,
            Destination::Host { name } => self.find_compute_resource(dc, name).await?.host,
            Destination::ResourcePool { .. } => return Ok(None),
        };
        let named: Vec<Named> = retrieve_many(self.client(), &hosts, &["name"]).await?;
        Ok(Some(named.into_iter().map(|h| h.name).collect()))
    }

    async fn vms_in_folder(&self, root: &ManagedObjectReference) -> Result<Vec<VmListing>> {
        let mut listings = Vec::new();
        let mut stack = vec![(root.clone(), String::new())];

        while let Some((folder_ref, prefix)) = stack.pop() {
            let Some(folder) = retrieve_live::<Folder>(self, &folder_ref, &["childEntity"]).await? else {
                continue;
            };

            let mut descend = Vec::new();
            for child in folder.child_entity {
                if child.is(kind::FOLDER) {
                    let Some(named) = retrieve_live::<Named>(self, &child, &["name"]).await? else {
                        continue;
                    };
                    let segment = escape_segment(&unescape(&named.name)?);
                    descend.push((child, format!("{}{}/", prefix, segment)));
                } else if child.is(kind::VIRTUAL_MACHINE) {
                    let Some(mut vm) = retrieve_live::<mo::VirtualMachine>(self, &child, VM_UUID_PROPERTIES).await?
                    else {
                        continue;
                    };
                    vm.reference = child;
                    let path = format!("{}{}", prefix, escape_segment(&unescape(&vm.name)?));
                    listings.push(VmListing { path, vm });
                }
            }
            stack.extend(descend.into_iter().rev());
        }
        Ok(listings)
    }
}
