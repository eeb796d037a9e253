//! Placement: resolving a destination into a host, resource pool and
//! network set.

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::types::Destination;
use crate::vsphere::client::{retrieve_many, retrieve_one};
use crate::vsphere::device::EthernetBacking;
use crate::vsphere::mo::{
    kind, ClusterComputeResource, Datacenter, DistributedVirtualPortgroup, DistributedVirtualSwitch, HostSystem,
    ManagedObjectReference, Named, ResourcePool,
};
use crate::vsphere::VsphereVm;

/// How deep nested resource pools are searched.
pub const RESOURCE_POOL_DEPTH: usize = 8;

/// A resolved placement. Recomputed for every operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Unset for resource pool destinations
    pub host: Option<ManagedObjectReference>,
    pub resource_pool: ManagedObjectReference,
    /// Networks available at the destination
    pub networks: Vec<ManagedObjectReference>,
}

/// Pick one element uniformly at random.
pub fn choose_random<T>(items: &[T]) -> Option<&T> {
    items.choose(&mut rand::thread_rng())
}

/// A host qualifies if it carries every requested network and, when a
/// datastore was already chosen, that datastore.
pub fn host_satisfies(
    host_networks: &HashSet<String>,
    host_datastores: &[String],
    requested_networks: &[String],
    datastore: Option<&str>,
) -> bool {
    let networks_ok = requested_networks.iter().all(|n| host_networks.contains(n));
    let datastore_ok = match datastore {
        Some(ds) if !ds.is_empty() => host_datastores.iter().any(|d| d == ds),
        _ => true,
    };
    networks_ok && datastore_ok
}

impl VsphereVm {
    /// Name of a standard network or distributed port group.
    pub async fn network_name(&self, network: &ManagedObjectReference) -> Result<String> {
        if !network.is(kind::NETWORK) && !network.is(kind::DISTRIBUTED_PORTGROUP) {
            return Err(HypervisorError::Backend(format!(
                "could not retrieve the network name for: {}",
                network.value
            )));
        }
        let named: Named = retrieve_one(self.client(), network, &["name"]).await?;
        Ok(named.name)
    }

    /// Map every available network by name and check that each requested
    /// network is among them.
    pub async fn network_mapping(
        &self,
        requested: &[String],
        available: &[ManagedObjectReference],
    ) -> Result<HashMap<String, ManagedObjectReference>> {
        let mut mapping = HashMap::new();
        for network in available {
            let name = self.network_name(network).await?;
            if name.is_empty() {
                return Err(HypervisorError::Backend(format!(
                    "network name empty for: {}",
                    network.value
                )));
            }
            mapping.insert(name, network.clone());
        }

        for name in requested {
            if !mapping.contains_key(name) {
                return Err(HypervisorError::not_found(name.as_str(), "could not find the network mapping"));
            }
        }
        Ok(mapping)
    }

    /// Backing that plugs a NIC into `network`.
    pub async fn ethernet_backing(&self, network: &ManagedObjectReference, name: &str) -> Result<EthernetBacking> {
        if network.is(kind::NETWORK) {
            return Ok(EthernetBacking::Network {
                device_name: name.to_string(),
                network: network.clone(),
            });
        }
        if network.is(kind::DISTRIBUTED_PORTGROUP) {
            let portgroup: DistributedVirtualPortgroup =
                retrieve_one(self.client(), network, &["key", "config.distributedVirtualSwitch"]).await?;
            let switch_ref = portgroup
                .config
                .and_then(|c| c.distributed_virtual_switch)
                .ok_or_else(|| {
                    HypervisorError::Backend(format!(
                        "error fetching ethernet card backing info: port group {} has no switch",
                        name
                    ))
                })?;
            let switch: DistributedVirtualSwitch = retrieve_one(self.client(), &switch_ref, &["uuid"]).await?;
            return Ok(EthernetBacking::DistributedPortgroup {
                switch_uuid: switch.uuid,
                portgroup_key: portgroup.key,
            });
        }
        Err(HypervisorError::InvalidConfig(format!(
            "network {} has unsupported type {}",
            name, network.kind
        )))
    }

    // =========================================================================
    // Host validation
    // =========================================================================

    /// Check that `host` carries the requested networks and the chosen
    /// datastore.
    pub async fn validate_host(&self, host: &ManagedObjectReference) -> Result<bool> {
        let hs: HostSystem = retrieve_one(self.client(), host, &["network", "datastore"]).await?;

        let mut networks = HashSet::new();
        for network in &hs.network {
            let name = self.network_name(network).await?;
            if name.is_empty() {
                return Err(HypervisorError::Backend(format!(
                    "network name empty for: {}",
                    network.value
                )));
            }
            networks.insert(name);
        }

        let datastores = match self.datastore.as_deref() {
            Some(ds) if !ds.is_empty() => retrieve_many::<Named>(self.client(), &hs.datastore, &["name"])
                .await?
                .into_iter()
                .map(|d| d.name)
                .collect(),
            _ => Vec::new(),
        };

        Ok(host_satisfies(
            &networks,
            &datastores,
            &self.spec.network_names(),
            self.datastore.as_deref(),
        ))
    }

    /// Hosts among `hosts` that pass validation, in order.
    pub async fn filter_hosts(&self, hosts: &[ManagedObjectReference]) -> Result<Vec<ManagedObjectReference>> {
        let mut valid = Vec::new();
        for host in hosts {
            if self.validate_host(host).await? {
                valid.push(host.clone());
            }
        }
        Ok(valid)
    }

    fn invalid_host(&self, host: &str) -> HypervisorError {
        HypervisorError::InvalidHost {
            host: host.to_string(),
            datastore: self.datastore.clone(),
            networks: self.spec.network_names(),
        }
    }

    // =========================================================================
    // Location
    // =========================================================================

    /// Resolve the configured destination.
    #[instrument(skip(self, dc), fields(vm_name = %self.spec.name))]
    pub async fn resolve_location(&self, dc: &Datacenter) -> Result<Location> {
        let destination = self
            .spec
            .destination
            .as_ref()
            .ok_or(HypervisorError::DestinationNotSupported)?;

        let location = match destination {
            Destination::Host { name } => {
                let cr = self.find_compute_resource(dc, name).await?;
                let host = cr.host.first().cloned().ok_or_else(|| self.invalid_host(name))?;
                if !self.validate_host(&host).await? {
                    return Err(self.invalid_host(name));
                }
                let resource_pool = cr.resource_pool.ok_or_else(|| {
                    HypervisorError::Backend("no valid resource pool found on the host".to_string())
                })?;
                Location {
                    host: Some(host),
                    resource_pool,
                    networks: cr.network,
                }
            }
            Destination::Cluster { name, .. } => {
                let cluster = self.find_cluster(dc, name).await?;
                if cluster.host.is_empty() {
                    return Err(HypervisorError::NoHostsInCluster);
                }

                let host = match destination.host_system() {
                    Some(host_name) => {
                        let host = self.find_host(&cluster.host, host_name).await?;
                        if !self.validate_host(&host).await? {
                            return Err(self.invalid_host(host_name));
                        }
                        host
                    }
                    None => {
                        let candidates = self.filter_hosts(&cluster.host).await?;
                        debug!(candidates = candidates.len(), "Filtered cluster hosts");
                        choose_random(&candidates)
                            .cloned()
                            .ok_or(HypervisorError::NoSuitableHosts)?
                    }
                };
                let resource_pool = cluster.resource_pool.ok_or_else(|| {
                    HypervisorError::Backend("no valid resource pool found on the cluster".to_string())
                })?;
                Location {
                    host: Some(host),
                    resource_pool,
                    networks: cluster.network,
                }
            }
            Destination::ResourcePool { moid } => {
                let pool = self.find_resource_pool_by_moid(dc, moid).await?;
                let owner = pool.owner.ok_or_else(|| {
                    HypervisorError::Backend(format!("resource pool {} has no owner", moid))
                })?;
                let cluster: ClusterComputeResource = retrieve_one(self.client(), &owner, &["network"]).await?;
                Location {
                    host: None,
                    resource_pool: pool.reference,
                    networks: cluster.network,
                }
            }
        };

        info!(
            host = ?location.host.as_ref().map(|h| h.value.as_str()),
            resource_pool = %location.resource_pool.value,
            "Resolved location"
        );
        Ok(location)
    }

    /// Find a resource pool by managed object id, searching nested pools
    /// level by level.
    pub async fn find_resource_pool_by_moid(&self, dc: &Datacenter, moid: &str) -> Result<ResourcePool> {
        let mut path = String::from("*/Resources");
        for _ in 0..RESOURCE_POOL_DEPTH {
            path.push_str("/*");
            let refs = match self.client().resource_pools(&dc.reference, &path).await {
                Ok(refs) => refs,
                Err(e) => {
                    debug!(path = %path, error = %e, "No resource pools at path");
                    continue;
                }
            };
            if let Some(found) = refs.into_iter().find(|r| r.value == moid) {
                let mut pool: ResourcePool = retrieve_one(self.client(), &found, &["name", "owner"]).await?;
                pool.reference = found;
                return Ok(pool);
            }
        }
        Err(HypervisorError::not_found(moid, "could not find the resourcepool with moref id"))
    }

    /// Whether DRS is enabled on the destination cluster.
    pub async fn cluster_drs_enabled(&self, dc: &Datacenter) -> Result<bool> {
        let name = self
            .spec
            .destination
            .as_ref()
            .and_then(|d| d.name())
            .ok_or(HypervisorError::DestinationNotSupported)?;
        let cluster = self.find_cluster(dc, name).await?;
        cluster
            .configuration
            .and_then(|c| c.drs_config)
            .and_then(|d| d.enabled)
            .ok_or_else(|| HypervisorError::Backend("error fetching cluster config details".to_string()))
    }

    /// Datastores mounted on every host of the cluster.
    pub async fn shared_datastores(&self, cluster: &ClusterComputeResource) -> Result<Vec<ManagedObjectReference>> {
        let hosts: Vec<HostSystem> = retrieve_many(self.client(), &cluster.host, &["name", "datastore"]).await?;
        if hosts.is_empty() {
            return Ok(Vec::new());
        }

        let mut counts: Vec<(ManagedObjectReference, usize)> = Vec::new();
        for host in &hosts {
            for ds in &host.datastore {
                match counts.iter_mut().find(|(r, _)| r == ds) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((ds.clone(), 1)),
                }
            }
        }
        Ok(counts
            .into_iter()
            .filter(|(_, n)| *n == hosts.len())
            .map(|(r, _)| r)
            .collect())
    }

    /// Datastores of the destination's host override inside the cluster.
    pub async fn host_datastores(&self, cluster: &ClusterComputeResource) -> Result<Vec<ManagedObjectReference>> {
        let wanted = self
            .spec
            .destination
            .as_ref()
            .and_then(|d| d.host_system())
            .unwrap_or_default();
        for host in &cluster.host {
            let hs: HostSystem = retrieve_one(self.client(), host, &["name", "datastore"]).await?;
            if hs.name == wanted {
                return Ok(hs.datastore);
            }
        }
        Err(HypervisorError::not_found(
            wanted,
            format!("host not found in cluster {}", cluster.name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_host_satisfies() {
        let networks = set(&["VM Network", "backend"]);
        let datastores = vec!["ds1".to_string()];
        let requested = vec!["VM Network".to_string()];

        assert!(host_satisfies(&networks, &datastores, &requested, None));
        assert!(host_satisfies(&networks, &datastores, &requested, Some("ds1")));
        assert!(!host_satisfies(&networks, &datastores, &requested, Some("ds2")));
        assert!(!host_satisfies(&networks, &datastores, &["dmz".to_string()], None));
    }

    #[test]
    fn test_choose_random_empty() {
        let empty: Vec<u8> = Vec::new();
        assert!(choose_random(&empty).is_none());
        assert_eq!(choose_random(&[7]), Some(&7));
    }

    proptest! {
        #[test]
        fn prop_planted_invalid_host_never_chosen(
            valid_count in 1usize..6,
            missing_network in any::<bool>(),
            trials in 1usize..20,
        ) {
            let requested = vec!["VM Network".to_string(), "backend".to_string()];
            let mut hosts: Vec<(String, HashSet<String>, Vec<String>)> = (0..valid_count)
                .map(|i| (format!("esx-{}", i), set(&["VM Network", "backend"]), vec!["ds1".to_string()]))
                .collect();
            let planted = if missing_network {
                ("bad".to_string(), set(&["VM Network"]), vec!["ds1".to_string()])
            } else {
                ("bad".to_string(), set(&["VM Network", "backend"]), vec!["ds2".to_string()])
            };
            hosts.push(planted);

            let candidates: Vec<&String> = hosts
                .iter()
                .filter(|(_, nets, dss)| host_satisfies(nets, dss, &requested, Some("ds1")))
                .map(|(name, _, _)| name)
                .collect();

            prop_assert_eq!(candidates.len(), valid_count);
            for _ in 0..trials {
                let chosen = choose_random(&candidates).unwrap();
                prop_assert_ne!(chosen.as_str(), "bad");
            }
        }
    }
}
