//! Static IP guest customization.
//!
//! One customization spec is stored on the backend and shared by every
//! clone. It is created on first use under [`CustomSpecCache`]'s lock; each
//! clone then patches its own copy with the VM's address settings.

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::types::NetworkSetting;
use crate::vsphere::client::VimClient;
use crate::vsphere::mo;
use crate::vsphere::specs::{CustomizationSpec, CustomizationSpecItem, IpGenerator};

/// Name of the stored static IP customization spec.
pub const STATIC_IP_SPEC_NAME: &str = "vmforge-static-ip";

/// Guards creation of the stored static IP spec.
///
/// Sessions that must not race each other on the same backend share one
/// cache through an `Arc`.
#[derive(Debug)]
pub struct CustomSpecCache {
    name: String,
    lock: Mutex<()>,
}

impl Default for CustomSpecCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CustomSpecCache {
    pub fn new() -> Self {
        Self::with_name(STATIC_IP_SPEC_NAME)
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return a private copy of the stored spec, creating it if absent.
    ///
    /// The lock covers the existence check, the creation and the read;
    /// the caller's clone submission happens after it is released.
    pub async fn checkout(&self, client: &dyn VimClient) -> Result<CustomizationSpec> {
        let _guard = self.lock.lock().await;

        if !client
            .customization_spec_exists(&self.name)
            .await
            .map_err(|e| e.context("error checking custom spec"))?
        {
            info!(spec = %self.name, "Creating static IP customization spec");
            client
                .create_customization_spec(CustomizationSpecItem::static_ip(&self.name))
                .await
                .map_err(|e| e.context("error creating custom spec"))?;
        }

        let item = client
            .customization_spec(&self.name)
            .await
            .map_err(|e| e.context("error retrieving custom spec"))?;
        debug!(spec = %self.name, "Checked out customization spec");
        Ok(item.spec)
    }
}

/// Patch `spec` with the VM's static address settings.
///
/// Returns `None` when no static address is configured. With a DNS server
/// set, it is added ahead of the template's own DNS servers.
pub fn update_custom_spec(
    setting: &NetworkSetting,
    template: &mo::VirtualMachine,
    mut spec: CustomizationSpec,
) -> Option<CustomizationSpec> {
    if !setting.is_static() {
        return None;
    }

    let nic = spec.nic_setting_map.first_mut()?;
    nic.adapter.ip = IpGenerator::Fixed {
        ip_address: setting.ip.clone().unwrap_or_default(),
    };
    nic.adapter.subnet_mask = setting.subnet_mask.clone();
    if let Some(gateway) = setting.gateway.as_ref().filter(|g| !g.is_empty()) {
        nic.adapter.gateway.push(gateway.clone());
    }

    if let Some(dns) = setting.dns_server.as_ref().filter(|d| !d.is_empty()) {
        let mut servers = vec![dns.clone()];
        if let Some(guest) = &template.guest {
            for stack in &guest.ip_stack {
                if let Some(config) = &stack.dns_config {
                    servers.extend(config.ip_address.iter().cloned());
                }
            }
        }
        spec.global_ip_settings.dns_server_list.extend(servers);
    }

    Some(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsphere::mo::{DnsConfig, GuestInfo, GuestStackInfo};

    fn setting() -> NetworkSetting {
        NetworkSetting {
            ip: Some("10.0.0.5".to_string()),
            subnet_mask: Some("255.255.255.0".to_string()),
            gateway: Some("10.0.0.1".to_string()),
            dns_server: Some("10.0.0.2".to_string()),
        }
    }

    #[test]
    fn test_update_custom_spec_without_static_ip() {
        let spec = CustomizationSpecItem::static_ip("x").spec;
        assert!(update_custom_spec(&NetworkSetting::default(), &mo::VirtualMachine::default(), spec).is_none());
    }

    #[test]
    fn test_update_custom_spec_patches_nic_and_dns() {
        let template = mo::VirtualMachine {
            guest: Some(GuestInfo {
                ip_stack: vec![GuestStackInfo {
                    dns_config: Some(DnsConfig {
                        ip_address: vec!["8.8.8.8".to_string()],
                    }),
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let spec = CustomizationSpecItem::static_ip("x").spec;

        let patched = update_custom_spec(&setting(), &template, spec).unwrap();
        let adapter = &patched.nic_setting_map[0].adapter;
        assert_eq!(
            adapter.ip,
            IpGenerator::Fixed {
                ip_address: "10.0.0.5".to_string()
            }
        );
        assert_eq!(adapter.subnet_mask.as_deref(), Some("255.255.255.0"));
        assert_eq!(adapter.gateway, vec!["10.0.0.1"]);
        assert_eq!(patched.global_ip_settings.dns_server_list, vec!["10.0.0.2", "8.8.8.8"]);
    }
}
