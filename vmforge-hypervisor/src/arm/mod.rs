//! Cloud deployment backend documents.
//!
//! The deployment document is submitted verbatim together with a parameter
//! object. Every parameter it declares has to be supplied; nothing is left
//! to server-side defaults.

pub mod templates;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{HypervisorError, Result};

pub use templates::{linux_template, parameter_names, LINUX_TEMPLATE};

/// Deployment mode sent with every request.
pub const DEPLOYMENT_MODE: &str = "Incremental";

/// Values for every parameter of [`LINUX_TEMPLATE`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentParameters {
    pub username: String,
    pub password: String,
    pub image_publisher: String,
    pub image_offer: String,
    pub image_sku: String,
    pub network_security_group: String,
    pub nic: String,
    /// Blob name of the OS disk
    pub os_file: String,
    /// Blob name of the data disk
    pub disk_file: String,
    pub public_ip: String,
    pub ssh_authorized_key: String,
    pub storage_account: String,
    pub storage_container: String,
    pub subnet: String,
    pub virtual_network: String,
    pub vm_size: String,
    pub vm_name: String,
    /// Data disk size in GB
    pub disk_size: String,
    /// Attach the empty data disk
    pub additional_disk: bool,
}

/// A data disk the document attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    pub name: String,
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: String,
    pub lun: u32,
    pub vhd_uri: String,
    pub create_option: String,
}

impl DeploymentParameters {
    fn values(&self) -> [(&'static str, &str); 19] {
        [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("image_publisher", self.image_publisher.as_str()),
            ("image_offer", self.image_offer.as_str()),
            ("image_sku", self.image_sku.as_str()),
            ("network_security_group", self.network_security_group.as_str()),
            ("nic", self.nic.as_str()),
            ("os_file", self.os_file.as_str()),
            ("disk_file", self.disk_file.as_str()),
            ("public_ip", self.public_ip.as_str()),
            ("ssh_authorized_key", self.ssh_authorized_key.as_str()),
            ("storage_account", self.storage_account.as_str()),
            ("storage_container", self.storage_container.as_str()),
            ("subnet", self.subnet.as_str()),
            ("virtual_network", self.virtual_network.as_str()),
            ("vm_size", self.vm_size.as_str()),
            ("vm_name", self.vm_name.as_str()),
            ("disk_size", self.disk_size.as_str()),
            ("additional_disk", if self.additional_disk { "true" } else { "false" }),
        ]
    }

    /// Reject any parameter left empty.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .values()
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(HypervisorError::InvalidConfig(format!(
                "deployment parameters missing: {}",
                missing.join(", ")
            )));
        }
        if self.additional_disk && self.disk_size.trim().parse::<u32>().is_err() {
            return Err(HypervisorError::InvalidConfig(format!(
                "disk_size must be a size in GB, got {:?}",
                self.disk_size
            )));
        }
        Ok(())
    }

    /// Parameter object in the `{"name": {"value": ...}}` form.
    pub fn to_parameters_json(&self) -> Value {
        let params: Map<String, Value> = self
            .values()
            .iter()
            .map(|(name, value)| (name.to_string(), json!({ "value": value })))
            .collect();
        Value::Object(params)
    }

    /// Data disks the document attaches for these parameters.
    pub fn data_disks(&self) -> Vec<DataDisk> {
        if !self.additional_disk {
            return Vec::new();
        }
        vec![DataDisk {
            name: "datadisk1".to_string(),
            disk_size_gb: self.disk_size.clone(),
            lun: 0,
            vhd_uri: format!(
                "http://{}.blob.core.windows.net/{}/{}",
                self.storage_account, self.storage_container, self.disk_file
            ),
            create_option: "Empty".to_string(),
        }]
    }

    /// URI of the OS disk blob.
    pub fn os_disk_uri(&self) -> String {
        format!(
            "http://{}.blob.core.windows.net/{}/{}",
            self.storage_account, self.storage_container, self.os_file
        )
    }
}

/// A deployment document with its parameters, ready to submit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRequest {
    pub template: Value,
    pub parameters: Value,
    pub mode: String,
}

impl DeploymentRequest {
    /// Pair `template` with `params`. Every parameter the template declares
    /// must be supplied, and no unknown parameter may be passed.
    pub fn new(template: Value, params: &DeploymentParameters) -> Result<Self> {
        params.validate()?;
        let parameters = params.to_parameters_json();

        let declared = parameter_names(&template);
        let supplied = parameters.as_object().map(|p| p.len()).unwrap_or_default();
        if let Some(name) = declared.iter().find(|name| parameters.get(name.as_str()).is_none()) {
            return Err(HypervisorError::InvalidConfig(format!(
                "deployment parameter {} is not supplied",
                name
            )));
        }
        if declared.len() != supplied {
            return Err(HypervisorError::InvalidConfig(format!(
                "template declares {} parameters, {} supplied",
                declared.len(),
                supplied
            )));
        }

        debug!(vm_name = %params.vm_name, "Built deployment request");
        Ok(Self {
            template,
            parameters,
            mode: DEPLOYMENT_MODE.to_string(),
        })
    }

    /// Request for [`LINUX_TEMPLATE`].
    pub fn linux(params: &DeploymentParameters) -> Result<Self> {
        Self::new(linux_template()?, params)
    }

    /// Body of the deployment call.
    pub fn to_body(&self) -> Value {
        json!({ "properties": self })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DeploymentParameters {
        DeploymentParameters {
            username: "ubuntu".to_string(),
            password: "secret".to_string(),
            image_publisher: "Canonical".to_string(),
            image_offer: "UbuntuServer".to_string(),
            image_sku: "22.04-LTS".to_string(),
            network_security_group: "web-nsg".to_string(),
            nic: "web-01-nic".to_string(),
            os_file: "web-01-os.vhd".to_string(),
            disk_file: "web-01-data.vhd".to_string(),
            public_ip: "web-01-ip".to_string(),
            ssh_authorized_key: "ssh-ed25519 AAAA".to_string(),
            storage_account: "vmforgestore".to_string(),
            storage_container: "vhds".to_string(),
            subnet: "default".to_string(),
            virtual_network: "vnet".to_string(),
            vm_size: "Standard_B2s".to_string(),
            vm_name: "web-01".to_string(),
            disk_size: "64".to_string(),
            additional_disk: true,
        }
    }

    #[test]
    fn test_parameters_cover_template() {
        let template = linux_template().unwrap();
        let json = params().to_parameters_json();
        for name in parameter_names(&template) {
            assert!(json.get(&name).is_some(), "{} not supplied", name);
        }
        assert_eq!(json["additional_disk"]["value"], "true");
        assert_eq!(json["vm_name"]["value"], "web-01");
    }

    #[test]
    fn test_empty_parameter_rejected() {
        let mut p = params();
        p.subnet = String::new();
        p.nic = " ".to_string();

        let err = p.validate().unwrap_err().to_string();
        assert!(err.contains("nic"));
        assert!(err.contains("subnet"));
        assert!(DeploymentRequest::linux(&p).is_err());
    }

    #[test]
    fn test_data_disk_selection() {
        let mut p = params();
        let disks = p.data_disks();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].name, "datadisk1");
        assert_eq!(disks[0].lun, 0);
        assert_eq!(disks[0].disk_size_gb, "64");
        assert_eq!(
            disks[0].vhd_uri,
            "http://vmforgestore.blob.core.windows.net/vhds/web-01-data.vhd"
        );

        p.additional_disk = false;
        assert!(p.data_disks().is_empty());
        assert_eq!(p.to_parameters_json()["additional_disk"]["value"], "false");
    }

    #[test]
    fn test_request_rejects_undeclared_parameter_set() {
        let template = json!({ "parameters": { "username": { "type": "string" } } });
        assert!(DeploymentRequest::new(template, &params()).is_err());

        let request = DeploymentRequest::linux(&params()).unwrap();
        assert_eq!(request.to_body()["properties"]["mode"], DEPLOYMENT_MODE);
    }
}
