//! VM specification and lifecycle timeouts.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{HypervisorError, Result};
use crate::types::*;

/// Environment variable overriding how long to wait for a guest IP.
pub const IPWAIT_TIMEOUT_ENV: &str = "IPWAIT_TIMEOUT";

/// Connection settings for the management endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// vCenter / ESXi host name or address
    pub host: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Datacenter the VM lives in
    pub datacenter: String,
}

/// Everything needed to provision and manage one VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSpec {
    /// Connection settings
    pub connection: ConnectionConfig,
    /// VM name (inventory path inside the datacenter VM folder)
    pub name: String,
    /// Clone source
    pub template: Template,
    /// OVA location (http(s) URL or local path) for template upload
    pub ova_path_url: Option<String>,
    /// Already extracted OVF descriptor, used when no OVA location is set
    pub ovf_path: Option<String>,
    /// Datastores the clone may land on (one is picked at random)
    pub datastores: Vec<String>,
    /// Placement
    pub destination: Option<Destination>,
    /// CPU / memory overrides
    pub flavor: Flavor,
    /// Data disks added after cloning
    pub disks: Vec<Disk>,
    /// Template disks to keep (and possibly grow); others are removed
    pub fixed_disks: Vec<Disk>,
    /// Networks, matched positionally against the template NICs
    pub networks: Vec<Network>,
    /// Static IP settings
    pub network_setting: NetworkSetting,
    /// Ordered question rules, all matching rules are applied
    pub question_responses: Vec<QuestionResponse>,
    /// Clone from a snapshot instead of a full copy
    pub use_linked_clones: bool,
    /// Keep one template copy per datastore
    pub use_local_templates: bool,
    /// Do not wait for an IP after power on
    pub skip_ip_wait: bool,
    /// Expose hardware virtualization to the guest
    pub nested_hv: bool,
    /// Lifecycle timeouts
    #[serde(skip)]
    pub timeouts: Timeouts,
}

impl VmSpec {
    /// Create a spec for `name` with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Load a spec from a YAML file.
    ///
    /// Timeouts are taken from the defaults plus environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            HypervisorError::InvalidConfig(format!(
                "Failed to read spec file {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut spec: VmSpec = serde_yaml::from_str(&content).map_err(|e| {
            HypervisorError::InvalidConfig(format!("Failed to parse spec file: {}", e))
        })?;
        spec.timeouts = Timeouts::from_env();
        spec.validate()?;

        Ok(spec)
    }

    /// Check the fields every operation relies on.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HypervisorError::InvalidConfig("VM name is required".to_string()));
        }
        if self.connection.datacenter.is_empty() {
            return Err(HypervisorError::InvalidConfig("datacenter is required".to_string()));
        }
        for network in &self.networks {
            if network.name.is_empty() {
                return Err(HypervisorError::InvalidConfig(
                    "network name must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Requested network names in order.
    pub fn network_names(&self) -> Vec<String> {
        self.networks.iter().map(|n| n.name.clone()).collect()
    }
}

/// Bounds on the blocking waits of the lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Interval between guest state polls during shutdown
    pub shutdown_poll_interval: Duration,
    /// Number of polls before shutdown times out
    pub shutdown_retries: u32,
    /// How long a reboot may take to drop the heartbeat to gray
    pub gray_heartbeat: Duration,
    /// How long a rebooted guest may take to report green/yellow
    pub green_heartbeat: Duration,
    /// How long to wait for a guest IPv4 address
    pub ip_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            shutdown_poll_interval: Duration::from_secs(5),
            shutdown_retries: 20,
            gray_heartbeat: Duration::from_secs(60),
            green_heartbeat: Duration::from_secs(10 * 60),
            ip_wait: Duration::from_secs(60 * 60),
        }
    }
}

impl Timeouts {
    /// Defaults with `IPWAIT_TIMEOUT` applied.
    pub fn from_env() -> Self {
        let mut timeouts = Self::default();
        if let Ok(value) = std::env::var(IPWAIT_TIMEOUT_ENV) {
            timeouts.ip_wait = parse_ip_wait(&value);
        }
        timeouts
    }

    /// IP wait bound for the next wait: `IPWAIT_TIMEOUT` when it is set,
    /// the configured value otherwise.
    pub fn effective_ip_wait(&self) -> Duration {
        match std::env::var(IPWAIT_TIMEOUT_ENV) {
            Ok(value) => parse_ip_wait(&value),
            Err(_) => self.ip_wait,
        }
    }
}

/// Parse an IP wait duration such as `90s`, `2h` or `1h 30m`.
///
/// Invalid or empty values fall back to one hour.
pub fn parse_ip_wait(value: &str) -> Duration {
    let default = Timeouts::default().ip_wait;
    let value = value.trim();
    if value.is_empty() {
        return default;
    }
    match humantime::parse_duration(value) {
        Ok(duration) => duration,
        Err(e) => {
            warn!(value = %value, error = %e, "Ignoring invalid {}", IPWAIT_TIMEOUT_ENV);
            default
        }
    }
}
