//! Provider-agnostic VM lifecycle trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::VmState;

/// Features a provider backend supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// Name of the provider (e.g., "vsphere")
    pub name: String,
    /// Clones can share the template's disks through a snapshot
    pub supports_linked_clones: bool,
    /// Guest addresses can be set at clone time
    pub supports_static_ip: bool,
    /// Shutdown and reboot go through the guest tools
    pub supports_guest_operations: bool,
    /// Templates are uploaded on demand from an OVA/OVF image
    pub supports_templates: bool,
}

/// Lifecycle of one virtual machine.
///
/// Implementations own the VM description they were created with; every
/// operation acts on that VM.
#[async_trait]
pub trait VirtualMachine: Send + Sync {
    /// Name of the VM.
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Create the VM, uploading the template first when it is missing.
    ///
    /// Leaves the VM running.
    async fn provision(&mut self) -> Result<()>;

    /// Delete the VM, powering it off first when needed.
    async fn destroy(&mut self) -> Result<()>;

    // =========================================================================
    // Power
    // =========================================================================

    async fn state(&self) -> Result<VmState>;

    async fn start(&mut self) -> Result<()>;

    /// Hard power off.
    async fn halt(&mut self) -> Result<()>;

    /// Graceful shutdown through the guest.
    async fn shutdown(&mut self) -> Result<()>;

    /// Graceful reboot through the guest.
    async fn restart(&mut self) -> Result<()>;

    /// Hardware reset.
    async fn reset(&mut self) -> Result<()>;

    // =========================================================================
    // Guest
    // =========================================================================

    /// IPv4 addresses reported by the guest.
    async fn ips(&self) -> Result<Vec<String>>;
}
