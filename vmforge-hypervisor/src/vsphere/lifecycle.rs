//! Power operations and the waits that confirm them.

use futures::StreamExt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::types::{HeartbeatMask, HeartbeatStatus, VmState};
use crate::vsphere::client::{retrieve_one, TaskRequest};
use crate::vsphere::mo::{self, kind, GuestNicInfo, GuestState, ManagedObjectReference, PowerState};
use crate::vsphere::{SearchFilter, VsphereVm};

impl From<PowerState> for VmState {
    fn from(state: PowerState) -> Self {
        match state {
            PowerState::PoweredOn => VmState::Running,
            PowerState::PoweredOff => VmState::Stopped,
            PowerState::Suspended => VmState::Suspended,
        }
    }
}

/// Usable IPv4 addresses reported by the guest NICs.
pub fn guest_ipv4_addresses(nics: &[GuestNicInfo]) -> Vec<String> {
    nics.iter()
        .flat_map(|nic| nic.ip_address.iter())
        .filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
        .filter(|ip| !ip.is_unspecified() && !ip.is_loopback() && !ip.is_link_local())
        .map(|ip| ip.to_string())
        .collect()
}

impl VsphereVm {
    // =========================================================================
    // State
    // =========================================================================

    pub async fn power_state(&self) -> Result<PowerState> {
        Ok(self.find_self().await?.power_state())
    }

    pub async fn guest_state(&self) -> Result<GuestState> {
        Ok(self.find_self().await?.guest_state())
    }

    async fn current_guest_state(&self, vm: &ManagedObjectReference) -> Result<GuestState> {
        let view: mo::VirtualMachine = retrieve_one(self.client(), vm, &["guest.guestState"]).await?;
        Ok(view.guest_state())
    }

    /// IPv4 addresses the guest currently reports.
    pub async fn ips(&self) -> Result<Vec<String>> {
        let vm = self.find_self().await?;
        Ok(vm
            .guest
            .as_ref()
            .map(|g| guest_ipv4_addresses(&g.net))
            .unwrap_or_default())
    }

    // =========================================================================
    // Power operations
    // =========================================================================

    /// Power on, then wait for an address unless IP wait is skipped.
    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    pub async fn start(&mut self) -> Result<()> {
        let vm = self.find_self().await?;
        if matches!(vm.guest_state(), GuestState::ShuttingDown | GuestState::Resetting) {
            return Err(HypervisorError::PowerStateChanging);
        }

        info!("Powering on VM");
        self.session
            .run_task(TaskRequest::PowerOn {
                vm: vm.reference.clone(),
            })
            .await
            .map_err(|e| e.context("error powering on vm"))?;

        if !self.spec.skip_ip_wait {
            let ips = self.wait_for_ip(&vm.reference).await?;
            info!(ips = ?ips, "VM has an address");
        }
        Ok(())
    }

    /// Hard power off. A VM in standby is woken first.
    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    pub async fn halt(&mut self) -> Result<()> {
        let mut vm = self.find_self().await?;
        if vm.guest_state() == GuestState::Standby {
            debug!("VM is in standby, powering on before power off");
            self.session
                .run_task(TaskRequest::PowerOn {
                    vm: vm.reference.clone(),
                })
                .await
                .map_err(|e| e.context("error waking vm from standby"))?;
            vm = self.find_self().await?;
        }

        info!("Powering off VM");
        self.session
            .run_task(TaskRequest::PowerOff {
                vm: vm.reference.clone(),
            })
            .await
            .map_err(|e| e.context("error powering off vm"))?;
        Ok(())
    }

    /// Guest shutdown, polled until the guest reports not running.
    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    pub async fn shutdown(&mut self) -> Result<()> {
        let vm = self.find_self().await?;
        self.client()
            .shutdown_guest(&vm.reference)
            .await
            .map_err(|e| e.context("error shutting down guest"))?;

        let timeouts = self.spec.timeouts;
        for attempt in 0..timeouts.shutdown_retries {
            let state = self.current_guest_state(&vm.reference).await?;
            if state == GuestState::NotRunning {
                info!(attempt, "Guest shut down");
                return Ok(());
            }
            debug!(attempt, state = ?state, "Waiting for guest shutdown");
            self.session.sleep(timeouts.shutdown_poll_interval).await?;
        }

        Err(HypervisorError::Timeout(format!(
            "guest of {} still running after {} polls",
            self.spec.name, timeouts.shutdown_retries
        )))
    }

    /// Guest reboot, confirmed by the heartbeat returning.
    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    pub async fn restart(&mut self) -> Result<()> {
        let vm = self.find_self().await?;
        self.client()
            .reboot_guest(&vm.reference)
            .await
            .map_err(|e| e.context("error rebooting guest"))?;

        let timeouts = self.spec.timeouts;
        match self
            .wait_for_heartbeat(&vm.reference, HeartbeatMask::GRAY, Some(timeouts.gray_heartbeat))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_timeout() => warn!("Heartbeat never went gray, reboot may have been too fast to observe"),
            Err(e) => return Err(e),
        }

        self.wait_for_heartbeat(&vm.reference, HeartbeatMask::ALIVE, Some(timeouts.green_heartbeat))
            .await
            .map_err(|e| e.context("guest did not come back after reboot"))?;
        info!("Guest restarted");
        Ok(())
    }

    /// Hardware reset. When the tools were running, the heartbeat has to
    /// drop and come back.
    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    pub async fn reset(&mut self) -> Result<()> {
        let vm = self.find_self().await?;
        let tools_running = vm.guest.as_ref().is_some_and(|g| g.tools_running());

        self.session
            .run_task(TaskRequest::Reset {
                vm: vm.reference.clone(),
            })
            .await
            .map_err(|e| e.context("error resetting vm"))?;

        if !tools_running {
            debug!("Tools were not running, skipping heartbeat confirmation");
            return Ok(());
        }

        let limit = Some(self.spec.timeouts.green_heartbeat);
        self.wait_for_heartbeat(&vm.reference, HeartbeatMask::DOWN, limit).await?;
        self.wait_for_heartbeat(&vm.reference, HeartbeatMask::ALIVE, limit).await?;
        info!("VM reset");
        Ok(())
    }

    /// Power off if needed, then delete the VM.
    #[instrument(skip(self), fields(vm_name = %self.spec.name))]
    pub async fn destroy(&mut self) -> Result<()> {
        let vm = self.find_self().await?;
        if vm.power_state() == PowerState::PoweredOn {
            self.halt().await?;
        }

        info!("Destroying VM");
        self.session
            .run_task(TaskRequest::Destroy {
                vm: vm.reference.clone(),
            })
            .await
            .map_err(|e| e.context("error destroying vm"))?;
        Ok(())
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Wait until the heartbeat status is one of `mask`.
    ///
    /// Returns at once when the current status already matches.
    #[instrument(skip(self, vm), fields(vm = %vm.value))]
    pub async fn wait_for_heartbeat(
        &self,
        vm: &ManagedObjectReference,
        mask: HeartbeatMask,
        timeout: Option<Duration>,
    ) -> Result<HeartbeatStatus> {
        self.session
            .wait("waiting for heartbeat", timeout, async {
                let mut changes = self.client().watch(vm, "guestHeartbeatStatus").await?;
                while let Some(value) = changes.next().await {
                    let Ok(status) = serde_json::from_value::<HeartbeatStatus>(value?) else {
                        continue;
                    };
                    debug!(status = ?status, "Heartbeat status");
                    if mask.contains(status) {
                        return Ok(status);
                    }
                }
                Err(HypervisorError::Backend("heartbeat subscription ended".to_string()))
            })
            .await
    }

    /// Wait until the guest reports an IPv4 address.
    pub async fn wait_for_ip(&self, vm: &ManagedObjectReference) -> Result<Vec<String>> {
        self.session
            .wait("waiting for ip", Some(self.spec.timeouts.effective_ip_wait()), async {
                let mut changes = self.client().watch(vm, "guest.net").await?;
                while let Some(value) = changes.next().await {
                    let Ok(nics) = serde_json::from_value::<Vec<GuestNicInfo>>(value?) else {
                        continue;
                    };
                    let ips = guest_ipv4_addresses(&nics);
                    if !ips.is_empty() {
                        return Ok(ips);
                    }
                }
                Err(HypervisorError::Backend("guest network subscription ended".to_string()))
            })
            .await
    }

    // =========================================================================
    // Custom fields
    // =========================================================================

    /// Set a custom field on a VM or template, defining the field first if
    /// needed.
    pub async fn set_custom_field(&self, filter: &SearchFilter, name: &str, value: &str) -> Result<()> {
        let vm = self.find_vm(filter).await?;
        let key = match self.client().custom_field_key(name).await? {
            Some(key) => key,
            None => self
                .client()
                .add_custom_field(name, kind::VIRTUAL_MACHINE)
                .await
                .map_err(|e| e.context(format!("error adding custom field {}", name)))?,
        };
        self.client()
            .set_custom_field(&vm.reference, key, value)
            .await
            .map_err(|e| e.context(format!("error setting custom field {}", name)))
    }
}
