//! Integration tests for power operations, waits and session handling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connection, spec, Lab};
use vmforge_hypervisor::vsphere::mo::{GuestState, PowerState, TaskState};
use vmforge_hypervisor::vsphere::mock::{MockVimClient, VmFixture};
use vmforge_hypervisor::vsphere::VimClient;
use vmforge_hypervisor::{
    HeartbeatMask, HeartbeatStatus, HypervisorError, SearchFilter, Session, Template, VirtualMachine, VmState,
};

fn operations(lab: &Lab) -> Vec<&'static str> {
    lab.mock.submitted().iter().map(|r| r.operation()).collect()
}

fn running_vm(lab: &Lab, name: &str) -> vmforge_hypervisor::vsphere::mo::ManagedObjectReference {
    lab.mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new(name).on_host(&lab.esx01).running())
        .unwrap()
}

/// Test that starting a VM waits for a usable address.
#[tokio::test]
async fn test_start_waits_for_ip() {
    let lab = Lab::new();
    lab.mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01").on_host(&lab.esx01))
        .unwrap();

    let mut vm = lab.vm("app-01");
    assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOff);
    vm.start().await.unwrap();

    assert_eq!(operations(&lab), vec!["power on"]);
    assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOn);
    assert_eq!(vm.guest_state().await.unwrap(), GuestState::Running);
    assert_eq!(vm.ips().await.unwrap().len(), 1);
}

/// Test that starting during a shutdown is refused.
#[tokio::test]
async fn test_start_while_shutting_down() {
    let lab = Lab::new();
    lab.mock
        .add_vm(
            &lab.dc.vm_folder,
            VmFixture::new("app-01").running().with_guest_state(GuestState::ShuttingDown),
        )
        .unwrap();

    let mut vm = lab.vm("app-01");
    assert!(matches!(vm.start().await, Err(HypervisorError::PowerStateChanging)));
    assert!(lab.mock.submitted().is_empty());
}

/// Test that only link-local addresses never satisfy the address wait.
#[tokio::test]
async fn test_start_ip_wait_times_out() {
    let lab = Lab::new();
    lab.mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01").with_ip("169.254.9.9"))
        .unwrap();

    let mut spec = spec("app-01");
    spec.timeouts.ip_wait = Duration::from_millis(100);
    let mut vm = lab.vm_with(spec);
    assert!(vm.start().await.unwrap_err().is_timeout());

    let mut spec = common::spec("app-01");
    spec.skip_ip_wait = true;
    let mut vm = lab.vm_with(spec);
    vm.start().await.unwrap();
}

/// Test that reported addresses are filtered to usable IPv4.
#[tokio::test]
async fn test_ips_filtered() {
    let lab = Lab::new();
    lab.mock
        .add_vm(
            &lab.dc.vm_folder,
            VmFixture::new("app-01")
                .running()
                .with_ip("169.254.1.1")
                .with_ip("fe80::1")
                .with_ip("10.1.1.5"),
        )
        .unwrap();

    assert_eq!(lab.vm("app-01").ips().await.unwrap(), vec!["10.1.1.5"]);
}

/// Test hard power off of a running VM.
#[tokio::test]
async fn test_halt() {
    let lab = Lab::new();
    running_vm(&lab, "app-01");

    let mut vm = lab.vm("app-01");
    vm.halt().await.unwrap();
    assert_eq!(operations(&lab), vec!["power off"]);
    assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOff);
}

/// Test that a VM in standby is woken before it is powered off.
#[tokio::test]
async fn test_halt_from_standby() {
    let lab = Lab::new();
    lab.mock
        .add_vm(
            &lab.dc.vm_folder,
            VmFixture::new("app-01").running().with_guest_state(GuestState::Standby),
        )
        .unwrap();

    let mut vm = lab.vm("app-01");
    vm.halt().await.unwrap();
    assert_eq!(operations(&lab), vec!["power on", "power off"]);
    assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOff);
}

/// Test guest shutdown polling until the guest is down.
#[tokio::test]
async fn test_shutdown() {
    let lab = Lab::new();
    running_vm(&lab, "app-01");

    let mut vm = lab.vm("app-01");
    vm.shutdown().await.unwrap();
    assert_eq!(vm.guest_state().await.unwrap(), GuestState::NotRunning);
    assert_eq!(vm.power_state().await.unwrap(), PowerState::PoweredOff);
    assert!(vm.ips().await.unwrap().is_empty());
    // No power task is involved in a guest shutdown
    assert!(lab.mock.submitted().is_empty());
}

/// Test that a guest slower than the shutdown retries times out.
#[tokio::test]
async fn test_shutdown_timeout() {
    let lab = Lab::with_mock(MockVimClient::new().with_guest_delay(Duration::from_secs(10)));
    running_vm(&lab, "app-01");

    let mut spec = spec("app-01");
    spec.timeouts.shutdown_retries = 3;
    let mut vm = lab.vm_with(spec);

    let err = vm.shutdown().await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(vm.guest_state().await.unwrap(), GuestState::ShuttingDown);
}

/// Test that a guest reboot completes once the heartbeat is back.
#[tokio::test]
async fn test_restart() {
    let lab = Lab::new();
    let app = running_vm(&lab, "app-01");

    let mut vm = lab.vm("app-01");
    vm.restart().await.unwrap();
    assert_eq!(
        lab.mock.property(&app, "guestHeartbeatStatus"),
        Some(serde_json::json!("green"))
    );
}

/// Test that a reboot whose heartbeat never returns fails.
#[tokio::test]
async fn test_restart_without_heartbeat() {
    let lab = Lab::with_mock(MockVimClient::new().with_guest_delay(Duration::from_secs(10)));
    running_vm(&lab, "app-01");

    let mut spec = spec("app-01");
    spec.timeouts.green_heartbeat = Duration::from_millis(100);
    let mut vm = lab.vm_with(spec);
    assert!(vm.restart().await.unwrap_err().is_timeout());
}

/// Test that a reset with running tools waits for the heartbeat cycle.
#[tokio::test]
async fn test_reset_with_tools() {
    let lab = Lab::with_mock(MockVimClient::new().with_guest_delay(Duration::from_millis(300)));
    let app = running_vm(&lab, "app-01");

    let mut vm = lab.vm("app-01");
    vm.reset().await.unwrap();
    assert_eq!(operations(&lab), vec!["reset"]);
    assert_eq!(
        lab.mock.property(&app, "guestHeartbeatStatus"),
        Some(serde_json::json!("green"))
    );
}

/// Test that a reset without tools returns right after the task.
#[tokio::test]
async fn test_reset_without_tools() {
    let lab = Lab::with_mock(MockVimClient::new().with_guest_delay(Duration::from_secs(10)));
    lab.mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01"))
        .unwrap();

    let mut vm = lab.vm("app-01");
    vm.reset().await.unwrap();
    assert_eq!(operations(&lab), vec!["reset"]);
}

/// Test that a running VM is powered off before it is destroyed.
#[tokio::test]
async fn test_destroy_running_vm() {
    let lab = Lab::new();
    running_vm(&lab, "app-01");

    let mut vm = lab.vm("app-01");
    vm.destroy().await.unwrap();
    assert_eq!(operations(&lab), vec!["power off", "destroy"]);
    assert!(!vm.exists(&SearchFilter::vm("app-01")).await.unwrap());
    assert!(vm.destroy().await.unwrap_err().is_not_found());
}

/// Test the provider-neutral state and capabilities.
#[tokio::test]
async fn test_trait_state_and_capabilities() {
    let lab = Lab::new();
    running_vm(&lab, "app-01");
    lab.mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-02"))
        .unwrap();

    let running: Box<dyn VirtualMachine> = Box::new(lab.vm("app-01"));
    let stopped: Box<dyn VirtualMachine> = Box::new(lab.vm("app-02"));
    assert_eq!(running.state().await.unwrap(), VmState::Running);
    assert_eq!(stopped.state().await.unwrap(), VmState::Stopped);

    let capabilities = running.capabilities();
    assert_eq!(capabilities.name, "vsphere");
    assert!(capabilities.supports_linked_clones);
    assert!(capabilities.supports_static_ip);
    assert!(capabilities.supports_guest_operations);
    assert!(capabilities.supports_templates);
}

/// Test that a heartbeat already in the wanted state returns at once.
#[tokio::test]
async fn test_heartbeat_already_matching() {
    let lab = Lab::new();
    let app = running_vm(&lab, "app-01");

    let vm = lab.vm("app-01");
    let status = vm
        .wait_for_heartbeat(&app, HeartbeatMask::GREEN, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(status, HeartbeatStatus::Green);
}

/// Test a heartbeat change observed through the subscription.
#[tokio::test]
async fn test_heartbeat_change_observed() {
    let lab = Lab::new();
    let app = lab
        .mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01"))
        .unwrap();

    let vm = lab.vm("app-01");
    let mock = lab.mock.clone();
    let target = app.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        mock.set_property(&target, "guestHeartbeatStatus", serde_json::json!("yellow"))
            .unwrap();
    });

    let status = vm
        .wait_for_heartbeat(&app, HeartbeatMask::ALIVE, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(status, HeartbeatStatus::Yellow);
}

/// Test that a heartbeat wait hits its deadline.
#[tokio::test]
async fn test_heartbeat_timeout() {
    let lab = Lab::new();
    let app = lab
        .mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01"))
        .unwrap();

    let vm = lab.vm("app-01");
    let err = vm
        .wait_for_heartbeat(&app, HeartbeatMask::ALIVE, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

/// Test that closing the session cancels an unbounded wait.
#[tokio::test]
async fn test_close_cancels_wait() {
    let lab = Lab::new();
    let app = lab
        .mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01"))
        .unwrap();

    let vm = lab.vm("app-01");
    let session = vm.session().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close();
    });

    let err = vm
        .wait_for_heartbeat(&app, HeartbeatMask::ALIVE, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HypervisorError::Cancelled(_)));
}

/// Test that closing the session stops a shutdown poll.
#[tokio::test]
async fn test_close_cancels_shutdown() {
    let lab = Lab::with_mock(MockVimClient::new().with_guest_delay(Duration::from_secs(10)));
    running_vm(&lab, "app-01");

    let mut spec = spec("app-01");
    spec.timeouts.shutdown_poll_interval = Duration::from_secs(5);
    let mut vm = lab.vm_with(spec);
    let session = vm.session().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close();
    });

    assert!(matches!(vm.shutdown().await, Err(HypervisorError::Cancelled(_))));
}

/// Test active task detection on a VM's recent tasks.
#[tokio::test]
async fn test_has_active_task() {
    let lab = Lab::new();
    let app = running_vm(&lab, "app-01");
    let vm = lab.vm("app-01");

    let done = lab.mock.add_recent_task(&app, TaskState::Success).unwrap();
    let current = vm.find_self().await.unwrap();
    assert!(!vm.session().has_active_task(&current).await);

    lab.mock.add_recent_task(&app, TaskState::Running).unwrap();
    let current = vm.find_self().await.unwrap();
    assert!(vm.session().has_active_task(&current).await);

    // An unreadable task is skipped
    lab.mock.remove_object(&done).unwrap();
    let current = vm.find_self().await.unwrap();
    assert!(vm.session().has_active_task(&current).await);
}

/// Test that waiting on several tasks tolerates failed ones.
#[tokio::test]
async fn test_wait_for_tasks() {
    let lab = Lab::new();
    let app = running_vm(&lab, "app-01");
    let ok = lab.mock.add_recent_task(&app, TaskState::Success).unwrap();
    let failed = lab.mock.add_recent_task(&app, TaskState::Error).unwrap();

    let vm = lab.vm("app-01");
    vm.session().wait_for_tasks(&[ok, failed]).await.unwrap();
}

/// Test setting custom fields, defining the field on first use.
#[tokio::test]
async fn test_set_custom_field() {
    let lab = Lab::new();
    let app = running_vm(&lab, "app-01");
    let vm = lab.vm("app-01");

    vm.set_custom_field(&SearchFilter::vm("app-01"), "owner", "team-a")
        .await
        .unwrap();
    vm.set_custom_field(&SearchFilter::template(&Template::new("templates/ubuntu")), "owner", "team-b")
        .await
        .unwrap();
    vm.set_custom_field(&SearchFilter::vm("app-01"), "owner", "team-c")
        .await
        .unwrap();

    assert_eq!(lab.mock.custom_field(&app, "owner").as_deref(), Some("team-c"));
    assert_eq!(lab.mock.custom_field(&lab.template, "owner").as_deref(), Some("team-b"));
}

/// Test that an empty host cannot be connected to.
#[tokio::test]
async fn test_connect_empty_host() {
    let mut config = connection();
    config.host = String::new();
    let err = Session::connect(&config, |_, _| Ok(Arc::new(MockVimClient::new()) as Arc<dyn VimClient>))
        .unwrap_err();
    assert!(matches!(err, HypervisorError::ParsingUrl { .. }));
}

/// Test that a failing connector is reported as a client failure.
#[tokio::test]
async fn test_connect_client_failure() {
    let err = Session::connect(&connection(), |url, insecure| {
        assert_eq!(url.host_str(), Some("vcenter.local"));
        assert_eq!(url.path(), "/sdk");
        assert!(url.username().starts_with("administrator"));
        assert_eq!(url.password(), Some("secret"));
        assert!(insecure);
        Err(HypervisorError::Backend("connection refused".to_string()))
    })
    .unwrap_err();

    match err {
        HypervisorError::ClientFailed(reason) => assert!(reason.contains("connection refused")),
        other => panic!("unexpected error {:?}", other),
    }
}
