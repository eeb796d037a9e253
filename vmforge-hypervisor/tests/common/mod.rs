//! Shared inventory fixture for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vmforge_hypervisor::vsphere::mo::ManagedObjectReference;
use vmforge_hypervisor::vsphere::mock::{MockDatacenter, MockVimClient, RecordingUploader, VmFixture};
use vmforge_hypervisor::vsphere::{DiskUploader, VimClient};
use vmforge_hypervisor::{ConnectionConfig, Destination, Session, Template, Timeouts, VmSpec, VsphereVm};

/// One datacenter `DC1` with:
/// - networks `VM Network` (standard) and `backend` (distributed, switch `dvs-uuid-1`)
/// - datastores `ds1` and `ds2`
/// - cluster `prod` (DRS on) with `esx-01` (both networks, ds1+ds2) and
///   `esx-02` (`VM Network` only, ds1)
/// - standalone host `esx-cr` wrapping `esx-03` (`VM Network`, ds1)
/// - folder `templates` holding template `ubuntu`
pub struct Lab {
    pub mock: Arc<MockVimClient>,
    pub dc: MockDatacenter,
    pub vm_network: ManagedObjectReference,
    pub backend: ManagedObjectReference,
    pub ds1: ManagedObjectReference,
    pub ds2: ManagedObjectReference,
    pub esx01: ManagedObjectReference,
    pub esx02: ManagedObjectReference,
    pub esx03: ManagedObjectReference,
    pub cluster: ManagedObjectReference,
    pub standalone: ManagedObjectReference,
    pub templates: ManagedObjectReference,
    pub template: ManagedObjectReference,
}

impl Lab {
    pub fn new() -> Self {
        Self::with_mock(MockVimClient::new())
    }

    pub fn with_mock(mock: MockVimClient) -> Self {
        let mock = Arc::new(mock);
        let dc = mock.add_datacenter("DC1").unwrap();
        let vm_network = mock.add_network(&dc, "VM Network").unwrap();
        let backend = mock.add_portgroup(&dc, "backend", "dvs-uuid-1").unwrap();
        let ds1 = mock.add_datastore(&dc, "ds1").unwrap();
        let ds2 = mock.add_datastore(&dc, "ds2").unwrap();

        let esx01 = mock
            .add_host("esx-01", &[vm_network.clone(), backend.clone()], &[ds1.clone(), ds2.clone()])
            .unwrap();
        let esx02 = mock.add_host("esx-02", &[vm_network.clone()], &[ds1.clone()]).unwrap();
        let esx03 = mock.add_host("esx-03", &[vm_network.clone()], &[ds1.clone()]).unwrap();

        let cluster = mock
            .add_cluster(&dc, &dc.host_folder, "prod", &[esx01.clone(), esx02.clone()], true)
            .unwrap();
        let standalone = mock
            .add_compute_resource(&dc, &dc.host_folder, "esx-cr", &esx03)
            .unwrap();

        let templates = mock.add_folder(&dc.vm_folder, "templates").unwrap();
        let template = mock
            .add_vm(
                &templates,
                VmFixture::template("ubuntu")
                    .with_hardware(2, 2048)
                    .on_host(&esx01)
                    .with_datastore(&ds1)
                    .with_dns_server("8.8.8.8"),
            )
            .unwrap();

        Self {
            mock,
            dc,
            vm_network,
            backend,
            ds1,
            ds2,
            esx01,
            esx02,
            esx03,
            cluster,
            standalone,
            templates,
            template,
        }
    }

    pub fn session(&self) -> Session {
        self.session_with(Arc::new(RecordingUploader::new()))
    }

    pub fn session_with(&self, uploader: Arc<dyn DiskUploader>) -> Session {
        let client: Arc<dyn VimClient> = self.mock.clone();
        Session::connect(&connection(), |_, _| Ok(client))
            .unwrap()
            .with_uploader(uploader)
    }

    /// Handle for `name` in the cluster, cloned from `templates/ubuntu`.
    pub fn vm(&self, name: &str) -> VsphereVm {
        VsphereVm::new(self.session(), spec(name))
    }

    pub fn vm_with(&self, spec: VmSpec) -> VsphereVm {
        VsphereVm::new(self.session(), spec)
    }
}

pub fn connection() -> ConnectionConfig {
    ConnectionConfig {
        host: "vcenter.local".to_string(),
        username: "administrator@vsphere.local".to_string(),
        password: "secret".to_string(),
        insecure: true,
        datacenter: "DC1".to_string(),
    }
}

/// Waits short enough for tests, long enough for the mock's guest delay.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        shutdown_poll_interval: Duration::from_millis(20),
        shutdown_retries: 100,
        gray_heartbeat: Duration::from_secs(2),
        green_heartbeat: Duration::from_secs(2),
        ip_wait: Duration::from_secs(2),
    }
}

pub fn spec(name: &str) -> VmSpec {
    let mut spec = VmSpec::new(name);
    spec.connection = connection();
    spec.template = Template::new("templates/ubuntu");
    spec.datastores = vec!["ds1".to_string()];
    spec.destination = Some(Destination::Cluster {
        name: "prod".to_string(),
        host_system: None,
    });
    spec.timeouts = fast_timeouts();
    spec
}
