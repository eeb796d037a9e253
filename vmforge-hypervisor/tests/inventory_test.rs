//! Integration tests for inventory resolution and placement.

mod common;

use common::{spec, Lab};
use vmforge_hypervisor::vsphere::mo::{ChoiceOption, ElementDescription, QuestionInfo};
use vmforge_hypervisor::vsphere::mock::{MockVimClient, VmFixture};
use vmforge_hypervisor::vsphere::MobSearch;
use vmforge_hypervisor::{Destination, HypervisorError, Network, QuestionResponse, SearchFilter};

/// Test lookup by path through nested folders with escaped names.
#[tokio::test]
async fn test_find_vm_by_path() {
    let lab = Lab::new();
    let web = lab.mock.add_folder(&lab.dc.vm_folder, "web%2Ffrontend").unwrap();
    let nested = lab.mock.add_folder(&web, "blue").unwrap();
    let target = lab.mock.add_vm(&nested, VmFixture::new("web-01")).unwrap();
    // Same name one level up must not match the full path
    lab.mock.add_vm(&web, VmFixture::new("web-01")).unwrap();

    let vm = lab.vm("web\\/frontend/blue/web-01");
    let found = vm.find_self().await.unwrap();
    assert_eq!(found.reference, target);
    assert_eq!(found.name, "web-01");

    let missing = vm.find_vm(&SearchFilter::vm("web\\/frontend/web-02")).await.unwrap_err();
    assert!(missing.is_not_found());
    assert!(!vm.exists(&SearchFilter::vm("nowhere/web-01")).await.unwrap());
}

/// Test that a folder cannot be matched as the last path segment.
#[tokio::test]
async fn test_folder_is_not_a_vm() {
    let lab = Lab::new();
    let vm = lab.vm("templates");
    assert!(vm.find_self().await.unwrap_err().is_not_found());
}

/// Test UUID lookup scoped to the configured datacenter.
#[tokio::test]
async fn test_find_vm_by_uuid_respects_datacenter() {
    let lab = Lab::new();
    let dc2 = lab.mock.add_datacenter("DC2").unwrap();
    let uuid = "4210d7c4-2d5a-4ef1-9b1c-1e0c4d5e6f70";
    let remote = lab
        .mock
        .add_vm(&dc2.vm_folder, VmFixture::new("db-01").with_instance_uuid(uuid))
        .unwrap();

    let vm = lab.vm("db-01");
    let scoped = SearchFilter {
        name: "db-01".to_string(),
        instance_uuid: Some(uuid.to_string()),
        search_in_dc: true,
    };
    assert!(vm.find_vm(&scoped).await.unwrap_err().is_not_found());

    let global = SearchFilter {
        search_in_dc: false,
        ..scoped
    };
    let found = vm.find_vm(&global).await.unwrap();
    assert_eq!(found.reference, remote);
}

/// Test that templates are found by UUID anywhere in the inventory.
#[tokio::test]
async fn test_template_filter_uses_uuid() {
    let lab = Lab::new();
    let uuid = lab.mock.vm(&lab.template).unwrap().config.unwrap().instance_uuid.unwrap();

    let mut template = vmforge_hypervisor::Template::new("renamed/elsewhere");
    template.instance_uuid = Some(uuid);
    let vm = lab.vm("web-01");
    let found = vm.find_vm(&SearchFilter::template(&template)).await.unwrap();
    assert_eq!(found.reference, lab.template);
}

/// Test that a pending question is answered while the VM is resolved.
#[tokio::test]
async fn test_pending_question_answered_on_lookup() {
    let lab = Lab::new();
    let question = QuestionInfo {
        id: "msg-7".to_string(),
        text: "Insert disk into drive sata0:1".to_string(),
        choice: ChoiceOption {
            choice_info: vec![
                ElementDescription {
                    key: "0".to_string(),
                    label: "Cancel".to_string(),
                    summary: "Cancel".to_string(),
                },
                ElementDescription {
                    key: "1".to_string(),
                    label: "Retry".to_string(),
                    summary: "Retry".to_string(),
                },
            ],
        },
    };
    let target = lab
        .mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01").with_question(question))
        .unwrap();

    let mut spec = spec("app-01");
    spec.question_responses = vec![
        QuestionResponse::new("^Insert disk.*", "retry"),
        QuestionResponse::new("^Something else", "Cancel"),
    ];
    let vm = lab.vm_with(spec);
    vm.find_self().await.unwrap();

    let answers = lab.mock.answers();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].vm, target);
    assert_eq!(answers[0].question_id, "msg-7");
    assert_eq!(answers[0].answer, "1");
    assert!(lab.mock.property(&target, "runtime.question").is_none());
}

/// Test that every matching response rule is applied, in table order.
#[tokio::test]
async fn test_all_matching_question_rules_applied_in_order() {
    let lab = Lab::new();
    let question = QuestionInfo {
        id: "msg-9".to_string(),
        text: "Insert disk into drive sata0:1".to_string(),
        choice: ChoiceOption {
            choice_info: vec![
                ElementDescription {
                    key: "0".to_string(),
                    label: "Cancel".to_string(),
                    summary: "Cancel".to_string(),
                },
                ElementDescription {
                    key: "1".to_string(),
                    label: "Retry".to_string(),
                    summary: "Retry".to_string(),
                },
            ],
        },
    };
    let target = lab
        .mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-02").with_question(question))
        .unwrap();

    let mut spec = spec("app-02");
    spec.question_responses = vec![
        QuestionResponse::new("^Insert", "Retry"),
        QuestionResponse::new("disk", "2"),
    ];
    let vm = lab.vm_with(spec);
    vm.find_self().await.unwrap();

    let answers: Vec<_> = lab.mock.answers().into_iter().map(|a| a.answer).collect();
    assert_eq!(answers, vec!["1", "2"]);
    assert!(lab.mock.answers().iter().all(|a| a.vm == target && a.question_id == "msg-9"));
}

/// Test that an invalid response pattern is a configuration error.
#[tokio::test]
async fn test_invalid_question_pattern() {
    let lab = Lab::new();
    let question = QuestionInfo {
        id: "msg-1".to_string(),
        text: "anything".to_string(),
        ..Default::default()
    };
    lab.mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("app-01").with_question(question))
        .unwrap();

    let mut spec = spec("app-01");
    spec.question_responses = vec![QuestionResponse::new("([", "x")];
    let err = lab.vm_with(spec).find_self().await.unwrap_err();
    assert!(matches!(err, HypervisorError::InvalidConfig(_)));
}

/// Test the placement target search outcomes.
#[tokio::test]
async fn test_search_mob() {
    let lab = Lab::new();
    let vm = lab.vm("web-01");

    let nested = lab.mock.add_folder(&lab.dc.host_folder, "edge").unwrap();
    lab.mock.add_folder(&nested, "empty").unwrap();
    let edge_host = lab.mock.add_host("esx-09", &[], &[]).unwrap();
    let edge = lab.mock.add_compute_resource(&lab.dc, &nested, "edge-cr", &edge_host).unwrap();

    assert_eq!(
        vm.search_mob(&lab.dc.host_folder, "edge-cr").await.unwrap(),
        MobSearch::Found(edge)
    );
    assert_eq!(
        vm.search_mob(&lab.dc.host_folder, "prod").await.unwrap(),
        MobSearch::Found(lab.cluster.clone())
    );
    assert_eq!(
        vm.search_mob(&lab.dc.host_folder, "nope").await.unwrap(),
        MobSearch::Missing
    );

    let bare = lab.mock.add_folder(&lab.dc.host_folder, "bare").unwrap();
    assert_eq!(vm.search_mob(&bare, "prod").await.unwrap(), MobSearch::Empty);
}

/// Test that a host destination resolves to its host and root pool.
#[tokio::test]
async fn test_resolve_host_destination() {
    let lab = Lab::new();
    let mut spec = spec("web-01");
    spec.destination = Some(Destination::Host {
        name: "esx-cr".to_string(),
    });
    spec.networks = vec![Network::new("VM Network")];
    let vm = lab.vm_with(spec);

    let dc = vm.datacenter().await.unwrap();
    let location = vm.resolve_location(&dc).await.unwrap();
    assert_eq!(location.host, Some(lab.esx03.clone()));
    assert_eq!(location.networks, vec![lab.vm_network.clone()]);
}

/// Test that a host missing a requested network is rejected.
#[tokio::test]
async fn test_resolve_host_without_network() {
    let lab = Lab::new();
    let mut spec = spec("web-01");
    spec.destination = Some(Destination::Host {
        name: "esx-cr".to_string(),
    });
    spec.networks = vec![Network::new("backend")];
    let vm = lab.vm_with(spec);

    let dc = vm.datacenter().await.unwrap();
    match vm.resolve_location(&dc).await.unwrap_err() {
        HypervisorError::InvalidHost { host, networks, .. } => {
            assert_eq!(host, "esx-cr");
            assert_eq!(networks, vec!["backend"]);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

/// Test that only hosts carrying every network are picked in a cluster.
#[tokio::test]
async fn test_cluster_host_selection() {
    let lab = Lab::new();
    let mut spec = spec("web-01");
    spec.networks = vec![Network::new("VM Network"), Network::new("backend")];
    let vm = lab.vm_with(spec);
    let dc = vm.datacenter().await.unwrap();

    for _ in 0..10 {
        let location = vm.resolve_location(&dc).await.unwrap();
        assert_eq!(location.host, Some(lab.esx01.clone()));
    }
}

/// Test pinning a host inside a cluster.
#[tokio::test]
async fn test_cluster_host_override() {
    let lab = Lab::new();
    let mut spec = spec("web-01");
    spec.destination = Some(Destination::Cluster {
        name: "prod".to_string(),
        host_system: Some("esx-02".to_string()),
    });
    spec.networks = vec![Network::new("backend")];
    let vm = lab.vm_with(spec.clone());
    let dc = vm.datacenter().await.unwrap();
    assert!(matches!(
        vm.resolve_location(&dc).await,
        Err(HypervisorError::InvalidHost { .. })
    ));

    spec.networks = vec![Network::new("VM Network")];
    let vm = lab.vm_with(spec);
    let location = vm.resolve_location(&dc).await.unwrap();
    assert_eq!(location.host, Some(lab.esx02.clone()));
}

/// Test the cluster failure modes.
#[tokio::test]
async fn test_cluster_without_suitable_hosts() {
    let lab = Lab::new();
    lab.mock
        .add_cluster(&lab.dc, &lab.dc.host_folder, "empty", &[], false)
        .unwrap();

    let mut spec = spec("web-01");
    spec.destination = Some(Destination::Cluster {
        name: "empty".to_string(),
        host_system: None,
    });
    let vm = lab.vm_with(spec.clone());
    let dc = vm.datacenter().await.unwrap();
    assert!(matches!(
        vm.resolve_location(&dc).await,
        Err(HypervisorError::NoHostsInCluster)
    ));

    spec.destination = Some(Destination::Cluster {
        name: "prod".to_string(),
        host_system: None,
    });
    spec.networks = vec![Network::new("storage")];
    let vm = lab.vm_with(spec);
    assert!(matches!(
        vm.resolve_location(&dc).await,
        Err(HypervisorError::NoSuitableHosts)
    ));
}

/// Test resource pool lookup by id through nested levels.
#[tokio::test]
async fn test_resource_pool_destination() {
    let lab = Lab::new();
    let pool = lab
        .mock
        .add_resource_pool(&lab.dc, &lab.cluster, "team-a", 3)
        .unwrap();

    let mut spec = spec("web-01");
    spec.destination = Some(Destination::ResourcePool {
        moid: pool.value.clone(),
    });
    let vm = lab.vm_with(spec);
    let dc = vm.datacenter().await.unwrap();

    let found = vm.find_resource_pool_by_moid(&dc, &pool.value).await.unwrap();
    assert_eq!(found.name, "team-a");
    assert_eq!(found.owner, Some(lab.cluster.clone()));

    let location = vm.resolve_location(&dc).await.unwrap();
    assert_eq!(location.host, None);
    assert_eq!(location.resource_pool, pool);
    assert_eq!(location.networks.len(), 2);

    assert!(vm
        .find_resource_pool_by_moid(&dc, "resgroup-404")
        .await
        .unwrap_err()
        .is_not_found());
}

/// Test that a missing destination is not supported.
#[tokio::test]
async fn test_missing_destination() {
    let lab = Lab::new();
    let mut spec = spec("web-01");
    spec.destination = None;
    let vm = lab.vm_with(spec);
    let dc = vm.datacenter().await.unwrap();
    assert!(matches!(
        vm.resolve_location(&dc).await,
        Err(HypervisorError::DestinationNotSupported)
    ));
}

/// Test shared and host-specific datastores of a cluster.
#[tokio::test]
async fn test_cluster_datastores() {
    let lab = Lab::new();
    let mut spec = spec("web-01");
    spec.destination = Some(Destination::Cluster {
        name: "prod".to_string(),
        host_system: Some("esx-01".to_string()),
    });
    let vm = lab.vm_with(spec);
    let dc = vm.datacenter().await.unwrap();
    let cluster = vm.find_cluster(&dc, "prod").await.unwrap();

    assert_eq!(vm.shared_datastores(&cluster).await.unwrap(), vec![lab.ds1.clone()]);
    assert_eq!(
        vm.host_datastores(&cluster).await.unwrap(),
        vec![lab.ds1.clone(), lab.ds2.clone()]
    );
    assert!(vm.cluster_drs_enabled(&dc).await.unwrap());
}

/// Test listing VMs with their folder paths, narrowed by destination.
#[tokio::test]
async fn test_list_virtual_machines() {
    let lab = Lab::new();
    let web = lab.mock.add_folder(&lab.dc.vm_folder, "web").unwrap();
    lab.mock
        .add_vm(&web, VmFixture::new("web-01").on_host(&lab.esx02))
        .unwrap();
    lab.mock
        .add_vm(&lab.dc.vm_folder, VmFixture::new("db-01").on_host(&lab.esx03))
        .unwrap();
    let dc2 = lab.mock.add_datacenter("DC2").unwrap();
    lab.mock.add_vm(&dc2.vm_folder, VmFixture::new("remote-01")).unwrap();

    let vm = lab.vm("web-01");
    let mut in_cluster: Vec<String> = vm
        .list_virtual_machines(false)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.path)
        .collect();
    in_cluster.sort();
    assert_eq!(in_cluster, vec!["templates/ubuntu", "web/web-01"]);

    let everything = vm.list_virtual_machines(true).await.unwrap();
    assert_eq!(everything.len(), 4);
    assert!(everything.iter().any(|l| l.path == "remote-01"));
}

/// Test that a VM deleted mid-walk is skipped.
#[tokio::test]
async fn test_deleted_vm_skipped_during_walk() {
    let lab = Lab::new();
    let ghost = lab.mock.add_vm(&lab.dc.vm_folder, VmFixture::new("web-01")).unwrap();
    let real = lab.mock.add_vm(&lab.dc.vm_folder, VmFixture::new("web-01")).unwrap();
    lab.mock.remove_object(&ghost).unwrap();

    let found = lab.vm("web-01").find_self().await.unwrap();
    assert_eq!(found.reference, real);
}

/// Test datacenter lookup failure.
#[tokio::test]
async fn test_unknown_datacenter() {
    let lab = Lab::with_mock(MockVimClient::new());
    let mut spec = spec("web-01");
    spec.connection.datacenter = "DC9".to_string();
    let err = lab.vm_with(spec).datacenter().await.unwrap_err();
    assert!(err.is_not_found());
}
