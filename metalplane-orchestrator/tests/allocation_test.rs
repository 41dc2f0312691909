// Copyright 2025 The Metalplane Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::time::Duration;
use std::collections::BTreeSet;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use metalplane_error::{Code, Error};
use metalplane_macro::metalplane_test;
use metalplane_orchestrator::allocation::project_network_id;
use metalplane_orchestrator::{DEFAULT_ASN_BASE, DEFAULT_ASN_MAX};
use metalplane_store::ipam::Ipam;
use metalplane_util::event_publisher::{MACHINE_TOPIC, SWITCH_TOPIC};
use metalplane_util::machine::{MachineAllocation, MachineStateValue, UNKNOWN_SIZE_ID};
use pretty_assertions::assert_eq;
use utils::control_plane_utils::{
    OTHER_PROJECT_ID, PARTITION_ID, PROJECT_ID, SIZE_ID, SUPER_PREFIX, SWITCH_ID, VRF_POOL,
    allocation_request, make_machine, make_switch, mock_now, setup, setup_with, test_config,
};

mod utils {
    pub(crate) mod control_plane_utils;
}

const PORT_MAC: &str = "aa:00:00:00:00:01";

async fn register_machines(
    test: &utils::control_plane_utils::TestControlPlane,
    count: usize,
) -> Result<(), Error> {
    let cp = &test.control_plane;
    cp.switches
        .register_switch(make_switch(&[("swp1", PORT_MAC)]))
        .await?;
    for idx in 0..count {
        cp.allocator
            .register_machine(make_machine(
                &format!("m{idx}"),
                &format!("bb:00:00:00:00:{idx:02x}"),
                PORT_MAC,
            ))
            .await?;
    }
    Ok(())
}

#[metalplane_test]
async fn register_assigns_matching_size() -> Result<(), Error> {
    let test = setup().await?;
    let cp = &test.control_plane;
    let machine = cp
        .allocator
        .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT_MAC))
        .await?;
    assert_eq!(machine.size_id, SIZE_ID);

    let mut big = make_machine("m2", "bb:00:00:00:00:02", PORT_MAC);
    big.hardware.cpu_cores = 64;
    let big = cp.allocator.register_machine(big).await?;
    assert_eq!(big.size_id, UNKNOWN_SIZE_ID);

    assert_eq!(test.publisher.published(MACHINE_TOPIC).len(), 2);
    Ok(())
}

#[metalplane_test]
async fn reregistering_keeps_allocation() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let cp = &test.control_plane;
    let allocated = cp
        .allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await?;

    let mut machine = make_machine("m0", "bb:00:00:00:00:00", PORT_MAC);
    machine.hardware.memory = 32 << 30;
    let registered = cp.allocator.register_machine(machine).await?;

    assert_eq!(registered.allocation, allocated.allocation);
    assert_eq!(registered.hardware.memory, 32 << 30);
    Ok(())
}

#[metalplane_test]
async fn allocate_attaches_private_project_network() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let cp = &test.control_plane;

    let machine = cp
        .allocator
        .allocate(allocation_request(None, PROJECT_ID))
        .await?;

    assert_eq!(machine.id, "m0");
    let allocation = machine.allocation()?;
    assert_eq!(allocation.project_id, PROJECT_ID);
    assert_eq!(allocation.machine_networks.len(), 1);
    let network = &allocation.machine_networks[0];
    assert!(network.private);
    assert_eq!(network.network_id, project_network_id(PARTITION_ID, PROJECT_ID));
    assert!((VRF_POOL.min..VRF_POOL.max).contains(&network.vrf));
    assert!(network.asn >= DEFAULT_ASN_BASE);
    assert!(network.asn <= DEFAULT_ASN_MAX);

    assert_eq!(network.prefixes.len(), 1);
    let child: Ipv4Network = network.prefixes[0].parse().unwrap();
    let parent: Ipv4Network = SUPER_PREFIX.parse().unwrap();
    assert_eq!(child.prefix(), 22);
    assert!(parent.contains(child.network()));
    assert_eq!(network.ips.len(), 1);
    assert!(child.contains(network.ips[0].parse().unwrap()));

    let ip = test.datastore().ips.get(&network.ips[0]).await?;
    assert_eq!(ip.machine_ids, BTreeSet::from(["m0".to_string()]));

    // The allocation is persisted and published.
    let stored = test.datastore().machines.get("m0").await?;
    assert_eq!(stored.allocation, machine.allocation);
    assert!(!test.publisher.published(SWITCH_TOPIC).is_empty());
    Ok(())
}

#[metalplane_test]
async fn second_allocation_of_project_reuses_network() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 2).await?;
    let cp = &test.control_plane;
    let vrfs_before = cp.allocator.vrf_pool().available().await?;

    let first = cp
        .allocator
        .allocate(allocation_request(None, PROJECT_ID))
        .await?;
    let second = cp
        .allocator
        .allocate(allocation_request(None, PROJECT_ID))
        .await?;

    let first_network = first.allocation()?.private_network().unwrap();
    let second_network = second.allocation()?.private_network().unwrap();
    assert_eq!(first_network.network_id, second_network.network_id);
    assert_eq!(first_network.vrf, second_network.vrf);
    assert_ne!(first_network.ips, second_network.ips);
    assert_ne!(first_network.asn, second_network.asn);
    assert_eq!(cp.allocator.vrf_pool().available().await?, vrfs_before - 1);
    Ok(())
}

#[metalplane_test]
async fn allocating_without_candidates_is_exhausted() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let cp = &test.control_plane;
    cp.allocator
        .allocate(allocation_request(None, PROJECT_ID))
        .await?;

    let err = cp
        .allocator
        .allocate(allocation_request(None, PROJECT_ID))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);

    let err = cp
        .allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::AlreadyExists);
    Ok(())
}

#[metalplane_test]
async fn reserved_and_locked_machines_are_not_candidates() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 2).await?;
    let cp = &test.control_plane;

    let err = cp
        .allocator
        .set_machine_state("m0", MachineStateValue::Reserved, "")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);

    cp.allocator
        .set_machine_state("m0", MachineStateValue::Reserved, "kept for debugging")
        .await?;
    cp.allocator
        .set_machine_state("m1", MachineStateValue::Locked, "broken disk")
        .await?;
    let err = cp
        .allocator
        .allocate(allocation_request(None, PROJECT_ID))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);

    cp.allocator
        .set_machine_state("m0", MachineStateValue::Available, "")
        .await?;
    let machine = cp
        .allocator
        .allocate(allocation_request(None, PROJECT_ID))
        .await?;
    assert_eq!(machine.id, "m0");
    Ok(())
}

#[metalplane_test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_claim_distinct_machines() -> Result<(), Error> {
    const MACHINES: usize = 3;
    const REQUESTS: usize = 8;
    let test = Arc::new(setup().await?);
    register_machines(&test, MACHINES).await?;

    let handles = (0..REQUESTS)
        .map(|_| {
            let test = test.clone();
            tokio::spawn(async move {
                test.control_plane
                    .allocator
                    .allocate(allocation_request(None, PROJECT_ID))
                    .await
            })
        })
        .collect::<Vec<_>>();

    let mut claimed = BTreeSet::new();
    for handle in handles {
        match handle.await? {
            Ok(machine) => assert!(claimed.insert(machine.id), "machine claimed twice"),
            Err(err) => assert_eq!(err.code, Code::ResourceExhausted, "{err:?}"),
        }
    }
    assert!(!claimed.is_empty());
    assert!(claimed.len() <= MACHINES);

    let allocated = test
        .datastore()
        .machines
        .list()
        .await?
        .into_iter()
        .filter(|machine| machine.is_allocated())
        .map(|machine| machine.id)
        .collect::<BTreeSet<_>>();
    assert_eq!(allocated, claimed);
    Ok(())
}

#[metalplane_test]
async fn failed_allocation_rolls_back_claim_and_resources() -> Result<(), Error> {
    let mut config = test_config();
    // Room for exactly one machine.
    config.orchestrator.asn_pool.min = 1;
    config.orchestrator.asn_pool.max = 2;
    let test = setup_with(config).await?;
    register_machines(&test, 2).await?;
    let cp = &test.control_plane;

    cp.allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await?;
    let vrfs_before = cp.allocator.vrf_pool().available().await?;
    let ips_before = test.datastore().ips.list().await?;

    let err = cp
        .allocator
        .allocate(allocation_request(Some("m1"), OTHER_PROJECT_ID))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);

    let machine = test.datastore().machines.get("m1").await?;
    assert_eq!(machine.allocation, None);
    assert_eq!(test.datastore().ips.list().await?, ips_before);
    assert_eq!(cp.allocator.vrf_pool().available().await?, vrfs_before);
    let project_network = project_network_id(PARTITION_ID, OTHER_PROJECT_ID);
    assert_eq!(test.datastore().networks.find(&project_network).await?, None);
    // Only the child prefix of the first project is left.
    let usage = test.ipam.prefix_usage(SUPER_PREFIX).await?;
    assert_eq!(usage.used_prefixes, 1);

    // The rolled back machine is a candidate again.
    assert!(machine.is_candidate());
    Ok(())
}

#[metalplane_test]
async fn rollback_keeps_project_network_of_pending_claim() -> Result<(), Error> {
    let mut config = test_config();
    config.orchestrator.asn_pool.min = 1;
    config.orchestrator.asn_pool.max = 2;
    let test = setup_with(config).await?;
    register_machines(&test, 3).await?;
    let cp = &test.control_plane;
    cp.allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await?;

    // m2 is claimed for the same project but has not resolved its networks.
    let m2 = test.datastore().machines.get("m2").await?;
    let mut claimed = m2.clone();
    claimed.allocation = Some(MachineAllocation {
        created: mock_now(),
        name: "m2".to_string(),
        description: String::new(),
        project_id: OTHER_PROJECT_ID.to_string(),
        image_id: String::new(),
        hostname: "m2".to_string(),
        ssh_pub_keys: Vec::new(),
        user_data: String::new(),
        console_password: String::new(),
        machine_networks: Vec::new(),
        succeeded: false,
    });
    test.datastore().machines.update(&m2, claimed).await?;

    let err = cp
        .allocator
        .allocate(allocation_request(Some("m1"), OTHER_PROJECT_ID))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::ResourceExhausted);

    assert_eq!(test.datastore().machines.get("m1").await?.allocation, None);
    let project_network = project_network_id(PARTITION_ID, OTHER_PROJECT_ID);
    let network = test.datastore().networks.get(&project_network).await?;
    assert_eq!(test.ipam.prefix_usage(&network.prefixes[0]).await?.used_ips, 0);
    assert_eq!(test.ipam.prefix_usage(SUPER_PREFIX).await?.used_prefixes, 2);
    Ok(())
}

#[metalplane_test]
async fn asn_above_maximum_is_fatal() -> Result<(), Error> {
    let mut config = test_config();
    config.orchestrator.asn_base = 4_000_000_000;
    config.orchestrator.asn_max = 4_000_000_000;
    let test = setup_with(config).await?;
    register_machines(&test, 1).await?;
    let cp = &test.control_plane;
    let asns_before = cp.allocator.asn_pool().available().await?;

    let err = cp
        .allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await
        .unwrap_err();

    assert_eq!(err.code, Code::Internal);
    assert_eq!(cp.allocator.asn_pool().available().await?, asns_before);
    assert_eq!(test.datastore().machines.get("m0").await?.allocation, None);
    Ok(())
}

#[metalplane_test]
async fn free_keeps_connection_and_clears_filter() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let cp = &test.control_plane;
    let mut request = allocation_request(Some("m0"), PROJECT_ID);
    request.tags = vec!["team=infra".to_string()];
    cp.allocator.allocate(request).await?;

    let freed = cp.allocator.free("m0").await?;

    assert_eq!(freed.allocation, None);
    assert!(freed.tags.is_empty());
    let switch = test.datastore().switches.get(SWITCH_ID).await?;
    assert!(switch.machine_connections.contains_key("m0"));
    let port = switch.nic_by_mac(PORT_MAC).unwrap();
    assert_eq!(port.filter, None);
    assert_eq!(port.vrf, "");
    // Network release happens later.
    assert_eq!(cp.release.queues().machine_networks.pending(), 1);

    let deleted = test.publisher.published(MACHINE_TOPIC);
    assert_eq!(deleted.last().unwrap()["type"], "Delete");

    // Freeing again is a no-op.
    let freed_again = cp.allocator.free("m0").await?;
    assert_eq!(freed_again.version, freed.version);
    assert_eq!(cp.release.queues().machine_networks.pending(), 1);
    Ok(())
}

#[metalplane_test]
async fn locked_machine_cannot_be_freed() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let cp = &test.control_plane;
    cp.allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await?;
    cp.allocator
        .set_machine_state("m0", MachineStateValue::Locked, "under investigation")
        .await?;

    let err = cp.allocator.free("m0").await.unwrap_err();

    assert_eq!(err.code, Code::FailedPrecondition);
    assert!(test.datastore().machines.get("m0").await?.is_allocated());
    Ok(())
}

#[metalplane_test]
async fn finalize_marks_allocation_succeeded() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 2).await?;
    let cp = &test.control_plane;
    cp.allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await?;

    let machine = cp.allocator.finalize_allocation("m0", "s3cret").await?;
    let allocation = machine.allocation()?;
    assert!(allocation.succeeded);
    assert_eq!(allocation.console_password, "s3cret");

    let err = cp
        .allocator
        .finalize_allocation("m1", "s3cret")
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    Ok(())
}

#[metalplane_test]
async fn prefix_usage_reports_allocated_ips() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let cp = &test.control_plane;
    cp.allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await?;

    let usage = cp
        .allocator
        .prefix_usage(&project_network_id(PARTITION_ID, PROJECT_ID))
        .await?;
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].0, "10.0.0.0/22");
    assert_eq!(usage[0].1.used_ips, 1);
    Ok(())
}

#[metalplane_test]
async fn waiter_receives_allocation() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let allocator = &test.control_plane.allocator;

    let (waited, allocated) = tokio::join!(
        allocator.wait_for_allocation("m0"),
        allocator.allocate(allocation_request(Some("m0"), PROJECT_ID)),
    );

    assert_eq!(Some(waited?), allocated?.allocation);
    assert_eq!(allocator.waiter().waiter_count("m0"), 0);
    Ok(())
}

#[metalplane_test]
async fn waiting_on_allocated_machine_returns_immediately() -> Result<(), Error> {
    let test = setup().await?;
    register_machines(&test, 1).await?;
    let allocator = &test.control_plane.allocator;
    let machine = allocator
        .allocate(allocation_request(Some("m0"), PROJECT_ID))
        .await?;

    let allocation = allocator.wait_for_allocation("m0").await?;
    assert_eq!(Some(allocation), machine.allocation);
    Ok(())
}

#[metalplane_test(start_paused = true)]
async fn wait_times_out_and_cancels_cleanly() -> Result<(), Error> {
    let mut config = test_config();
    config.orchestrator.wait_for_allocation_timeout_s = 5;
    let test = setup_with(config).await?;
    register_machines(&test, 1).await?;
    let allocator = &test.control_plane.allocator;

    let err = allocator.wait_for_allocation("m0").await.unwrap_err();
    assert_eq!(err.code, Code::DeadlineExceeded);
    assert_eq!(allocator.waiter().waiter_count("m0"), 0);

    // A caller that goes away unregisters as well.
    let cancelled =
        tokio::time::timeout(Duration::from_secs(1), allocator.wait_for_allocation("m0")).await;
    assert!(cancelled.is_err());
    assert_eq!(allocator.waiter().waiter_count("m0"), 0);
    Ok(())
}
