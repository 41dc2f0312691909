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

use std::sync::Arc;

use metalplane_error::{Code, Error};
use metalplane_macro::metalplane_test;
use metalplane_orchestrator::allocation::NetworkRequest;
use metalplane_util::machine::BgpFilter;
use pretty_assertions::assert_eq;
use utils::control_plane_utils::{
    INTERNET_NETWORK_ID, INTERNET_VRF, OTHER_PROJECT_ID, PROJECT_ID, SWITCH_ID, allocation_request,
    make_machine, make_switch, setup,
};

mod utils {
    pub(crate) mod control_plane_utils;
}

const PORT1_MAC: &str = "aa:00:00:00:00:01";
const PORT2_MAC: &str = "aa:00:00:00:00:02";

#[metalplane_test]
async fn registering_machine_records_connection() -> Result<(), Error> {
    let test = setup().await?;
    let cp = &test.control_plane;
    cp.switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC), ("swp2", PORT2_MAC)]))
        .await?;

    let machine = cp
        .allocator
        .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT1_MAC))
        .await?;

    let switch = test.datastore().switches.get(SWITCH_ID).await?;
    let connections = &switch.machine_connections["m1"];
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].machine_id, "m1");
    assert_eq!(connections[0].nic.mac_address, PORT1_MAC);
    assert_eq!(connections[0].nic.name, "swp1");

    // Registering again with the same cabling changes nothing.
    let changed = cp.switches.connect_machine_to_switches(&machine).await?;
    assert!(changed.is_empty());
    Ok(())
}

#[metalplane_test]
async fn filter_contains_private_prefixes_and_shared_vnis() -> Result<(), Error> {
    let test = setup().await?;
    let cp = &test.control_plane;
    cp.switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC)]))
        .await?;
    cp.allocator
        .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT1_MAC))
        .await?;

    let mut request = allocation_request(Some("m1"), PROJECT_ID);
    request.networks.push(NetworkRequest {
        network_id: INTERNET_NETWORK_ID.to_string(),
        ips: Vec::new(),
    });
    let machine = cp.allocator.allocate(request).await?;
    let private = machine.allocation()?.private_network().cloned().unwrap();

    let switch = test.datastore().switches.get(SWITCH_ID).await?;
    let port = switch.nic_by_mac(PORT1_MAC).unwrap();
    assert_eq!(port.vrf, format!("vrf{}", private.vrf));
    assert_eq!(
        port.filter,
        Some(BgpFilter {
            cidrs: vec!["10.0.0.0/22".to_string()],
            vnis: vec![INTERNET_VRF.to_string()],
        })
    );
    Ok(())
}

#[metalplane_test]
async fn freeing_one_of_two_machines_on_a_port_keeps_the_other() -> Result<(), Error> {
    let test = setup().await?;
    let cp = &test.control_plane;
    cp.switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC)]))
        .await?;
    cp.allocator
        .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT1_MAC))
        .await?;
    cp.allocator
        .register_machine(make_machine("m2", "bb:00:00:00:00:02", PORT1_MAC))
        .await?;
    cp.allocator
        .allocate(allocation_request(Some("m1"), PROJECT_ID))
        .await?;
    let m2 = cp
        .allocator
        .allocate(allocation_request(Some("m2"), OTHER_PROJECT_ID))
        .await?;
    let m2_vrf = m2.allocation()?.private_network().unwrap().vrf;

    let switch = test.datastore().switches.get(SWITCH_ID).await?;
    assert_eq!(
        switch.nic_by_mac(PORT1_MAC).unwrap().filter,
        Some(BgpFilter {
            cidrs: vec!["10.0.0.0/22".to_string(), "10.0.4.0/22".to_string()],
            vnis: Vec::new(),
        })
    );

    cp.allocator.free("m1").await?;

    let switch = test.datastore().switches.get(SWITCH_ID).await?;
    let port = switch.nic_by_mac(PORT1_MAC).unwrap();
    assert_eq!(port.vrf, format!("vrf{m2_vrf}"));
    assert_eq!(
        port.filter,
        Some(BgpFilter {
            cidrs: vec!["10.0.4.0/22".to_string()],
            vnis: Vec::new(),
        })
    );
    // Cabling does not change on free.
    assert!(switch.machine_connections.contains_key("m1"));
    assert!(switch.machine_connections.contains_key("m2"));
    Ok(())
}

#[metalplane_test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocations_on_a_port_both_reach_the_filter() -> Result<(), Error> {
    const ROUNDS: usize = 16;
    for _ in 0..ROUNDS {
        let test = Arc::new(setup().await?);
        let cp = &test.control_plane;
        cp.switches
            .register_switch(make_switch(&[("swp1", PORT1_MAC)]))
            .await?;
        cp.allocator
            .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT1_MAC))
            .await?;
        cp.allocator
            .register_machine(make_machine("m2", "bb:00:00:00:00:02", PORT1_MAC))
            .await?;

        let handles = [("m1", PROJECT_ID), ("m2", OTHER_PROJECT_ID)].map(|(id, project)| {
            let test = test.clone();
            tokio::spawn(async move {
                test.control_plane
                    .allocator
                    .allocate(allocation_request(Some(id), project))
                    .await
            })
        });
        let mut cidrs = Vec::new();
        for handle in handles {
            let machine = handle.await??;
            cidrs.extend(machine.allocation()?.private_network().unwrap().prefixes.clone());
        }
        cidrs.sort();

        let switch = test.datastore().switches.get(SWITCH_ID).await?;
        assert_eq!(
            switch.nic_by_mac(PORT1_MAC).unwrap().filter,
            Some(BgpFilter {
                cidrs,
                vnis: Vec::new(),
            })
        );
    }
    Ok(())
}

#[metalplane_test]
async fn reregistering_switch_keeps_port_configuration() -> Result<(), Error> {
    let test = setup().await?;
    let cp = &test.control_plane;
    cp.switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC)]))
        .await?;
    cp.allocator
        .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT1_MAC))
        .await?;
    cp.allocator
        .allocate(allocation_request(Some("m1"), PROJECT_ID))
        .await?;
    let before = test.datastore().switches.get(SWITCH_ID).await?;

    let after = cp
        .switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC), ("swp2", PORT2_MAC)]))
        .await?;

    assert_eq!(after.nics.len(), 2);
    assert_eq!(after.nic_by_mac(PORT1_MAC), before.nic_by_mac(PORT1_MAC));
    assert_eq!(after.machine_connections, before.machine_connections);
    Ok(())
}

#[metalplane_test]
async fn removing_connected_port_is_rejected() -> Result<(), Error> {
    let test = setup().await?;
    let cp = &test.control_plane;
    cp.switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC), ("swp2", PORT2_MAC)]))
        .await?;
    cp.allocator
        .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT1_MAC))
        .await?;

    let err = cp
        .switches
        .register_switch(make_switch(&[("swp2", PORT2_MAC)]))
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);

    // Unconnected ports may go.
    let switch = cp
        .switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC)]))
        .await?;
    assert_eq!(switch.nics.len(), 1);
    Ok(())
}

#[metalplane_test]
async fn replaced_port_migrates_connection() -> Result<(), Error> {
    const NEW_MAC: &str = "aa:00:00:00:00:ff";
    let test = setup().await?;
    let cp = &test.control_plane;
    cp.switches
        .register_switch(make_switch(&[("swp1", PORT1_MAC)]))
        .await?;
    cp.allocator
        .register_machine(make_machine("m1", "bb:00:00:00:00:01", PORT1_MAC))
        .await?;
    cp.allocator
        .allocate(allocation_request(Some("m1"), PROJECT_ID))
        .await?;
    let before = test.datastore().switches.get(SWITCH_ID).await?;
    let old_port = before.nic_by_mac(PORT1_MAC).unwrap().clone();

    let after = cp
        .switches
        .register_switch(make_switch(&[("swp1", NEW_MAC)]))
        .await?;

    let connections = &after.machine_connections["m1"];
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].nic.mac_address, NEW_MAC);
    let new_port = after.nic_by_mac(NEW_MAC).unwrap();
    assert_eq!(new_port.vrf, old_port.vrf);
    assert_eq!(new_port.filter, old_port.filter);
    Ok(())
}
