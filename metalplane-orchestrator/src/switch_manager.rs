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

use std::collections::{BTreeMap, BTreeSet};

use metalplane_error::{Code, Error, ResultExt, make_err};
use metalplane_util::machine::{BgpFilter, Machine, MachineAllocation, Nic};
use metalplane_util::store_trait::update_with_retry;
use metalplane_util::switch::{Connection, Switch};
use tracing::{Level, event};

use crate::MAX_RECORD_UPDATE_ATTEMPTS;
use crate::datastore::DataStore;

/// Renders the VRF name configured on a switch port.
pub fn vrf_name(vrf: u32) -> String {
    format!("vrf{vrf}")
}

/// Routes a port has to expose for one allocated machine.
fn allocation_filter(
    allocation: &MachineAllocation,
    cidrs: &mut BTreeSet<String>,
    vnis: &mut BTreeSet<String>,
) {
    for network in &allocation.machine_networks {
        if network.private && !network.shared && !network.underlay {
            cidrs.extend(network.prefixes.iter().cloned());
        }
        if (network.underlay || network.shared) && network.vrf != 0 {
            vnis.insert(network.vrf.to_string());
        }
    }
}

/// Union of the routes of all given allocations. Both lists come out sorted
/// so re-computing an unchanged filter compares equal.
fn compute_filter<'a>(
    allocations: impl Iterator<Item = &'a MachineAllocation>,
) -> Option<BgpFilter> {
    let mut cidrs = BTreeSet::new();
    let mut vnis = BTreeSet::new();
    for allocation in allocations {
        allocation_filter(allocation, &mut cidrs, &mut vnis);
    }
    let filter = BgpFilter {
        cidrs: cidrs.into_iter().collect(),
        vnis: vnis.into_iter().collect(),
    };
    (!filter.is_empty()).then_some(filter)
}

/// Connections of `machine` to the ports of `switch`, one per machine NIC
/// whose discovered neighbor is a port of this switch, sorted by port MAC.
fn connections_to(switch: &Switch, machine: &Machine) -> Vec<Connection> {
    let mut connections = BTreeMap::new();
    for nic in &machine.hardware.nics {
        for neighbor in &nic.neighbors {
            if let Some(port) = switch.nic_by_mac(&neighbor.mac_address) {
                connections.insert(
                    port.mac_address.clone(),
                    Connection {
                        machine_id: machine.id.clone(),
                        nic: strip_port(port),
                    },
                );
            }
        }
    }
    connections.into_values().collect()
}

/// Keeps `Switch::machine_connections` and the VRF and BGP filter of every
/// switch port in line with the machines wired to it.
#[derive(Debug, Clone)]
pub struct SwitchConnectionManager {
    datastore: DataStore,
}

impl SwitchConnectionManager {
    pub const fn new(datastore: DataStore) -> Self {
        Self { datastore }
    }

    /// Records the connections of `machine` on every switch one of its NICs
    /// is cabled to, replacing previous entries of the machine. Returns the
    /// switches that changed.
    pub async fn connect_machine_to_switches(
        &self,
        machine: &Machine,
    ) -> Result<Vec<Switch>, Error> {
        let mut changed = Vec::new();
        for switch in self.datastore.switches.list().await? {
            let has_entry = switch.machine_connections.contains_key(&machine.id);
            if connections_to(&switch, machine).is_empty() && !has_entry {
                continue;
            }
            let before = switch.version;
            let updated = update_with_retry(
                self.datastore.switches.as_ref(),
                &switch.id,
                MAX_RECORD_UPDATE_ATTEMPTS,
                |switch| {
                    let connections = connections_to(switch, machine);
                    if connections.is_empty() {
                        return Ok(switch.machine_connections.remove(&machine.id).is_some());
                    }
                    if switch.machine_connections.get(&machine.id) == Some(&connections) {
                        return Ok(false);
                    }
                    switch
                        .machine_connections
                        .insert(machine.id.clone(), connections);
                    Ok(true)
                },
            )
            .await
            .err_tip(|| format!("Connecting machine {} to switch {}", machine.id, switch.id))?;
            if updated.version != before {
                event!(
                    Level::INFO,
                    machine_id = %machine.id,
                    switch_id = %updated.id,
                    "Updated machine connections"
                );
                changed.push(updated);
            }
        }
        Ok(changed)
    }

    /// Creates `switch` or updates the port list of an existing one.
    ///
    /// Ports that keep their MAC keep VRF and filter. A port that disappears
    /// while a machine is connected to it is rejected, unless a port with the
    /// same name and a new MAC replaces it, in which case the connection
    /// moves over to the new MAC.
    pub async fn register_switch(&self, switch: Switch) -> Result<Switch, Error> {
        let Some(mut existing) = self.datastore.switches.find(&switch.id).await? else {
            let mut switch = switch;
            switch.machine_connections.clear();
            return self.datastore.switches.create(switch).await;
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut new = existing.clone();
            new.partition_id.clone_from(&switch.partition_id);
            new.rack_id.clone_from(&switch.rack_id);
            new.nics = switch
                .nics
                .iter()
                .map(|nic| {
                    let mut nic = nic.clone();
                    if let Some(old) = existing.nic_by_mac(&nic.mac_address) {
                        nic.vrf.clone_from(&old.vrf);
                        nic.filter.clone_from(&old.filter);
                    }
                    nic
                })
                .collect();
            migrate_connections(&existing, &mut new)?;
            match self.datastore.switches.update(&existing, new).await {
                Ok(stored) => return Ok(stored),
                Err(err) if err.is_conflict() && attempt < MAX_RECORD_UPDATE_ATTEMPTS => {
                    existing = self.datastore.switches.get(&switch.id).await?;
                }
                Err(err) => return Err(err).err_tip(|| format!("Registering switch {}", switch.id)),
            }
        }
    }

    /// Sets `vrf` on every port `machine` is connected to and recomputes the
    /// filters of those ports. `machine` is taken as given, it does not need
    /// to be persisted yet. An empty `vrf` detaches the machine: its routes
    /// leave the filter, and VRF and filter are cleared once no other
    /// allocated machine is left on the port. Returns the switches that
    /// changed.
    pub async fn set_vrf_at_switches(
        &self,
        machine: &Machine,
        vrf: &str,
    ) -> Result<Vec<Switch>, Error> {
        let mut changed = Vec::new();
        for switch in self.datastore.switches.list().await? {
            if !switch.machine_connections.contains_key(&machine.id) {
                continue;
            }
            if let Some(updated) = self
                .set_vrf_at_switch(&switch.id, machine, vrf)
                .await
                .err_tip(|| format!("Setting vrf {vrf:?} at switch {}", switch.id))?
            {
                changed.push(updated);
            }
        }
        Ok(changed)
    }

    async fn set_vrf_at_switch(
        &self,
        switch_id: &str,
        machine: &Machine,
        vrf: &str,
    ) -> Result<Option<Switch>, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let switch = self.datastore.switches.get(switch_id).await?;
            let Some(connections) = switch.machine_connections.get(&machine.id) else {
                return Ok(None);
            };
            let macs = connections
                .iter()
                .map(|connection| connection.nic.mac_address.clone())
                .collect::<BTreeSet<_>>();

            // Allocations of the other machines sharing one of the ports.
            let mut neighbors = BTreeMap::new();
            for mac in &macs {
                for machine_id in switch.machines_on_nic(mac) {
                    if machine_id == machine.id || neighbors.contains_key(machine_id) {
                        continue;
                    }
                    if let Some(other) = self.datastore.machines.find(machine_id).await? {
                        neighbors.insert(machine_id.to_string(), other);
                    }
                }
            }

            let mut new = switch.clone();
            for mac in &macs {
                let others = switch
                    .machines_on_nic(mac)
                    .filter(|id| *id != machine.id)
                    .filter_map(|id| neighbors.get(id))
                    .filter_map(|other| other.allocation.as_ref())
                    .collect::<Vec<_>>();
                let Some(port) = new.nic_by_mac_mut(mac) else {
                    continue;
                };
                if vrf.is_empty() {
                    if others.is_empty() {
                        port.vrf.clear();
                        port.filter = None;
                    } else {
                        port.filter = compute_filter(others.into_iter());
                    }
                } else {
                    port.vrf = vrf.to_string();
                    port.filter =
                        compute_filter(others.into_iter().chain(machine.allocation.as_ref()));
                }
            }
            if new.nics == switch.nics {
                return Ok(None);
            }
            match self.datastore.switches.update(&switch, new).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(err) if err.is_conflict() && attempt < MAX_RECORD_UPDATE_ATTEMPTS => {
                    event!(
                        Level::DEBUG,
                        switch_id,
                        attempt,
                        "Conflict while setting vrf, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Re-points the connections of `old` to the ports of `new`.
fn migrate_connections(old: &Switch, new: &mut Switch) -> Result<(), Error> {
    let mut connections = BTreeMap::new();
    for (machine_id, machine_connections) in &old.machine_connections {
        let mut migrated = Vec::with_capacity(machine_connections.len());
        for connection in machine_connections {
            let port = new
                .nic_by_mac(&connection.nic.mac_address)
                .or_else(|| new.nics.iter().find(|nic| nic.name == connection.nic.name));
            let Some(port) = port else {
                return Err(make_err!(
                    Code::FailedPrecondition,
                    "Port {} ({}) of switch {} is connected to machine {machine_id} and cannot be \
                     removed",
                    connection.nic.name,
                    connection.nic.mac_address,
                    old.id
                ));
            };
            if port.mac_address != connection.nic.mac_address {
                event!(
                    Level::INFO,
                    switch_id = %old.id,
                    machine_id = %machine_id,
                    port = %port.name,
                    old_mac = %connection.nic.mac_address,
                    new_mac = %port.mac_address,
                    "Neighbor changed, migrating connection"
                );
            }
            migrated.push(Connection {
                machine_id: machine_id.clone(),
                nic: strip_port(port),
            });
        }
        connections.insert(machine_id.clone(), migrated);
    }
    // Ports that moved to a new MAC inherit the configuration of the old one.
    for machine_connections in connections.values() {
        for connection in machine_connections {
            let Some(old_port) = old.nics.iter().find(|nic| nic.name == connection.nic.name) else {
                continue;
            };
            if let Some(port) = new.nic_by_mac_mut(&connection.nic.mac_address) {
                if port.vrf.is_empty() && port.filter.is_none() {
                    port.vrf.clone_from(&old_port.vrf);
                    port.filter.clone_from(&old_port.filter);
                }
            }
        }
    }
    new.machine_connections = connections;
    Ok(())
}

/// Port as recorded in a connection, without its mutable configuration.
fn strip_port(port: &Nic) -> Nic {
    Nic {
        mac_address: port.mac_address.clone(),
        name: port.name.clone(),
        vrf: String::new(),
        neighbors: Vec::new(),
        filter: None,
    }
}
