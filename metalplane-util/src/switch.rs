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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::machine::{EventType, Machine, Nic};
use crate::store_trait::Record;

/// A machine interface wired to a switch port. `nic` is the switch port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub machine_id: String,
    pub nic: Nic,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Switch {
    pub id: String,
    pub partition_id: String,
    pub rack_id: String,
    pub nics: Vec<Nic>,
    /// Cabling between machines and the ports of this switch. Kept when a
    /// machine is freed.
    pub machine_connections: BTreeMap<String, Vec<Connection>>,
    pub version: u64,
}

impl Switch {
    pub fn nic_by_mac(&self, mac_address: &str) -> Option<&Nic> {
        self.nics.iter().find(|nic| nic.mac_address == mac_address)
    }

    pub fn nic_by_mac_mut(&mut self, mac_address: &str) -> Option<&mut Nic> {
        self.nics.iter_mut().find(|nic| nic.mac_address == mac_address)
    }

    /// Ids of all machines connected to the port with the given MAC.
    pub fn machines_on_nic<'a>(&'a self, mac_address: &'a str) -> impl Iterator<Item = &'a str> {
        self.machine_connections
            .iter()
            .filter(move |(_, connections)| {
                connections
                    .iter()
                    .any(|connection| connection.nic.mac_address == mac_address)
            })
            .map(|(machine_id, _)| machine_id.as_str())
    }
}

impl Record for Switch {
    const KIND: &'static str = "switch";

    fn key(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Published on the switch topic whenever port configuration changed
/// because of a machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    pub r#type: EventType,
    pub machine: Machine,
    pub switches: Vec<Switch>,
}
