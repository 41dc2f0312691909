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

use std::time::SystemTime;

use metalplane_error::{Code, Error, make_err};
use serde::{Deserialize, Serialize};

use crate::store_trait::Record;

/// Size assigned to hardware that matches no configured size.
pub const UNKNOWN_SIZE_ID: &str = "unknown";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MachineStateValue {
    #[default]
    Available,
    /// Kept out of candidate selection, e.g. for maintenance.
    Reserved,
    /// Kept out of candidate selection and cannot be freed.
    Locked,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineState {
    pub value: MachineStateValue,
    pub description: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MachineLiveliness {
    Alive,
    Dead,
    #[default]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockDevice {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

/// Routes a switch port announces to the connected machines.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct BgpFilter {
    /// Sorted, deduplicated CIDRs.
    pub cidrs: Vec<String>,
    /// Sorted, deduplicated VNIs.
    pub vnis: Vec<String>,
}

impl BgpFilter {
    pub fn is_empty(&self) -> bool {
        self.cidrs.is_empty() && self.vnis.is_empty()
    }
}

/// A network interface, either of a machine or of a switch port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Nic {
    pub mac_address: String,
    pub name: String,
    /// Only set on switch ports.
    #[serde(default)]
    pub vrf: String,
    /// Interfaces discovered on the other end of the cable.
    #[serde(default)]
    pub neighbors: Vec<Nic>,
    /// Only set on switch ports.
    #[serde(default)]
    pub filter: Option<BgpFilter>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineHardware {
    pub cpu_cores: u32,
    /// Main memory in bytes.
    pub memory: u64,
    pub disks: Vec<BlockDevice>,
    pub nics: Vec<Nic>,
}

impl MachineHardware {
    pub fn storage(&self) -> u64 {
        self.disks.iter().map(|disk| disk.size).sum()
    }
}

/// A network as seen from an allocated machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineNetwork {
    pub network_id: String,
    pub prefixes: Vec<String>,
    pub destination_prefixes: Vec<String>,
    pub ips: Vec<String>,
    pub vrf: u32,
    pub asn: u32,
    /// The primary network of the machine. Exactly one per allocation.
    pub private: bool,
    pub nat: bool,
    pub underlay: bool,
    pub shared: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MachineAllocation {
    pub created: SystemTime,
    pub name: String,
    pub description: String,
    pub project_id: String,
    pub image_id: String,
    pub hostname: String,
    pub ssh_pub_keys: Vec<String>,
    pub user_data: String,
    pub console_password: String,
    pub machine_networks: Vec<MachineNetwork>,
    /// Set once the installed machine has reported back.
    pub succeeded: bool,
}

impl MachineAllocation {
    pub fn private_network(&self) -> Option<&MachineNetwork> {
        self.machine_networks.iter().find(|nw| nw.private)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: String,
    pub partition_id: String,
    pub size_id: String,
    pub rack_id: String,
    pub hardware: MachineHardware,
    pub state: MachineState,
    pub liveliness: MachineLiveliness,
    pub allocation: Option<MachineAllocation>,
    pub tags: Vec<String>,
    pub version: u64,
}

impl Machine {
    /// Record created for a machine that reported an event before it was
    /// registered.
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_id: String::new(),
            size_id: String::new(),
            rack_id: String::new(),
            hardware: MachineHardware::default(),
            state: MachineState::default(),
            liveliness: MachineLiveliness::Unknown,
            allocation: None,
            tags: Vec::new(),
            version: 0,
        }
    }

    pub const fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }

    /// Whether the machine may be handed out by candidate selection.
    pub fn is_candidate(&self) -> bool {
        self.allocation.is_none()
            && self.state.value == MachineStateValue::Available
            && self.liveliness != MachineLiveliness::Dead
    }

    pub fn allocation(&self) -> Result<&MachineAllocation, Error> {
        self.allocation.as_ref().ok_or_else(|| {
            make_err!(
                Code::FailedPrecondition,
                "Machine {} is not allocated",
                self.id
            )
        })
    }
}

impl Record for Machine {
    const KIND: &'static str = "machine";

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

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

/// Published on the machine topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MachineEvent {
    pub r#type: EventType,
    pub old: Option<Machine>,
    pub new: Option<Machine>,
}
