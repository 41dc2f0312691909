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

use std::collections::BTreeSet;

use metalplane_config::catalog::NetworkSpec;
use serde::{Deserialize, Serialize};

use crate::store_trait::Record;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub partition_id: String,
    /// Owning project, `None` for networks that are not owned by a tenant.
    pub project_id: Option<String>,
    pub prefixes: Vec<String>,
    pub destination_prefixes: Vec<String>,
    /// Super network this one was carved out of.
    pub parent_network_id: Option<String>,
    pub vrf: Option<u32>,
    /// At most one per partition; project networks are child prefixes of it.
    pub private_super: bool,
    pub underlay: bool,
    pub nat: bool,
    pub shared: bool,
    pub version: u64,
}

impl From<NetworkSpec> for Network {
    fn from(spec: NetworkSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            partition_id: spec.partition_id,
            project_id: spec.project_id,
            prefixes: spec.prefixes,
            destination_prefixes: spec.destination_prefixes,
            parent_network_id: None,
            vrf: spec.vrf,
            private_super: spec.private_super,
            underlay: spec.underlay,
            nat: spec.nat,
            shared: spec.shared,
            version: 0,
        }
    }
}

impl Record for Network {
    const KIND: &'static str = "network";

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

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpType {
    /// Survives the machine it is attached to.
    Static,
    /// Released once no machine references it anymore.
    #[default]
    Ephemeral,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Ip {
    pub address: String,
    pub name: String,
    pub network_id: String,
    pub project_id: String,
    pub ip_type: IpType,
    /// Machines the address is attached to. An address may be shared.
    pub machine_ids: BTreeSet<String>,
    pub version: u64,
}

impl Record for Ip {
    const KIND: &'static str = "ip";

    fn key(&self) -> &str {
        &self.address
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Address accounting of one prefix.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrefixUsage {
    pub available_ips: u128,
    pub used_ips: u128,
    /// Child prefixes of the smallest length handed out so far that would
    /// still fit, zero if no child prefix was ever allocated.
    pub available_prefixes: u128,
    pub used_prefixes: u128,
}
