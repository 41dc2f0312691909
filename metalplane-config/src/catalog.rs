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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_string_with_shellexpand,
    convert_string_with_shellexpand,
};

/// Lookup tables the orchestrator reads but never writes.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    #[serde(default)]
    pub partitions: Vec<PartitionSpec>,
    #[serde(default)]
    pub sizes: Vec<SizeSpec>,
    #[serde(default)]
    pub images: Vec<ImageSpec>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Prefix length of project networks created in this partition.
    /// Zero means the orchestrator default is used.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub private_network_prefix_length: u8,
}

/// The hardware property a size constraint applies to.
#[allow(non_camel_case_types)]
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeConstraintType {
    /// Number of CPU cores.
    cores,
    /// Main memory in bytes.
    memory,
    /// Sum of all disk sizes in bytes.
    storage,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SizeConstraintSpec {
    pub r#type: SizeConstraintType,
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub min: u64,
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SizeSpec {
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// All constraints must hold for hardware to match this size.
    #[serde(default)]
    pub constraints: Vec<SizeConstraintSpec>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub url: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct NetworkSpec {
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "convert_string_with_shellexpand")]
    pub partition_id: String,

    /// Prefixes in CIDR notation.
    pub prefixes: Vec<String>,

    /// Prefixes reachable through this network, e.g. `0.0.0.0/0` for an
    /// internet network.
    #[serde(default)]
    pub destination_prefixes: Vec<String>,

    /// Owning project, unset for shared networks.
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub project_id: Option<String>,

    /// Project networks of this partition are carved out of this network.
    #[serde(default)]
    pub private_super: bool,

    #[serde(default)]
    pub underlay: bool,

    #[serde(default)]
    pub nat: bool,

    /// Shared networks may be attached by machines of every project.
    #[serde(default)]
    pub shared: bool,

    /// Fixed VRF of this network, if any.
    #[serde(default)]
    pub vrf: Option<u32>,
}
