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

pub use metalplane_config::catalog::SizeConstraintType;
use metalplane_config::catalog::{ImageSpec, PartitionSpec, SizeSpec};
use serde::{Deserialize, Serialize};

use crate::machine::MachineHardware;
use crate::store_trait::Record;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Partition {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Zero means the orchestrator default applies.
    pub private_network_prefix_length: u8,
    pub version: u64,
}

impl From<PartitionSpec> for Partition {
    fn from(spec: PartitionSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            description: spec.description,
            private_network_prefix_length: spec.private_network_prefix_length,
            version: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeConstraint {
    pub r#type: SizeConstraintType,
    pub min: u64,
    pub max: u64,
}

impl SizeConstraint {
    pub fn matches(&self, hardware: &MachineHardware) -> bool {
        let value = match self.r#type {
            SizeConstraintType::cores => u64::from(hardware.cpu_cores),
            SizeConstraintType::memory => hardware.memory,
            SizeConstraintType::storage => hardware.storage(),
        };
        self.min <= value && value <= self.max
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Size {
    pub id: String,
    pub name: String,
    pub constraints: Vec<SizeConstraint>,
    pub version: u64,
}

impl Size {
    /// Hardware matches a size if every constraint holds. A size without
    /// constraints never matches.
    pub fn matches(&self, hardware: &MachineHardware) -> bool {
        !self.constraints.is_empty() && self.constraints.iter().all(|c| c.matches(hardware))
    }
}

impl From<SizeSpec> for Size {
    fn from(spec: SizeSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            constraints: spec
                .constraints
                .into_iter()
                .map(|c| SizeConstraint {
                    r#type: c.r#type,
                    min: c.min,
                    max: c.max,
                })
                .collect(),
            version: 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub url: String,
    pub version: u64,
}

impl From<ImageSpec> for Image {
    fn from(spec: ImageSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            url: spec.url,
            version: 0,
        }
    }
}

macro_rules! impl_catalog_record {
    ($ty:ty, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

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
    };
}

impl_catalog_record!(Partition, "partition");
impl_catalog_record!(Size, "size");
impl_catalog_record!(Image, "image");
