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

use core::fmt;
use core::str::FromStr;
use std::time::SystemTime;

use metalplane_error::{Error, make_input_err};
use serde::{Deserialize, Serialize};

use crate::machine::MachineLiveliness;
use crate::store_trait::Record;

/// Lifecycle steps reported by the provisioning agent running on a machine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningEventType {
    Alive,
    Crashed,
    #[serde(rename = "PXE Booting")]
    PxeBooting,
    #[serde(rename = "Planned Reboot")]
    PlannedReboot,
    Preparing,
    Registering,
    Waiting,
    Installing,
    #[serde(rename = "Booting New Kernel")]
    BootingNewKernel,
    #[serde(rename = "Phoned Home")]
    PhonedHome,
}

use ProvisioningEventType::{
    Alive, BootingNewKernel, Crashed, Installing, PhonedHome, PlannedReboot, Preparing,
    PxeBooting, Registering, Waiting,
};

/// Transitions that belong to a regular provisioning cycle. Any transition
/// not listed here counts as an incomplete cycle.
pub const EXPECTED_SUCCESSORS: &[(ProvisioningEventType, &[ProvisioningEventType])] = &[
    (PxeBooting, &[Preparing]),
    (Preparing, &[Registering]),
    (Registering, &[Waiting]),
    (Waiting, &[Installing, PxeBooting, PlannedReboot]),
    (Installing, &[BootingNewKernel]),
    (BootingNewKernel, &[PhonedHome]),
    (PhonedHome, &[PhonedHome, PlannedReboot, PxeBooting]),
    (PlannedReboot, &[PxeBooting]),
    (Crashed, &[PxeBooting]),
];

impl ProvisioningEventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Alive => "Alive",
            Crashed => "Crashed",
            PxeBooting => "PXE Booting",
            PlannedReboot => "Planned Reboot",
            Preparing => "Preparing",
            Registering => "Registering",
            Waiting => "Waiting",
            Installing => "Installing",
            BootingNewKernel => "Booting New Kernel",
            PhonedHome => "Phoned Home",
        }
    }

    /// A cycle ends when the machine is ready to be allocated or when an
    /// installed machine reports back.
    pub const fn closes_cycle(self) -> bool {
        matches!(self, Waiting | PhonedHome)
    }

    pub fn is_expected_successor(self, next: Self) -> bool {
        EXPECTED_SUCCESSORS
            .iter()
            .find(|(event, _)| *event == self)
            .is_some_and(|(_, successors)| successors.contains(&next))
    }
}

impl fmt::Display for ProvisioningEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningEventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Alive,
            Crashed,
            PxeBooting,
            PlannedReboot,
            Preparing,
            Registering,
            Waiting,
            Installing,
            BootingNewKernel,
            PhonedHome,
        ]
        .into_iter()
        .find(|event| event.as_str() == s)
        .ok_or_else(|| make_input_err!("Unknown provisioning event type {s:?}"))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningEvent {
    pub time: SystemTime,
    pub event: ProvisioningEventType,
    pub message: String,
}

/// Event log of one machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningEventContainer {
    pub id: String,
    /// Most recent event first.
    pub events: Vec<ProvisioningEvent>,
    pub last_event_time: Option<SystemTime>,
    pub incomplete_provisioning_cycles: u32,
    pub liveliness: MachineLiveliness,
    pub version: u64,
}

impl ProvisioningEventContainer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            events: Vec::new(),
            last_event_time: None,
            incomplete_provisioning_cycles: 0,
            liveliness: MachineLiveliness::Unknown,
            version: 0,
        }
    }

    /// Number of unexpected transitions since the most recent event that
    /// closed a cycle.
    pub fn count_incomplete_cycles(&self) -> u32 {
        let end = self
            .events
            .iter()
            .position(|e| e.event.closes_cycle())
            .map_or(self.events.len(), |idx| idx + 1);
        let window = &self.events[..end];
        let unexpected = window
            .windows(2)
            // `window` is newest first, so pairs are (next, previous).
            .filter(|pair| !pair[1].event.is_expected_successor(pair[0].event))
            .count();
        u32::try_from(unexpected).unwrap_or(u32::MAX)
    }
}

impl Record for ProvisioningEventContainer {
    const KIND: &'static str = "provisioning event container";

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
