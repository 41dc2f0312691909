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

pub mod allocation;
pub mod allocation_waiter;
pub mod control_plane;
pub mod datastore;
pub mod provisioning;
pub mod release;
pub mod switch_manager;

/// Source of wall clock time. Tests inject a mocked clock.
pub type NowFn = fn() -> SystemTime;

/// Default offset of every ASN handed out to a machine.
pub const DEFAULT_ASN_BASE: u32 = 4_200_000_000;

/// Default highest ASN that may be handed out.
pub const DEFAULT_ASN_MAX: u32 = 4_294_967_294;

/// Default number of claim retries after losing a race for a candidate.
pub const DEFAULT_MAX_CLAIM_RETRIES: usize = 3;

/// Default bound of a wait-for-allocation call.
pub const DEFAULT_WAIT_FOR_ALLOCATION_TIMEOUT_S: u64 = 30;

/// Default prefix length of project networks.
pub const DEFAULT_PRIVATE_NETWORK_PREFIX_LENGTH: u8 = 22;

/// Attempts of a read-modify-write cycle on a single record before the
/// conflict is returned.
pub const MAX_RECORD_UPDATE_ATTEMPTS: usize = 10;

/// Name of the pool VRF ids are acquired from.
pub const VRF_POOL_NAME: &str = "vrf";

/// Name of the pool ASN offsets are acquired from.
pub const ASN_POOL_NAME: &str = "asn";
