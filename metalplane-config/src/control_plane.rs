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
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogConfig;
use crate::serde_utils::convert_numeric_with_shellexpand;

/// Top level configuration of the control plane process.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ControlPlaneConfig {
    /// Settings of the machine allocation orchestrator.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Settings of the provisioning event tracker and liveliness sweep.
    #[serde(default)]
    pub liveliness: LivelinessConfig,

    /// Settings of the asynchronous network release workers.
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Partitions, sizes, images and networks seeded on start-up.
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Range of an integer resource pool. Values are handed out from
/// `[min, max)`, `max` itself is never handed out.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IntegerPoolConfig {
    /// Smallest value of the pool.
    /// Default: 1
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub min: u32,

    /// Exclusive upper bound of the pool.
    /// Default: 131072
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Pool VRF ids are acquired from when a project network is created.
    #[serde(default)]
    pub vrf_pool: IntegerPoolConfig,

    /// Pool the per machine ASN offsets are acquired from. The final ASN is
    /// `asn_base + value`.
    #[serde(default)]
    pub asn_pool: IntegerPoolConfig,

    /// Offset added to every value of the ASN pool.
    /// Default: 4200000000
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub asn_base: u32,

    /// Highest ASN that may ever be handed out. Computing an ASN above this
    /// value is treated as a fatal configuration error.
    /// Default: 4294967294
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub asn_max: u32,

    /// Number of times a lost claim race is retried with a fresh candidate
    /// before `NoMachineAvailable` is returned.
    /// Default: 3
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_claim_retries: usize,

    /// Server side bound of a wait-for-allocation long poll in seconds.
    /// Default: 30
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub wait_for_allocation_timeout_s: u64,

    /// Prefix length of the project networks carved out of a private super
    /// network when a partition does not configure its own.
    /// Default: 22
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub private_network_prefix_length: u8,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct LivelinessConfig {
    /// A machine that reported within this many seconds is alive.
    /// Default: 300
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub alive_threshold_s: u64,

    /// A machine that has not reported for this many seconds is dead.
    /// Everything in between the two thresholds is unknown.
    /// Default: 3600
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub dead_threshold_s: u64,

    /// Interval of the full fleet liveliness sweep in seconds.
    /// Default: 60
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub sweep_interval_s: u64,

    /// Number of provisioning events kept per machine.
    /// Default: 20
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub event_retention_limit: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ReleaseConfig {
    /// Number of workers consuming each release job queue.
    /// Default: 4
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub workers: usize,

    /// Retry policy applied to every release job.
    #[serde(default)]
    pub retry: Retry,
}

/// Retry configuration. This configuration is exponential and each iteration
/// a jitter as a percentage is applied of the calculated delay. For example:
/// ```haskell
/// Retry{
///   max_retries: 7,
///   delay: 0.1,
///   jitter: 0.5,
/// }
/// ```
/// will result in:
/// Attempt - Delay
/// 1         0ms
/// 2         75ms - 125ms
/// 3         150ms - 250ms
/// 4         300ms - 500ms
/// 5         600ms - 1s
/// 6         1.2s - 2s
/// 7         2.4s - 4s
/// 8         4.8s - 8s
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Retry {
    /// Maximum number of retries until retrying stops.
    /// Setting this to zero will always attempt 1 time, but not retry.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub max_retries: usize,

    /// Delay in seconds for exponential back off.
    #[serde(default)]
    pub delay: f32,

    /// Amount of jitter to add as a percentage in decimal form.
    #[serde(default)]
    pub jitter: f32,
}

impl Retry {
    /// Returns a function that applies the configured jitter to a delay.
    pub fn make_jitter_fn(&self) -> Arc<dyn Fn(Duration) -> Duration + Send + Sync> {
        if self.jitter == 0f32 {
            Arc::new(move |delay: Duration| delay)
        } else {
            let local_jitter = self.jitter;
            Arc::new(move |delay: Duration| {
                delay.mul_f32(local_jitter.mul_add(rand::rng().random::<f32>() - 0.5, 1.))
            })
        }
    }
}
