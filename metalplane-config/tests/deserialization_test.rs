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

use metalplane_config::catalog::SizeConstraintType;
use metalplane_config::control_plane::{ControlPlaneConfig, IntegerPoolConfig};
use pretty_assertions::assert_eq;

#[test]
fn empty_config_uses_zero_values() {
    let config: ControlPlaneConfig = serde_json5::from_str("{}").unwrap();
    assert_eq!(config.orchestrator.vrf_pool, IntegerPoolConfig::default());
    assert_eq!(config.orchestrator.max_claim_retries, 0);
    assert_eq!(config.release.workers, 0);
    assert!(config.catalog.networks.is_empty());
}

#[test]
fn full_config_deserializes() {
    let config: ControlPlaneConfig = serde_json5::from_str(
        r#"{
            // Comments are allowed in json5.
            orchestrator: {
                vrf_pool: { min: 10, max: 20 },
                asn_base: 4200000000,
                asn_max: "4294967294",
                max_claim_retries: 5,
            },
            liveliness: { alive_threshold_s: 10, dead_threshold_s: 100 },
            release: { workers: 2, retry: { max_retries: 3, delay: 0.5, jitter: 0.1 } },
            catalog: {
                partitions: [{ id: "fra-1", private_network_prefix_length: 24 }],
                sizes: [{ id: "s1", constraints: [{ type: "cores", min: 8, max: 16 }] }],
                images: [{ id: "ubuntu-24.04" }],
                networks: [{
                    id: "tenant-super",
                    partition_id: "fra-1",
                    prefixes: ["10.0.0.0/16"],
                    private_super: true,
                }],
            },
        }"#,
    )
    .unwrap();

    assert_eq!(
        config.orchestrator.vrf_pool,
        IntegerPoolConfig { min: 10, max: 20 }
    );
    assert_eq!(config.orchestrator.asn_base, 4_200_000_000);
    assert_eq!(config.orchestrator.asn_max, 4_294_967_294);
    assert_eq!(config.orchestrator.max_claim_retries, 5);
    assert_eq!(config.liveliness.dead_threshold_s, 100);
    assert_eq!(config.release.retry.max_retries, 3);
    assert_eq!(config.catalog.partitions[0].private_network_prefix_length, 24);
    assert_eq!(
        config.catalog.sizes[0].constraints[0].r#type,
        SizeConstraintType::cores
    );
    assert!(config.catalog.networks[0].private_super);
    assert_eq!(config.catalog.networks[0].project_id, None);
}

#[test]
fn numeric_values_expand_environment_variables() {
    // SAFETY: tests in this file do not read this variable concurrently.
    unsafe {
        std::env::set_var("METALPLANE_TEST_WORKERS", "7");
    }
    let config: ControlPlaneConfig =
        serde_json5::from_str(r#"{ release: { workers: "${METALPLANE_TEST_WORKERS}" } }"#)
            .unwrap();
    assert_eq!(config.release.workers, 7);
}

#[test]
fn unknown_fields_are_rejected() {
    let result = serde_json5::from_str::<ControlPlaneConfig>(r#"{ orchestrator: { bogus: 1 } }"#);
    assert!(result.is_err());
}

#[test]
fn deployment_config_deserializes() {
    let config: ControlPlaneConfig =
        serde_json5::from_str(include_str!("../../deploy/metalplane.json5")).unwrap();
    assert_eq!(config.release.workers, 4);
    assert_eq!(config.catalog.sizes[0].constraints.len(), 3);
    assert_eq!(config.catalog.networks.len(), 2);
    assert_eq!(config.catalog.networks[1].vrf, Some(104_009));
}
