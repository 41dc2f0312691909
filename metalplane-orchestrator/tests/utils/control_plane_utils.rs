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

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use metalplane_config::catalog::{
    CatalogConfig, ImageSpec, NetworkSpec, PartitionSpec, SizeConstraintSpec, SizeConstraintType,
    SizeSpec,
};
use metalplane_config::control_plane::{ControlPlaneConfig, IntegerPoolConfig};
use metalplane_error::{Code, Error, make_err};
use metalplane_orchestrator::allocation::{AllocationRequest, NetworkRequest};
use metalplane_orchestrator::control_plane::ControlPlane;
use metalplane_orchestrator::datastore::DataStore;
use metalplane_store::ipam::{Ipam, MemoryIpam};
use metalplane_store::memory_event_publisher::MemoryEventPublisher;
use metalplane_util::machine::{Machine, MachineHardware, Nic};
use metalplane_util::network::PrefixUsage;
use metalplane_util::switch::Switch;
use mock_instant::thread_local::MockClock;

pub const PARTITION_ID: &str = "p1";
pub const SIZE_ID: &str = "s1";
pub const IMAGE_ID: &str = "ubuntu-24.04";
pub const PROJECT_ID: &str = "pr1";
pub const OTHER_PROJECT_ID: &str = "pr2";
pub const SUPER_NETWORK_ID: &str = "private";
pub const SUPER_PREFIX: &str = "10.0.0.0/8";
pub const INTERNET_NETWORK_ID: &str = "internet";
pub const INTERNET_VRF: u32 = 104_009;
pub const SWITCH_ID: &str = "leaf01";
pub const VRF_POOL: IntegerPoolConfig = IntegerPoolConfig { min: 10, max: 20 };

pub fn mock_now() -> SystemTime {
    UNIX_EPOCH + MockClock::time()
}

pub fn test_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.orchestrator.vrf_pool = VRF_POOL;
    config.catalog = CatalogConfig {
        partitions: vec![PartitionSpec {
            id: PARTITION_ID.to_string(),
            name: "partition one".to_string(),
            description: String::new(),
            private_network_prefix_length: 0,
        }],
        sizes: vec![SizeSpec {
            id: SIZE_ID.to_string(),
            name: "small".to_string(),
            constraints: vec![SizeConstraintSpec {
                r#type: SizeConstraintType::cores,
                min: 4,
                max: 8,
            }],
        }],
        images: vec![ImageSpec {
            id: IMAGE_ID.to_string(),
            name: "ubuntu".to_string(),
            url: "https://images.example/ubuntu-24.04.img".to_string(),
        }],
        networks: vec![
            NetworkSpec {
                id: SUPER_NETWORK_ID.to_string(),
                partition_id: PARTITION_ID.to_string(),
                prefixes: vec![SUPER_PREFIX.to_string()],
                private_super: true,
                ..NetworkSpec::default()
            },
            NetworkSpec {
                id: INTERNET_NETWORK_ID.to_string(),
                partition_id: PARTITION_ID.to_string(),
                prefixes: vec!["185.1.2.0/24".to_string()],
                destination_prefixes: vec!["0.0.0.0/0".to_string()],
                nat: true,
                shared: true,
                vrf: Some(INTERNET_VRF),
                ..NetworkSpec::default()
            },
        ],
    };
    config
}

pub struct TestControlPlane {
    pub control_plane: ControlPlane,
    pub ipam: Arc<MemoryIpam>,
    pub publisher: Arc<MemoryEventPublisher>,
}

impl TestControlPlane {
    pub fn datastore(&self) -> &DataStore {
        self.control_plane.datastore()
    }
}

/// Memory IPAM whose next `release_ip` calls fail with `Unavailable`.
#[derive(Debug, Default)]
pub struct FlakyIpam {
    inner: Arc<MemoryIpam>,
    release_failures: AtomicUsize,
}

impl FlakyIpam {
    pub fn new(inner: Arc<MemoryIpam>, release_failures: usize) -> Self {
        Self {
            inner,
            release_failures: AtomicUsize::new(release_failures),
        }
    }
}

#[async_trait]
impl Ipam for FlakyIpam {
    async fn create_prefix(&self, cidr: &str) -> Result<(), Error> {
        self.inner.create_prefix(cidr).await
    }

    async fn delete_prefix(&self, cidr: &str) -> Result<(), Error> {
        self.inner.delete_prefix(cidr).await
    }

    async fn allocate_child_prefix(&self, parent: &str, length: u8) -> Result<String, Error> {
        self.inner.allocate_child_prefix(parent, length).await
    }

    async fn release_child_prefix(&self, child: &str) -> Result<(), Error> {
        self.inner.release_child_prefix(child).await
    }

    async fn allocate_ip(&self, prefix: &str) -> Result<String, Error> {
        self.inner.allocate_ip(prefix).await
    }

    async fn allocate_specific_ip(&self, prefix: &str, address: &str) -> Result<String, Error> {
        self.inner.allocate_specific_ip(prefix, address).await
    }

    async fn release_ip(&self, address: &str) -> Result<(), Error> {
        let failing = self
            .release_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(make_err!(Code::Unavailable, "IPAM unreachable"));
        }
        self.inner.release_ip(address).await
    }

    async fn prefix_usage(&self, cidr: &str) -> Result<PrefixUsage, Error> {
        self.inner.prefix_usage(cidr).await
    }
}

/// Control plane talking to `adapter`, which must be backed by `ipam`.
pub async fn setup_with_ipam(
    config: ControlPlaneConfig,
    ipam: Arc<MemoryIpam>,
    adapter: Arc<dyn Ipam>,
) -> Result<TestControlPlane, Error> {
    let publisher = Arc::new(MemoryEventPublisher::new());
    let control_plane = ControlPlane::new(
        config,
        DataStore::new_in_memory(),
        adapter,
        publisher.clone(),
        mock_now,
    )
    .await?;
    control_plane.seed().await?;
    Ok(TestControlPlane {
        control_plane,
        ipam,
        publisher,
    })
}

pub async fn setup_with(config: ControlPlaneConfig) -> Result<TestControlPlane, Error> {
    let ipam = Arc::new(MemoryIpam::new());
    setup_with_ipam(config, ipam.clone(), ipam).await
}

pub async fn setup() -> Result<TestControlPlane, Error> {
    setup_with(test_config()).await
}

pub fn port(name: &str, mac_address: &str) -> Nic {
    Nic {
        mac_address: mac_address.to_string(),
        name: name.to_string(),
        ..Nic::default()
    }
}

pub fn make_switch(ports: &[(&str, &str)]) -> Switch {
    Switch {
        id: SWITCH_ID.to_string(),
        partition_id: PARTITION_ID.to_string(),
        rack_id: "rack01".to_string(),
        nics: ports.iter().map(|(name, mac)| port(name, mac)).collect(),
        ..Switch::default()
    }
}

/// Machine with 8 cores and one NIC cabled to the switch port with
/// `port_mac`.
pub fn make_machine(id: &str, nic_mac: &str, port_mac: &str) -> Machine {
    let mut machine = Machine::bare(id);
    machine.partition_id = PARTITION_ID.to_string();
    machine.rack_id = "rack01".to_string();
    machine.hardware = MachineHardware {
        cpu_cores: 8,
        memory: 16 << 30,
        disks: Vec::new(),
        nics: vec![Nic {
            mac_address: nic_mac.to_string(),
            name: "eth0".to_string(),
            neighbors: vec![port("swp1", port_mac)],
            ..Nic::default()
        }],
    };
    machine
}

pub fn allocation_request(uuid: Option<&str>, project_id: &str) -> AllocationRequest {
    AllocationRequest {
        uuid: uuid.map(str::to_string),
        name: "worker".to_string(),
        hostname: "worker-0".to_string(),
        project_id: project_id.to_string(),
        partition_id: PARTITION_ID.to_string(),
        size_id: SIZE_ID.to_string(),
        image_id: IMAGE_ID.to_string(),
        networks: vec![NetworkRequest {
            network_id: SUPER_NETWORK_ID.to_string(),
            ips: Vec::new(),
        }],
        ..AllocationRequest::default()
    }
}
