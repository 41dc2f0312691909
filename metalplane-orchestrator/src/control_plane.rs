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

use std::sync::Arc;

use metalplane_config::catalog::{CatalogConfig, NetworkSpec};
use metalplane_config::control_plane::ControlPlaneConfig;
use metalplane_error::{Code, Error, ResultExt, make_err};
use metalplane_store::ipam::Ipam;
use metalplane_util::catalog::{Image, Partition, Size};
use metalplane_util::event_publisher::{EventPublisher, MACHINE_TOPIC, SWITCH_TOPIC};
use metalplane_util::network::Network;
use metalplane_util::store_trait::{Record, RecordStore};
use metalplane_util::task::JoinHandleDropGuard;
use tracing::{Level, event};

use crate::NowFn;
use crate::allocation::MachineAllocator;
use crate::datastore::DataStore;
use crate::provisioning::ProvisioningTracker;
use crate::release::{ReleaseActor, ReleaseQueues};
use crate::switch_manager::SwitchConnectionManager;

/// Inserts `record` unless a record with the same key exists. Returns
/// whether it was created.
async fn create_if_missing<R: Record>(
    store: &dyn RecordStore<R>,
    record: R,
) -> Result<bool, Error> {
    match store.create(record).await {
        Ok(_) => Ok(true),
        Err(err) if err.code == Code::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

/// Wires the components of the control plane onto one set of stores.
pub struct ControlPlane {
    config: ControlPlaneConfig,
    datastore: DataStore,
    ipam: Arc<dyn Ipam>,
    publisher: Arc<dyn EventPublisher>,
    pub switches: SwitchConnectionManager,
    pub provisioning: Arc<ProvisioningTracker>,
    pub allocator: MachineAllocator,
    pub release: Arc<ReleaseActor>,
}

impl core::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("allocator", &self.allocator)
            .field("provisioning", &self.provisioning)
            .field("release", &self.release)
            .finish_non_exhaustive()
    }
}

impl ControlPlane {
    pub async fn new(
        config: ControlPlaneConfig,
        datastore: DataStore,
        ipam: Arc<dyn Ipam>,
        publisher: Arc<dyn EventPublisher>,
        now_fn: NowFn,
    ) -> Result<Self, Error> {
        for topic in [MACHINE_TOPIC, SWITCH_TOPIC] {
            publisher
                .create_topic(topic)
                .await
                .err_tip(|| format!("Creating topic {topic}"))?;
        }
        let release_queues = ReleaseQueues::default();
        let allocator = MachineAllocator::new(
            &config.orchestrator,
            datastore.clone(),
            ipam.clone(),
            publisher.clone(),
            release_queues.clone(),
            now_fn,
        )
        .await?;
        let release = Arc::new(ReleaseActor::new(
            datastore.clone(),
            ipam.clone(),
            allocator.asn_pool().clone(),
            allocator.asn_base(),
            release_queues,
        ));
        let provisioning = Arc::new(ProvisioningTracker::new(
            &config.liveliness,
            datastore.clone(),
            now_fn,
        ));
        Ok(Self {
            switches: SwitchConnectionManager::new(datastore.clone()),
            config,
            datastore,
            ipam,
            publisher,
            provisioning,
            allocator,
            release,
        })
    }

    pub const fn datastore(&self) -> &DataStore {
        &self.datastore
    }

    pub fn publisher(&self) -> &dyn EventPublisher {
        self.publisher.as_ref()
    }

    /// Creates `spec` and its prefixes in IPAM. A partition has at most one
    /// private super network.
    pub async fn create_network(&self, spec: NetworkSpec) -> Result<Network, Error> {
        let network = Network::from(spec);
        if network.private_super {
            let existing = self
                .datastore
                .networks
                .list()
                .await?
                .into_iter()
                .find(|n| {
                    n.private_super && n.partition_id == network.partition_id && n.id != network.id
                });
            if let Some(existing) = existing {
                return Err(make_err!(
                    Code::InvalidArgument,
                    "Partition {} already has private super network {}",
                    network.partition_id,
                    existing.id
                ));
            }
        }
        for prefix in &network.prefixes {
            self.ipam
                .create_prefix(prefix)
                .await
                .err_tip(|| format!("Creating prefix {prefix} of network {}", network.id))?;
        }
        self.datastore.networks.create(network).await
    }

    /// Seeds partitions, sizes, images and networks. Entries that already
    /// exist are left alone.
    pub async fn seed_catalog(&self, catalog: &CatalogConfig) -> Result<(), Error> {
        for spec in &catalog.partitions {
            create_if_missing(
                self.datastore.partitions.as_ref(),
                Partition::from(spec.clone()),
            )
            .await?;
        }
        for spec in &catalog.sizes {
            create_if_missing(self.datastore.sizes.as_ref(), Size::from(spec.clone())).await?;
        }
        for spec in &catalog.images {
            create_if_missing(self.datastore.images.as_ref(), Image::from(spec.clone())).await?;
        }
        for spec in &catalog.networks {
            if self.datastore.networks.find(&spec.id).await?.is_some() {
                continue;
            }
            self.create_network(spec.clone())
                .await
                .err_tip(|| format!("Seeding network {}", spec.id))?;
        }
        event!(
            Level::INFO,
            partitions = catalog.partitions.len(),
            sizes = catalog.sizes.len(),
            images = catalog.images.len(),
            networks = catalog.networks.len(),
            "Seeded catalog"
        );
        Ok(())
    }

    /// Seeds the configured catalog.
    pub async fn seed(&self) -> Result<(), Error> {
        self.seed_catalog(&self.config.catalog).await
    }

    /// Starts the release workers and the liveliness sweep. Dropping the
    /// returned guards stops them.
    pub fn start_background(&self) -> Vec<JoinHandleDropGuard<()>> {
        let mut guards = self.release.spawn_workers(&self.config.release);
        guards.push(self.provisioning.spawn_liveliness_sweep());
        guards
    }
}
