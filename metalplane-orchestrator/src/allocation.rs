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

use metalplane_config::control_plane::OrchestratorConfig;
use metalplane_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use metalplane_store::integer_pool::IntegerPool;
use metalplane_store::ipam::Ipam;
use metalplane_util::catalog::Partition;
use metalplane_util::event_publisher::{EventPublisher, MACHINE_TOPIC, SWITCH_TOPIC, publish_event};
use metalplane_util::machine::{
    EventType, Machine, MachineAllocation, MachineEvent, MachineNetwork, MachineState,
    MachineStateValue, UNKNOWN_SIZE_ID,
};
use metalplane_util::network::{Ip, IpType, Network, PrefixUsage};
use metalplane_util::store_trait::update_with_retry;
use metalplane_util::switch::SwitchEvent;
use tracing::{Level, event};

use crate::allocation_waiter::AllocationWaiter;
use crate::datastore::DataStore;
use crate::release::{ReleaseMachineNetworksJob, ReleaseQueues};
use crate::switch_manager::{SwitchConnectionManager, vrf_name};
use crate::{
    ASN_POOL_NAME, DEFAULT_ASN_BASE, DEFAULT_ASN_MAX, DEFAULT_MAX_CLAIM_RETRIES,
    DEFAULT_PRIVATE_NETWORK_PREFIX_LENGTH, DEFAULT_WAIT_FOR_ALLOCATION_TIMEOUT_S,
    MAX_RECORD_UPDATE_ATTEMPTS, NowFn, VRF_POOL_NAME,
};

/// A network the allocated machine should be attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkRequest {
    pub network_id: String,
    /// Specific addresses to attach. One address is allocated if empty.
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Allocate exactly this machine instead of picking a candidate.
    pub uuid: Option<String>,
    pub name: String,
    pub description: String,
    pub hostname: String,
    pub project_id: String,
    pub partition_id: String,
    pub size_id: String,
    pub image_id: String,
    pub ssh_pub_keys: Vec<String>,
    pub user_data: String,
    pub tags: Vec<String>,
    /// Without a private network the project network of the partition is
    /// attached.
    pub networks: Vec<NetworkRequest>,
}

/// Id of the private network of `project_id` in `partition_id`.
pub fn project_network_id(partition_id: &str, project_id: &str) -> String {
    format!("private-{partition_id}-{project_id}")
}

fn merge_error(acc: Option<Error>, err: Error) -> Error {
    match acc {
        Some(acc) => acc.merge(err),
        None => err,
    }
}

/// Everything an allocation acquired after the claim, released again if the
/// allocation fails.
#[derive(Debug, Default)]
struct Acquired {
    project_network: Option<Network>,
    /// Ip records created by this allocation, allocated in IPAM as well.
    created_ips: Vec<String>,
    /// Existing static ips this machine was added to.
    attached_ips: Vec<String>,
    asn_value: Option<u32>,
    /// Allocation written to the machine record before the switches.
    persisted_allocation: Option<MachineAllocation>,
    switches_touched: bool,
}

/// Claims machines for projects, wires them into their networks and hands
/// them back on free.
pub struct MachineAllocator {
    datastore: DataStore,
    ipam: Arc<dyn Ipam>,
    publisher: Arc<dyn EventPublisher>,
    switches: SwitchConnectionManager,
    waiter: AllocationWaiter,
    release_queues: ReleaseQueues,
    vrf_pool: IntegerPool,
    asn_pool: IntegerPool,
    asn_base: u32,
    asn_max: u32,
    max_claim_retries: usize,
    wait_for_allocation_timeout: Duration,
    private_network_prefix_length: u8,
    now_fn: NowFn,
}

impl core::fmt::Debug for MachineAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MachineAllocator")
            .field("vrf_pool", &self.vrf_pool)
            .field("asn_pool", &self.asn_pool)
            .field("asn_base", &self.asn_base)
            .field("asn_max", &self.asn_max)
            .field("max_claim_retries", &self.max_claim_retries)
            .finish_non_exhaustive()
    }
}

impl MachineAllocator {
    pub async fn new(
        config: &OrchestratorConfig,
        datastore: DataStore,
        ipam: Arc<dyn Ipam>,
        publisher: Arc<dyn EventPublisher>,
        release_queues: ReleaseQueues,
        now_fn: NowFn,
    ) -> Result<Self, Error> {
        let vrf_pool = IntegerPool::new(
            VRF_POOL_NAME,
            config.vrf_pool,
            datastore.integer_pools.clone(),
        )
        .await
        .err_tip(|| "Opening vrf pool")?;
        let asn_pool = IntegerPool::new(
            ASN_POOL_NAME,
            config.asn_pool,
            datastore.integer_pools.clone(),
        )
        .await
        .err_tip(|| "Opening asn pool")?;

        let asn_base = if config.asn_base == 0 {
            DEFAULT_ASN_BASE
        } else {
            config.asn_base
        };
        let asn_max = if config.asn_max == 0 {
            DEFAULT_ASN_MAX
        } else {
            config.asn_max
        };
        error_if!(
            asn_base > asn_max,
            "Asn base {asn_base} is above asn max {asn_max}"
        );
        let max_claim_retries = if config.max_claim_retries == 0 {
            DEFAULT_MAX_CLAIM_RETRIES
        } else {
            config.max_claim_retries
        };
        let wait_for_allocation_timeout_s = if config.wait_for_allocation_timeout_s == 0 {
            DEFAULT_WAIT_FOR_ALLOCATION_TIMEOUT_S
        } else {
            config.wait_for_allocation_timeout_s
        };
        let private_network_prefix_length = if config.private_network_prefix_length == 0 {
            DEFAULT_PRIVATE_NETWORK_PREFIX_LENGTH
        } else {
            config.private_network_prefix_length
        };

        Ok(Self {
            switches: SwitchConnectionManager::new(datastore.clone()),
            datastore,
            ipam,
            publisher,
            waiter: AllocationWaiter::new(),
            release_queues,
            vrf_pool,
            asn_pool,
            asn_base,
            asn_max,
            max_claim_retries,
            wait_for_allocation_timeout: Duration::from_secs(wait_for_allocation_timeout_s),
            private_network_prefix_length,
            now_fn,
        })
    }

    pub const fn vrf_pool(&self) -> &IntegerPool {
        &self.vrf_pool
    }

    pub const fn asn_pool(&self) -> &IntegerPool {
        &self.asn_pool
    }

    pub const fn asn_base(&self) -> u32 {
        self.asn_base
    }

    pub const fn waiter(&self) -> &AllocationWaiter {
        &self.waiter
    }

    /// Creates or updates the hardware record of a machine and records its
    /// switch connections. State, allocation and liveliness of a known
    /// machine are kept.
    pub async fn register_machine(&self, mut machine: Machine) -> Result<Machine, Error> {
        error_if!(machine.id.is_empty(), "Machine id must not be empty");
        self.datastore
            .partitions
            .get(&machine.partition_id)
            .await
            .err_tip(|| format!("Registering machine {}", machine.id))?;

        let sizes = self.datastore.sizes.list().await?;
        machine.size_id = sizes
            .iter()
            .find(|size| size.matches(&machine.hardware))
            .map_or_else(|| UNKNOWN_SIZE_ID.to_string(), |size| size.id.clone());

        let (old, stored) = match self.datastore.machines.create(machine.clone()).await {
            Ok(stored) => (None, stored),
            Err(err) if err.code == Code::AlreadyExists => {
                let mut old = None;
                let stored = update_with_retry(
                    self.datastore.machines.as_ref(),
                    &machine.id,
                    MAX_RECORD_UPDATE_ATTEMPTS,
                    |existing| {
                        old = Some(existing.clone());
                        existing.partition_id.clone_from(&machine.partition_id);
                        existing.size_id.clone_from(&machine.size_id);
                        existing.rack_id.clone_from(&machine.rack_id);
                        existing.hardware = machine.hardware.clone();
                        Ok(true)
                    },
                )
                .await?;
                (old, stored)
            }
            Err(err) => return Err(err),
        };

        self.switches
            .connect_machine_to_switches(&stored)
            .await
            .err_tip(|| format!("Connecting machine {} to switches", stored.id))?;

        let r#type = if old.is_some() {
            EventType::Update
        } else {
            EventType::Create
        };
        publish_event(
            self.publisher.as_ref(),
            MACHINE_TOPIC,
            &MachineEvent {
                r#type,
                old,
                new: Some(stored.clone()),
            },
        )
        .await?;
        event!(
            Level::INFO,
            machine_id = %stored.id,
            size_id = %stored.size_id,
            "Registered machine"
        );
        Ok(stored)
    }

    /// Claims a machine for `request` and attaches its networks. A failure
    /// after the claim rolls back everything acquired so far and leaves the
    /// machine available again.
    pub async fn allocate(&self, request: AllocationRequest) -> Result<Machine, Error> {
        error_if!(request.project_id.is_empty(), "Project id must not be empty");
        self.datastore
            .images
            .get(&request.image_id)
            .await
            .err_tip(|| "Resolving image of allocation")?;

        let claimed = self.claim(&request).await?;
        let mut acquired = Acquired::default();
        let result = match self.attach(&request, &claimed, &mut acquired).await {
            Ok(machine) => Ok(machine),
            Err(err) => {
                event!(
                    Level::WARN,
                    machine_id = %claimed.id,
                    ?err,
                    "Allocation failed, rolling back"
                );
                self.rollback(&claimed, acquired).await;
                Err(err.append(format!("Allocation of machine {} was rolled back", claimed.id)))
            }
        };
        self.waiter.notify(
            &claimed.id,
            &result
                .as_ref()
                .map_err(Clone::clone)
                .and_then(|machine| machine.allocation().cloned()),
        );
        result
    }

    fn new_allocation(&self, request: &AllocationRequest) -> MachineAllocation {
        MachineAllocation {
            created: (self.now_fn)(),
            name: request.name.clone(),
            description: request.description.clone(),
            project_id: request.project_id.clone(),
            image_id: request.image_id.clone(),
            hostname: request.hostname.clone(),
            ssh_pub_keys: request.ssh_pub_keys.clone(),
            user_data: request.user_data.clone(),
            console_password: String::new(),
            machine_networks: Vec::new(),
            succeeded: false,
        }
    }

    async fn find_candidate(&self, request: &AllocationRequest) -> Result<Machine, Error> {
        if let Some(uuid) = &request.uuid {
            let machine = self.datastore.machines.get(uuid).await?;
            if machine.is_allocated() {
                return Err(make_err!(
                    Code::AlreadyExists,
                    "Machine {uuid} is already allocated"
                ));
            }
            if machine.state.value != MachineStateValue::Available {
                return Err(make_err!(
                    Code::FailedPrecondition,
                    "Machine {uuid} is {:?}: {}",
                    machine.state.value,
                    machine.state.description
                ));
            }
            return Ok(machine);
        }
        // Lowest id wins, `list` is ordered by key.
        self.datastore
            .machines
            .list()
            .await?
            .into_iter()
            .find(|machine| {
                machine.partition_id == request.partition_id
                    && machine.size_id == request.size_id
                    && machine.is_candidate()
            })
            .ok_or_else(|| {
                make_err!(
                    Code::ResourceExhausted,
                    "No machine available in partition {} with size {}",
                    request.partition_id,
                    request.size_id
                )
            })
    }

    /// Writes a fresh allocation into a candidate. Losing the race against
    /// another claim picks the next candidate.
    async fn claim(&self, request: &AllocationRequest) -> Result<Machine, Error> {
        if request.uuid.is_none() {
            self.datastore
                .partitions
                .get(&request.partition_id)
                .await
                .err_tip(|| "Resolving partition of allocation")?;
            self.datastore
                .sizes
                .get(&request.size_id)
                .await
                .err_tip(|| "Resolving size of allocation")?;
        }
        for attempt in 0..=self.max_claim_retries {
            let candidate = self.find_candidate(request).await?;
            let mut claimed = candidate.clone();
            claimed.allocation = Some(self.new_allocation(request));
            match self.datastore.machines.update(&candidate, claimed).await {
                Ok(stored) => {
                    event!(
                        Level::DEBUG,
                        machine_id = %stored.id,
                        attempt,
                        "Claimed machine"
                    );
                    return Ok(stored);
                }
                Err(err) if err.is_conflict() => {
                    event!(
                        Level::DEBUG,
                        machine_id = %candidate.id,
                        attempt,
                        "Lost claim race, picking next candidate"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(make_err!(
            Code::ResourceExhausted,
            "No machine available in partition {} with size {} after {} claim attempts",
            request.partition_id,
            request.size_id,
            self.max_claim_retries + 1
        ))
    }

    async fn private_super_network(&self, partition_id: &str) -> Result<Network, Error> {
        self.datastore
            .networks
            .list()
            .await?
            .into_iter()
            .find(|network| network.private_super && network.partition_id == partition_id)
            .ok_or_else(|| {
                make_err!(
                    Code::FailedPrecondition,
                    "Partition {partition_id} has no private super network"
                )
            })
    }

    /// Returns the project network of the partition, creating it from the
    /// private super network on first use.
    async fn resolve_project_network(
        &self,
        partition: &Partition,
        project_id: &str,
        acquired: &mut Acquired,
    ) -> Result<Network, Error> {
        let id = project_network_id(&partition.id, project_id);
        if let Some(network) = self.datastore.networks.find(&id).await? {
            return Ok(network);
        }

        let super_network = self.private_super_network(&partition.id).await?;
        let length = if partition.private_network_prefix_length == 0 {
            self.private_network_prefix_length
        } else {
            partition.private_network_prefix_length
        };
        let mut errors = None;
        let mut child = None;
        for prefix in &super_network.prefixes {
            match self.ipam.allocate_child_prefix(prefix, length).await {
                Ok(prefix) => {
                    child = Some(prefix);
                    break;
                }
                Err(err) => errors = Some(merge_error(errors, err)),
            }
        }
        let Some(child) = child else {
            return Err(errors
                .unwrap_or_else(|| {
                    make_err!(
                        Code::FailedPrecondition,
                        "Network {} has no prefixes",
                        super_network.id
                    )
                })
                .append(format!("Creating project network {id}")));
        };

        let vrf = match self.vrf_pool.acquire_random_unique_integer().await {
            Ok(vrf) => vrf,
            Err(err) => {
                self.release_child_prefix(&child).await;
                return Err(err).err_tip(|| format!("Acquiring vrf of project network {id}"));
            }
        };
        let network = Network {
            id: id.clone(),
            name: project_id.to_string(),
            partition_id: partition.id.clone(),
            project_id: Some(project_id.to_string()),
            prefixes: vec![child.clone()],
            destination_prefixes: Vec::new(),
            parent_network_id: Some(super_network.id.clone()),
            vrf: Some(vrf),
            private_super: false,
            underlay: false,
            nat: super_network.nat,
            shared: false,
            version: 0,
        };
        match self.datastore.networks.create(network).await {
            Ok(network) => {
                event!(
                    Level::INFO,
                    network_id = %network.id,
                    prefix = %child,
                    vrf,
                    "Created project network"
                );
                acquired.project_network = Some(network.clone());
                Ok(network)
            }
            // Another allocation of the same project won.
            Err(err) if err.code == Code::AlreadyExists => {
                self.release_child_prefix(&child).await;
                self.release_integer(&self.vrf_pool, vrf).await;
                self.datastore.networks.get(&id).await
            }
            Err(err) => {
                self.release_child_prefix(&child).await;
                self.release_integer(&self.vrf_pool, vrf).await;
                Err(err)
            }
        }
    }

    /// Resolves the networks of `request` into the networks to attach and
    /// whether each of them is the private one.
    async fn resolve_networks(
        &self,
        request: &AllocationRequest,
        partition: &Partition,
        acquired: &mut Acquired,
    ) -> Result<Vec<(Network, Vec<String>, bool)>, Error> {
        let mut resolved = Vec::with_capacity(request.networks.len() + 1);
        for requested in &request.networks {
            let network = self
                .datastore
                .networks
                .get(&requested.network_id)
                .await
                .err_tip(|| "Resolving networks of allocation")?;
            if network.private_super {
                let project_network = self
                    .resolve_project_network(partition, &request.project_id, acquired)
                    .await?;
                resolved.push((project_network, requested.ips.clone(), true));
                continue;
            }
            match &network.project_id {
                Some(owner) if *owner != request.project_id => {
                    return Err(make_err!(
                        Code::PermissionDenied,
                        "Network {} belongs to project {owner}",
                        network.id
                    ));
                }
                Some(_) if !network.shared && !network.underlay => {
                    resolved.push((network, requested.ips.clone(), true));
                }
                _ => resolved.push((network, requested.ips.clone(), false)),
            }
        }

        let private_count = resolved.iter().filter(|(_, _, private)| *private).count();
        error_if!(
            private_count > 1,
            "Allocation requests {private_count} private networks, only one is allowed"
        );
        if private_count == 0 {
            let project_network = self
                .resolve_project_network(partition, &request.project_id, acquired)
                .await?;
            resolved.insert(0, (project_network, Vec::new(), true));
        }
        // The private network goes first.
        resolved.sort_by_key(|(_, _, private)| !*private);
        Ok(resolved)
    }

    /// Attaches `address` to the machine. A static address of the project
    /// may be shared, every other taken address is an error.
    async fn attach_specific_ip(
        &self,
        machine_id: &str,
        network: &Network,
        project_id: &str,
        address: &str,
        acquired: &mut Acquired,
    ) -> Result<(), Error> {
        if let Some(ip) = self.datastore.ips.find(address).await? {
            if ip.ip_type != IpType::Static || ip.project_id != project_id {
                return Err(make_err!(Code::AlreadyExists, "Ip {address} is already in use"));
            }
            update_with_retry(
                self.datastore.ips.as_ref(),
                address,
                MAX_RECORD_UPDATE_ATTEMPTS,
                |ip| Ok(ip.machine_ids.insert(machine_id.to_string())),
            )
            .await?;
            acquired.attached_ips.push(address.to_string());
            return Ok(());
        }

        let mut errors = None;
        for prefix in &network.prefixes {
            match self.ipam.allocate_specific_ip(prefix, address).await {
                Ok(address) => {
                    return self
                        .create_ip_record(machine_id, network, project_id, address, acquired)
                        .await;
                }
                Err(err) => errors = Some(merge_error(errors, err)),
            }
        }
        Err(errors
            .unwrap_or_else(|| make_input_err!("Network {} has no prefixes", network.id))
            .append(format!("Allocating ip {address} in network {}", network.id)))
    }

    async fn allocate_ip(
        &self,
        machine_id: &str,
        network: &Network,
        project_id: &str,
        acquired: &mut Acquired,
    ) -> Result<String, Error> {
        let mut errors = None;
        for prefix in &network.prefixes {
            match self.ipam.allocate_ip(prefix).await {
                Ok(address) => {
                    self.create_ip_record(
                        machine_id,
                        network,
                        project_id,
                        address.clone(),
                        acquired,
                    )
                    .await?;
                    return Ok(address);
                }
                Err(err) => errors = Some(merge_error(errors, err)),
            }
        }
        Err(errors
            .unwrap_or_else(|| make_input_err!("Network {} has no prefixes", network.id))
            .append(format!("Allocating ip in network {}", network.id)))
    }

    async fn create_ip_record(
        &self,
        machine_id: &str,
        network: &Network,
        project_id: &str,
        address: String,
        acquired: &mut Acquired,
    ) -> Result<(), Error> {
        let ip = Ip {
            address: address.clone(),
            name: String::new(),
            network_id: network.id.clone(),
            project_id: project_id.to_string(),
            ip_type: IpType::Ephemeral,
            machine_ids: [machine_id.to_string()].into(),
            version: 0,
        };
        if let Err(err) = self.datastore.ips.create(ip).await {
            self.release_ipam_address(&address).await;
            return Err(err).err_tip(|| format!("Creating ip record {address}"));
        }
        acquired.created_ips.push(address);
        Ok(())
    }

    async fn attach(
        &self,
        request: &AllocationRequest,
        claimed: &Machine,
        acquired: &mut Acquired,
    ) -> Result<Machine, Error> {
        let claimed_allocation = claimed.allocation()?.clone();
        let partition = self
            .datastore
            .partitions
            .get(&claimed.partition_id)
            .await
            .err_tip(|| format!("Resolving partition of machine {}", claimed.id))?;

        let mut machine_networks = Vec::new();
        for (network, ips, private) in self.resolve_networks(request, &partition, acquired).await? {
            let mut addresses = Vec::new();
            if ips.is_empty() {
                addresses.push(
                    self.allocate_ip(&claimed.id, &network, &request.project_id, acquired)
                        .await?,
                );
            }
            for address in ips {
                self.attach_specific_ip(
                    &claimed.id,
                    &network,
                    &request.project_id,
                    &address,
                    acquired,
                )
                .await?;
                addresses.push(address);
            }
            machine_networks.push(MachineNetwork {
                network_id: network.id.clone(),
                prefixes: network.prefixes.clone(),
                destination_prefixes: network.destination_prefixes.clone(),
                ips: addresses,
                vrf: network.vrf.unwrap_or(0),
                asn: 0,
                private,
                nat: network.nat,
                underlay: network.underlay,
                shared: network.shared,
            });
        }

        let asn_value = self
            .asn_pool
            .acquire_random_unique_integer()
            .await
            .err_tip(|| format!("Acquiring asn of machine {}", claimed.id))?;
        acquired.asn_value = Some(asn_value);
        let asn = self
            .asn_base
            .checked_add(asn_value)
            .filter(|asn| *asn <= self.asn_max)
            .ok_or_else(|| {
                make_err!(
                    Code::Internal,
                    "Asn {} + {asn_value} exceeds the maximum asn {}",
                    self.asn_base,
                    self.asn_max
                )
            })?;
        for network in &mut machine_networks {
            network.asn = asn;
        }

        let private_vrf = machine_networks
            .iter()
            .find(|network| network.private)
            .map_or(0, |network| network.vrf);
        let mut allocation = claimed_allocation.clone();
        allocation.machine_networks = machine_networks;

        // Switch filters are computed from the stored allocations of every
        // machine on a port, so the networks must be visible first.
        let tags = request.tags.clone();
        let stored = update_with_retry(
            self.datastore.machines.as_ref(),
            &claimed.id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |existing| {
                if existing.allocation.as_ref() != Some(&claimed_allocation) {
                    return Err(make_err!(
                        Code::Aborted,
                        "Allocation of machine {} changed concurrently",
                        existing.id
                    ));
                }
                existing.allocation = Some(allocation.clone());
                existing.tags.clone_from(&tags);
                Ok(true)
            },
        )
        .await?;
        acquired.persisted_allocation = Some(allocation);

        acquired.switches_touched = true;
        let switches = self
            .switches
            .set_vrf_at_switches(&stored, &vrf_name(private_vrf))
            .await?;
        publish_event(
            self.publisher.as_ref(),
            SWITCH_TOPIC,
            &SwitchEvent {
                r#type: EventType::Update,
                machine: stored.clone(),
                switches,
            },
        )
        .await?;

        if let Err(err) = publish_event(
            self.publisher.as_ref(),
            MACHINE_TOPIC,
            &MachineEvent {
                r#type: EventType::Update,
                old: Some(claimed.clone()),
                new: Some(stored.clone()),
            },
        )
        .await
        {
            event!(Level::WARN, machine_id = %stored.id, ?err, "Could not publish machine event");
        }
        event!(
            Level::INFO,
            machine_id = %stored.id,
            project_id = %request.project_id,
            asn,
            vrf = private_vrf,
            "Allocated machine"
        );
        Ok(stored)
    }

    async fn release_ipam_address(&self, address: &str) {
        match self.ipam.release_ip(address).await {
            Ok(()) => {}
            Err(err) if err.code == Code::NotFound => {}
            Err(err) => event!(Level::ERROR, address, ?err, "Could not release ip"),
        }
    }

    async fn release_child_prefix(&self, prefix: &str) {
        if let Err(err) = self.ipam.release_child_prefix(prefix).await {
            event!(Level::ERROR, prefix, ?err, "Could not release child prefix");
        }
    }

    async fn release_integer(&self, pool: &IntegerPool, value: u32) {
        if let Err(err) = pool.release_unique_integer(value).await {
            event!(Level::ERROR, pool = %pool.name(), value, ?err, "Could not release integer");
        }
    }

    /// Undoes a failed allocation in reverse order of acquisition. Failures
    /// are logged, the original error is what the caller sees.
    async fn rollback(&self, claimed: &Machine, acquired: Acquired) {
        if acquired.switches_touched {
            if let Err(err) = self.switches.set_vrf_at_switches(claimed, "").await {
                event!(Level::ERROR, machine_id = %claimed.id, ?err, "Could not reset switches");
            }
        }
        if let Some(asn_value) = acquired.asn_value {
            self.release_integer(&self.asn_pool, asn_value).await;
        }
        for address in acquired.attached_ips.iter().rev() {
            let result = update_with_retry(
                self.datastore.ips.as_ref(),
                address,
                MAX_RECORD_UPDATE_ATTEMPTS,
                |ip| Ok(ip.machine_ids.remove(&claimed.id)),
            )
            .await;
            if let Err(err) = result {
                event!(Level::ERROR, address = %address, ?err, "Could not detach ip");
            }
        }
        for address in acquired.created_ips.iter().rev() {
            match self.datastore.ips.find(address).await {
                Ok(Some(ip)) => {
                    if let Err(err) = self.datastore.ips.delete(&ip).await {
                        event!(
                            Level::ERROR,
                            address = %address,
                            ?err,
                            "Could not delete ip record"
                        );
                        continue;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    event!(Level::ERROR, address = %address, ?err, "Could not read ip record");
                    continue;
                }
            }
            self.release_ipam_address(address).await;
        }
        if let Some(network) = acquired.project_network {
            self.rollback_project_network(&claimed.id, network).await;
        }

        let claimed_allocation = claimed.allocation.clone();
        let persisted_allocation = acquired.persisted_allocation;
        let result = update_with_retry(
            self.datastore.machines.as_ref(),
            &claimed.id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |machine| {
                let ours = machine.allocation == claimed_allocation
                    || (persisted_allocation.is_some()
                        && machine.allocation == persisted_allocation);
                if !ours {
                    return Ok(false);
                }
                machine.allocation = None;
                Ok(true)
            },
        )
        .await;
        if let Err(err) = result {
            event!(Level::ERROR, machine_id = %claimed.id, ?err, "Could not clear claim");
        }
    }

    /// Whether anything besides the allocation of `machine_id` holds
    /// `network`. Pending claims of the owning project count too, they
    /// resolve to the same project network.
    async fn project_network_in_use(
        &self,
        machine_id: &str,
        network: &Network,
    ) -> Result<bool, Error> {
        let ips = self.datastore.ips.list().await?;
        if ips.iter().any(|ip| ip.network_id == network.id) {
            return Ok(true);
        }
        let machines = self.datastore.machines.list().await?;
        Ok(machines
            .iter()
            .filter(|machine| machine.id != machine_id)
            .any(|machine| {
                let Some(allocation) = &machine.allocation else {
                    return false;
                };
                if allocation.machine_networks.is_empty() {
                    machine.partition_id == network.partition_id
                        && network.project_id.as_deref() == Some(allocation.project_id.as_str())
                } else {
                    allocation
                        .machine_networks
                        .iter()
                        .any(|nw| nw.network_id == network.id)
                }
            }))
    }

    /// Deletes a project network created by a failed allocation, unless
    /// another allocation started using it in the meantime.
    async fn rollback_project_network(&self, machine_id: &str, network: Network) {
        let in_use = match self.project_network_in_use(machine_id, &network).await {
            Ok(in_use) => in_use,
            Err(err) => {
                event!(
                    Level::ERROR,
                    network_id = %network.id,
                    ?err,
                    "Could not check usage of project network"
                );
                return;
            }
        };
        if in_use {
            return;
        }
        if let Err(err) = self.datastore.networks.delete(&network).await {
            event!(
                Level::ERROR,
                network_id = %network.id,
                ?err,
                "Could not delete project network"
            );
            return;
        }
        for prefix in &network.prefixes {
            self.release_child_prefix(prefix).await;
        }
        if let Some(vrf) = network.vrf {
            self.release_integer(&self.vrf_pool, vrf).await;
        }
    }

    /// Returns `machine_id` to the pool. The machine record is released
    /// before returning, its networks and ips are released asynchronously.
    pub async fn free(&self, machine_id: &str) -> Result<Machine, Error> {
        let machine = self.datastore.machines.get(machine_id).await?;
        if machine.state.value == MachineStateValue::Locked {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Machine {machine_id} is locked: {}",
                machine.state.description
            ));
        }

        let mut released = None;
        let freed = update_with_retry(
            self.datastore.machines.as_ref(),
            machine_id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |machine| {
                if machine.state.value == MachineStateValue::Locked {
                    return Err(make_err!(
                        Code::FailedPrecondition,
                        "Machine {} is locked: {}",
                        machine.id,
                        machine.state.description
                    ));
                }
                released = machine.allocation.take();
                if released.is_none() {
                    return Ok(false);
                }
                machine.tags.clear();
                Ok(true)
            },
        )
        .await?;
        let Some(allocation) = released else {
            return Ok(freed);
        };

        let mut result: Result<(), Error> = Ok(());
        match self.switches.set_vrf_at_switches(&freed, "").await {
            Ok(switches) => {
                let published = publish_event(
                    self.publisher.as_ref(),
                    SWITCH_TOPIC,
                    &SwitchEvent {
                        r#type: EventType::Update,
                        machine: freed.clone(),
                        switches,
                    },
                )
                .await;
                result = result.merge(published);
            }
            Err(err) => result = result.merge(Err(err)),
        }

        let mut old = freed.clone();
        old.allocation = Some(allocation.clone());
        let published = publish_event(
            self.publisher.as_ref(),
            MACHINE_TOPIC,
            &MachineEvent {
                r#type: EventType::Delete,
                old: Some(old),
                new: None,
            },
        )
        .await;
        result = result.merge(published);

        let enqueued = self
            .release_queues
            .machine_networks
            .enqueue(ReleaseMachineNetworksJob {
                machine_id: machine_id.to_string(),
                allocation,
            });
        result = result.merge(enqueued);

        event!(Level::INFO, machine_id, "Freed machine");
        result.err_tip(|| format!("Freeing machine {machine_id}"))?;
        Ok(freed)
    }

    /// Marks the allocation of `machine_id` as installed.
    pub async fn finalize_allocation(
        &self,
        machine_id: &str,
        console_password: &str,
    ) -> Result<Machine, Error> {
        update_with_retry(
            self.datastore.machines.as_ref(),
            machine_id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |machine| {
                let id = machine.id.clone();
                let allocation = machine.allocation.as_mut().ok_or_else(|| {
                    make_err!(Code::FailedPrecondition, "Machine {id} is not allocated")
                })?;
                allocation.succeeded = true;
                allocation.console_password = console_password.to_string();
                Ok(true)
            },
        )
        .await
    }

    pub async fn set_machine_state(
        &self,
        machine_id: &str,
        value: MachineStateValue,
        description: &str,
    ) -> Result<Machine, Error> {
        error_if!(
            value != MachineStateValue::Available && description.is_empty(),
            "A description is required to set machine {machine_id} to {value:?}"
        );
        let state = MachineState {
            value,
            description: description.to_string(),
        };
        update_with_retry(
            self.datastore.machines.as_ref(),
            machine_id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |machine| {
                if machine.state == state {
                    return Ok(false);
                }
                machine.state = state.clone();
                Ok(true)
            },
        )
        .await
    }

    /// Waits for `machine_id` to be allocated, bounded by the configured
    /// timeout.
    pub async fn wait_for_allocation(&self, machine_id: &str) -> Result<MachineAllocation, Error> {
        self.waiter
            .wait(machine_id, self.wait_for_allocation_timeout, || async {
                let machine = self.datastore.machines.get(machine_id).await?;
                Ok::<_, Error>(machine.allocation)
            })
            .await
    }

    /// IPAM usage of every prefix of `network_id`.
    pub async fn prefix_usage(
        &self,
        network_id: &str,
    ) -> Result<Vec<(String, PrefixUsage)>, Error> {
        let network = self.datastore.networks.get(network_id).await?;
        let mut usage = Vec::with_capacity(network.prefixes.len());
        for prefix in network.prefixes {
            let prefix_usage = self.ipam.prefix_usage(&prefix).await?;
            usage.push((prefix, prefix_usage));
        }
        Ok(usage)
    }
}
