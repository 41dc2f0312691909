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

use async_trait::async_trait;
use metalplane_config::control_plane::{ReleaseConfig, Retry};
use metalplane_error::{Code, Error, ResultExt};
use metalplane_store::integer_pool::IntegerPool;
use metalplane_store::ipam::Ipam;
use metalplane_util::job_queue::{JobHandler, JobQueue};
use metalplane_util::machine::MachineAllocation;
use metalplane_util::network::IpType;
use metalplane_util::retry::Retrier;
use metalplane_util::store_trait::update_with_retry;
use metalplane_util::task::JoinHandleDropGuard;
use tracing::{Level, event};

use crate::MAX_RECORD_UPDATE_ATTEMPTS;
use crate::datastore::DataStore;

pub const DEFAULT_RELEASE_WORKERS: usize = 4;

pub const DEFAULT_RELEASE_MAX_RETRIES: usize = 5;

pub const DEFAULT_RELEASE_RETRY_DELAY: f32 = 0.1;

pub const DEFAULT_RELEASE_RETRY_JITTER: f32 = 0.5;

/// Detaches a freed machine from its IP addresses and returns its ASN.
#[derive(Debug, Clone)]
pub struct ReleaseMachineNetworksJob {
    pub machine_id: String,
    pub allocation: MachineAllocation,
}

/// Returns an IP address that no machine references any more to IPAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseIpJob {
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct ReleaseQueues {
    pub machine_networks: JobQueue<ReleaseMachineNetworksJob>,
    pub ips: JobQueue<ReleaseIpJob>,
}

impl Default for ReleaseQueues {
    fn default() -> Self {
        Self {
            machine_networks: JobQueue::new("release_machine_networks"),
            ips: JobQueue::new("release_ip"),
        }
    }
}

impl ReleaseQueues {
    pub fn pending(&self) -> usize {
        self.machine_networks.pending() + self.ips.pending()
    }

    pub async fn wait_for_idle(&self) {
        // Machine network jobs enqueue ip jobs, so the order matters.
        self.machine_networks.wait_for_idle().await;
        self.ips.wait_for_idle().await;
    }
}

/// Retry policy of release jobs with unset values replaced by defaults.
pub fn release_retry(config: &ReleaseConfig) -> Retry {
    let mut retry = config.retry.clone();
    if retry.max_retries == 0 {
        retry.max_retries = DEFAULT_RELEASE_MAX_RETRIES;
    }
    if retry.delay == 0. {
        retry.delay = DEFAULT_RELEASE_RETRY_DELAY;
    }
    if retry.jitter == 0. {
        retry.jitter = DEFAULT_RELEASE_RETRY_JITTER;
    }
    retry
}

/// Consumer of both release queues.
pub struct ReleaseActor {
    datastore: DataStore,
    ipam: Arc<dyn Ipam>,
    asn_pool: IntegerPool,
    asn_base: u32,
    queues: ReleaseQueues,
}

impl core::fmt::Debug for ReleaseActor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReleaseActor")
            .field("asn_pool", &self.asn_pool)
            .field("asn_base", &self.asn_base)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl ReleaseActor {
    pub const fn new(
        datastore: DataStore,
        ipam: Arc<dyn Ipam>,
        asn_pool: IntegerPool,
        asn_base: u32,
        queues: ReleaseQueues,
    ) -> Self {
        Self {
            datastore,
            ipam,
            asn_pool,
            asn_base,
            queues,
        }
    }

    pub const fn queues(&self) -> &ReleaseQueues {
        &self.queues
    }

    /// Starts the workers of both queues.
    pub fn spawn_workers(self: &Arc<Self>, config: &ReleaseConfig) -> Vec<JoinHandleDropGuard<()>> {
        let workers = if config.workers == 0 {
            DEFAULT_RELEASE_WORKERS
        } else {
            config.workers
        };
        let retrier = Retrier::with_tokio_sleep(release_retry(config));
        let mut guards = self.queues.machine_networks.spawn_workers(
            workers,
            retrier.clone(),
            self.clone() as Arc<dyn JobHandler<ReleaseMachineNetworksJob>>,
        );
        guards.extend(self.queues.ips.spawn_workers(
            workers,
            retrier,
            self.clone() as Arc<dyn JobHandler<ReleaseIpJob>>,
        ));
        guards
    }

    /// Runs all queued release jobs on the calling task, including the ones
    /// they enqueue. Returns how many jobs ran.
    pub async fn drain(&self, retrier: &Retrier) -> usize {
        let mut ran = self.queues.machine_networks.drain(retrier, self).await;
        ran += self.queues.ips.drain(retrier, self).await;
        ran
    }

    async fn detach_ip(&self, machine_id: &str, address: &str) -> Result<(), Error> {
        let result = update_with_retry(
            self.datastore.ips.as_ref(),
            address,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |ip| Ok(ip.machine_ids.remove(machine_id)),
        )
        .await;
        let ip = match result {
            Ok(ip) => ip,
            // Released by an earlier run of this job.
            Err(err) if err.code == Code::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        if ip.ip_type == IpType::Static {
            event!(Level::DEBUG, address, "Keeping static ip");
            return Ok(());
        }
        if ip.machine_ids.is_empty() {
            self.queues.ips.enqueue(ReleaseIpJob {
                address: address.to_string(),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler<ReleaseMachineNetworksJob> for ReleaseActor {
    async fn handle(&self, job: &ReleaseMachineNetworksJob) -> Result<(), Error> {
        for network in &job.allocation.machine_networks {
            for address in &network.ips {
                self.detach_ip(&job.machine_id, address)
                    .await
                    .err_tip(|| format!("Detaching ip {address} from machine {}", job.machine_id))?;
            }
        }

        let asn = job
            .allocation
            .private_network()
            .or_else(|| job.allocation.machine_networks.first())
            .map_or(0, |network| network.asn);
        if asn >= self.asn_base && asn != 0 {
            self.asn_pool
                .release_unique_integer(asn - self.asn_base)
                .await
                .err_tip(|| format!("Releasing asn {asn} of machine {}", job.machine_id))?;
        }
        event!(
            Level::INFO,
            machine_id = %job.machine_id,
            asn,
            "Released machine networks"
        );
        Ok(())
    }
}

#[async_trait]
impl JobHandler<ReleaseIpJob> for ReleaseActor {
    async fn handle(&self, job: &ReleaseIpJob) -> Result<(), Error> {
        let Some(ip) = self.datastore.ips.find(&job.address).await? else {
            return Ok(());
        };
        // Re-attached or pinned since the job was enqueued.
        if !ip.machine_ids.is_empty() || ip.ip_type == IpType::Static {
            return Ok(());
        }
        // A conflict means the record changed under us; the retry re-reads it.
        self.datastore
            .ips
            .delete(&ip)
            .await
            .err_tip(|| format!("Deleting ip record {}", job.address))?;
        match self.ipam.release_ip(&job.address).await {
            Ok(()) => {}
            Err(err) if err.code == Code::NotFound => {}
            Err(err) => {
                // The address is still held in IPAM, so nobody can have
                // re-created the record. Put it back for the retry to find.
                let mut unreleased = ip;
                unreleased.version = 0;
                let err = err.append(format!("Releasing ip {}", job.address));
                return match self.datastore.ips.create(unreleased).await {
                    Ok(_) => Err(err),
                    Err(restore_err) => Err(err.merge(
                        restore_err.append(format!("Restoring ip record {}", job.address)),
                    )),
                };
            }
        }
        event!(Level::INFO, address = %job.address, "Released ip");
        Ok(())
    }
}
