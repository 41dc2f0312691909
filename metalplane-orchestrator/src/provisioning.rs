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
use std::sync::{Arc, Weak};

use metalplane_config::control_plane::LivelinessConfig;
use metalplane_error::{Code, Error, ResultExt};
use metalplane_util::machine::{Machine, MachineLiveliness};
use metalplane_util::provisioning::{
    ProvisioningEvent, ProvisioningEventContainer, ProvisioningEventType,
};
use metalplane_util::spawn;
use metalplane_util::store_trait::update_with_retry;
use metalplane_util::task::JoinHandleDropGuard;
use tracing::{Level, event};

use crate::datastore::DataStore;
use crate::{MAX_RECORD_UPDATE_ATTEMPTS, NowFn};

/// Default age of the last event up to which a machine counts as alive.
pub const DEFAULT_ALIVE_THRESHOLD_S: u64 = 300;

/// Default age of the last event after which a machine counts as dead.
pub const DEFAULT_DEAD_THRESHOLD_S: u64 = 3600;

/// Default interval of the full fleet liveliness sweep.
pub const DEFAULT_SWEEP_INTERVAL_S: u64 = 60;

/// Default number of events kept per machine.
pub const DEFAULT_EVENT_RETENTION_LIMIT: usize = 20;

/// Outcome of one liveliness sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivelinessReport {
    pub alive: usize,
    pub dead: usize,
    pub unknown: usize,
    /// Machines whose liveliness could not be persisted.
    pub errors: usize,
}

/// Ingests provisioning events and derives machine liveliness from them.
#[derive(Debug)]
pub struct ProvisioningTracker {
    datastore: DataStore,
    alive_threshold: Duration,
    dead_threshold: Duration,
    sweep_interval: Duration,
    retention_limit: usize,
    now_fn: NowFn,
}

impl ProvisioningTracker {
    pub fn new(config: &LivelinessConfig, datastore: DataStore, now_fn: NowFn) -> Self {
        let mut alive_threshold_s = config.alive_threshold_s;
        if alive_threshold_s == 0 {
            alive_threshold_s = DEFAULT_ALIVE_THRESHOLD_S;
        }
        let mut dead_threshold_s = config.dead_threshold_s;
        if dead_threshold_s == 0 {
            dead_threshold_s = DEFAULT_DEAD_THRESHOLD_S;
        }
        let mut sweep_interval_s = config.sweep_interval_s;
        if sweep_interval_s == 0 {
            sweep_interval_s = DEFAULT_SWEEP_INTERVAL_S;
        }
        let mut retention_limit = config.event_retention_limit;
        if retention_limit == 0 {
            retention_limit = DEFAULT_EVENT_RETENTION_LIMIT;
        }
        Self {
            datastore,
            alive_threshold: Duration::from_secs(alive_threshold_s),
            dead_threshold: Duration::from_secs(dead_threshold_s.max(alive_threshold_s)),
            sweep_interval: Duration::from_secs(sweep_interval_s),
            retention_limit,
            now_fn,
        }
    }

    /// Records `event` for `machine_id`. A machine that is not known yet is
    /// created as a bare record first.
    pub async fn add_provisioning_event(
        &self,
        machine_id: &str,
        event: &str,
        message: &str,
    ) -> Result<ProvisioningEventContainer, Error> {
        let event_type = event
            .parse::<ProvisioningEventType>()
            .err_tip(|| format!("In add_provisioning_event for machine {machine_id}"))?;
        self.ensure_machine(machine_id).await?;
        self.ensure_container(machine_id).await?;

        let now = (self.now_fn)();
        let retention_limit = self.retention_limit;
        let container = update_with_retry(
            self.datastore.provisioning_events.as_ref(),
            machine_id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |container| {
                // Out of order delivery never moves the last event time back.
                container.last_event_time = Some(
                    container
                        .last_event_time
                        .map_or(now, |last| last.max(now)),
                );
                container.liveliness = MachineLiveliness::Alive;
                let repeated_phone_home = event_type == ProvisioningEventType::PhonedHome
                    && container
                        .events
                        .first()
                        .is_some_and(|last| last.event == ProvisioningEventType::PhonedHome);
                if event_type != ProvisioningEventType::Alive && !repeated_phone_home {
                    container.events.insert(
                        0,
                        ProvisioningEvent {
                            time: now,
                            event: event_type,
                            message: message.to_string(),
                        },
                    );
                    container.events.truncate(retention_limit);
                }
                container.incomplete_provisioning_cycles = container.count_incomplete_cycles();
                Ok(true)
            },
        )
        .await?;

        update_with_retry(
            self.datastore.machines.as_ref(),
            machine_id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |machine| {
                if machine.liveliness == MachineLiveliness::Alive {
                    return Ok(false);
                }
                machine.liveliness = MachineLiveliness::Alive;
                Ok(true)
            },
        )
        .await
        .err_tip(|| format!("Updating liveliness of machine {machine_id}"))?;

        event!(
            Level::DEBUG,
            machine_id,
            event = %event_type,
            incomplete_cycles = container.incomplete_provisioning_cycles,
            "Added provisioning event"
        );
        Ok(container)
    }

    async fn ensure_machine(&self, machine_id: &str) -> Result<(), Error> {
        if self.datastore.machines.find(machine_id).await?.is_some() {
            return Ok(());
        }
        match self.datastore.machines.create(Machine::bare(machine_id)).await {
            Ok(_) => {
                event!(Level::INFO, machine_id, "Created bare machine for unregistered machine");
                Ok(())
            }
            // Registered concurrently.
            Err(err) if err.code == Code::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn ensure_container(&self, machine_id: &str) -> Result<(), Error> {
        if self.datastore.provisioning_events.find(machine_id).await?.is_some() {
            return Ok(());
        }
        match self
            .datastore
            .provisioning_events
            .create(ProvisioningEventContainer::new(machine_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.code == Code::AlreadyExists => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn provisioning_events(
        &self,
        machine_id: &str,
    ) -> Result<ProvisioningEventContainer, Error> {
        self.datastore.provisioning_events.get(machine_id).await
    }

    /// Classifies a machine by the age of its last event. Machines that never
    /// reported are unknown. Allocated machines are never declared dead, they
    /// stop sending provisioning events once installed.
    pub fn evaluate_liveliness(
        &self,
        container: Option<&ProvisioningEventContainer>,
        allocated: bool,
    ) -> MachineLiveliness {
        let Some(last_event_time) = container.and_then(|c| c.last_event_time) else {
            return MachineLiveliness::Unknown;
        };
        let age = (self.now_fn)()
            .duration_since(last_event_time)
            .unwrap_or(Duration::ZERO);
        if age < self.alive_threshold {
            MachineLiveliness::Alive
        } else if age > self.dead_threshold && !allocated {
            MachineLiveliness::Dead
        } else {
            MachineLiveliness::Unknown
        }
    }

    /// Re-evaluates the liveliness of `machine_id` and persists it. Only the
    /// liveliness fields are written.
    pub async fn refresh_liveliness(&self, machine_id: &str) -> Result<MachineLiveliness, Error> {
        let container = self.datastore.provisioning_events.find(machine_id).await?;
        let mut liveliness = MachineLiveliness::Unknown;
        update_with_retry(
            self.datastore.machines.as_ref(),
            machine_id,
            MAX_RECORD_UPDATE_ATTEMPTS,
            |machine| {
                liveliness = self.evaluate_liveliness(container.as_ref(), machine.is_allocated());
                if machine.liveliness == liveliness {
                    return Ok(false);
                }
                machine.liveliness = liveliness;
                Ok(true)
            },
        )
        .await?;
        if container.is_some_and(|c| c.liveliness != liveliness) {
            update_with_retry(
                self.datastore.provisioning_events.as_ref(),
                machine_id,
                MAX_RECORD_UPDATE_ATTEMPTS,
                |container| {
                    container.liveliness = liveliness;
                    Ok(true)
                },
            )
            .await?;
        }
        Ok(liveliness)
    }

    /// Re-evaluates every machine.
    pub async fn sweep(&self) -> Result<LivelinessReport, Error> {
        let mut report = LivelinessReport::default();
        for machine in self.datastore.machines.list().await? {
            match self.refresh_liveliness(&machine.id).await {
                Ok(MachineLiveliness::Alive) => report.alive += 1,
                Ok(MachineLiveliness::Dead) => report.dead += 1,
                Ok(MachineLiveliness::Unknown) => report.unknown += 1,
                Err(err) => {
                    event!(
                        Level::WARN,
                        machine_id = %machine.id,
                        ?err,
                        "Could not update machine liveliness"
                    );
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Runs `sweep` every sweep interval until the tracker is dropped.
    pub fn spawn_liveliness_sweep(self: &Arc<Self>) -> JoinHandleDropGuard<()> {
        let weak_self: Weak<Self> = Arc::downgrade(self);
        let interval = self.sweep_interval;
        spawn!("liveliness_sweep", async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(tracker) = weak_self.upgrade() else {
                    return;
                };
                match tracker.sweep().await {
                    Ok(report) => event!(
                        Level::INFO,
                        alive = report.alive,
                        dead = report.dead,
                        unknown = report.unknown,
                        errors = report.errors,
                        "Liveliness sweep finished"
                    ),
                    Err(err) => event!(Level::ERROR, ?err, "Liveliness sweep failed"),
                }
            }
        })
    }
}
