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

use metalplane_store::integer_pool::IntegerPoolRecord;
use metalplane_store::memory_store::MemoryRecordStore;
use metalplane_util::catalog::{Image, Partition, Size};
use metalplane_util::machine::Machine;
use metalplane_util::network::{Ip, Network};
use metalplane_util::provisioning::ProvisioningEventContainer;
use metalplane_util::store_trait::RecordStore;
use metalplane_util::switch::Switch;

/// One table per entity kind.
#[derive(Clone)]
pub struct DataStore {
    pub machines: Arc<dyn RecordStore<Machine>>,
    pub networks: Arc<dyn RecordStore<Network>>,
    pub ips: Arc<dyn RecordStore<Ip>>,
    pub switches: Arc<dyn RecordStore<Switch>>,
    pub provisioning_events: Arc<dyn RecordStore<ProvisioningEventContainer>>,
    pub integer_pools: Arc<dyn RecordStore<IntegerPoolRecord>>,
    pub partitions: Arc<dyn RecordStore<Partition>>,
    pub sizes: Arc<dyn RecordStore<Size>>,
    pub images: Arc<dyn RecordStore<Image>>,
}

impl core::fmt::Debug for DataStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DataStore").finish_non_exhaustive()
    }
}

impl DataStore {
    pub fn new_in_memory() -> Self {
        Self {
            machines: Arc::new(MemoryRecordStore::<Machine>::new()),
            networks: Arc::new(MemoryRecordStore::<Network>::new()),
            ips: Arc::new(MemoryRecordStore::<Ip>::new()),
            switches: Arc::new(MemoryRecordStore::<Switch>::new()),
            provisioning_events: Arc::new(MemoryRecordStore::<ProvisioningEventContainer>::new()),
            integer_pools: Arc::new(MemoryRecordStore::<IntegerPoolRecord>::new()),
            partitions: Arc::new(MemoryRecordStore::<Partition>::new()),
            sizes: Arc::new(MemoryRecordStore::<Size>::new()),
            images: Arc::new(MemoryRecordStore::<Image>::new()),
        }
    }
}
