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

use std::collections::BTreeSet;
use std::sync::Arc;

use metalplane_config::control_plane::IntegerPoolConfig;
use metalplane_error::{Code, Error, ResultExt, error_if, make_err, make_input_err};
use metalplane_util::store_trait::{Record, RecordStore, update_with_retry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{Level, event};

/// Default range of a pool whose configuration is left empty.
pub const DEFAULT_POOL_MIN: u32 = 1;
pub const DEFAULT_POOL_MAX: u32 = 131_072;

/// Read-modify-write attempts per pool operation before a conflict is
/// surfaced to the caller.
const MAX_UPDATE_ATTEMPTS: usize = 32;

/// Persisted state of one pool: a single row holding the used integers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IntegerPoolRecord {
    pub name: String,
    pub min: u32,
    /// Exclusive.
    pub max: u32,
    pub used: BTreeSet<u32>,
    pub version: u64,
}

impl IntegerPoolRecord {
    fn capacity(&self) -> u64 {
        u64::from(self.max - self.min)
    }
}

impl Record for IntegerPoolRecord {
    const KIND: &'static str = "integer pool";

    fn key(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Hands out unique integers from `[min, max)`. Every operation is a
/// versioned read-modify-write of the pool row, so several pools sharing a
/// store, or several processes sharing a persistent store, never hand out
/// the same value twice.
#[derive(Clone)]
pub struct IntegerPool {
    name: String,
    min: u32,
    max: u32,
    store: Arc<dyn RecordStore<IntegerPoolRecord>>,
}

impl core::fmt::Debug for IntegerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IntegerPool")
            .field("name", &self.name)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl IntegerPool {
    /// Opens the pool called `name`, creating its row on first use. A row
    /// that already exists keeps its used set.
    pub async fn new(
        name: &str,
        config: IntegerPoolConfig,
        store: Arc<dyn RecordStore<IntegerPoolRecord>>,
    ) -> Result<Self, Error> {
        let min = if config.min == 0 {
            DEFAULT_POOL_MIN
        } else {
            config.min
        };
        let max = if config.max == 0 {
            DEFAULT_POOL_MAX
        } else {
            config.max
        };
        error_if!(
            min >= max,
            "Integer pool {name} has an empty range [{min}, {max})"
        );
        let record = IntegerPoolRecord {
            name: name.to_string(),
            min,
            max,
            used: BTreeSet::new(),
            version: 0,
        };
        match store.create(record).await {
            Ok(_) => {}
            Err(err) if err.code == Code::AlreadyExists => {
                let existing = store.get(name).await?;
                error_if!(
                    existing.min != min || existing.max != max,
                    "Integer pool {name} exists with range [{}, {}), configured [{min}, {max})",
                    existing.min,
                    existing.max
                );
            }
            Err(err) => return Err(err).err_tip(|| format!("Creating integer pool {name}")),
        }
        Ok(Self {
            name: name.to_string(),
            min,
            max,
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn min(&self) -> u32 {
        self.min
    }

    pub const fn max(&self) -> u32 {
        self.max
    }

    fn check_range(&self, value: u32) -> Result<(), Error> {
        if value < self.min || value >= self.max {
            return Err(make_input_err!(
                "{value} is outside of integer pool {} range [{}, {})",
                self.name,
                self.min,
                self.max
            ));
        }
        Ok(())
    }

    /// Picks a pseudo random free integer and marks it used.
    pub async fn acquire_random_unique_integer(&self) -> Result<u32, Error> {
        let mut acquired = None;
        update_with_retry(
            self.store.as_ref(),
            &self.name,
            MAX_UPDATE_ATTEMPTS,
            |record| {
                if record.used.len() as u64 >= record.capacity() {
                    return Err(make_err!(
                        Code::ResourceExhausted,
                        "Integer pool {} is exhausted",
                        record.name
                    ));
                }
                let start = rand::rng().random_range(record.min..record.max);
                let value = (start..record.max)
                    .chain(record.min..start)
                    .find(|v| !record.used.contains(v))
                    .ok_or_else(|| {
                        make_err!(
                            Code::ResourceExhausted,
                            "Integer pool {} is exhausted",
                            record.name
                        )
                    })?;
                record.used.insert(value);
                acquired = Some(value);
                Ok(true)
            },
        )
        .await
        .err_tip(|| format!("In acquire_random_unique_integer of {}", self.name))?;
        let value = acquired.ok_or_else(|| {
            make_err!(
                Code::Internal,
                "Integer pool {} did not record the acquired value",
                self.name
            )
        })?;
        event!(Level::DEBUG, pool = %self.name, value, "Acquired integer");
        Ok(value)
    }

    /// Claims `value`. Fails with `Code::AlreadyExists` if it is taken.
    pub async fn acquire_unique_integer(&self, value: u32) -> Result<(), Error> {
        self.check_range(value)?;
        update_with_retry(
            self.store.as_ref(),
            &self.name,
            MAX_UPDATE_ATTEMPTS,
            |record| {
                if !record.used.insert(value) {
                    return Err(make_err!(
                        Code::AlreadyExists,
                        "{value} is already in use in integer pool {}",
                        record.name
                    ));
                }
                Ok(true)
            },
        )
        .await
        .err_tip(|| format!("In acquire_unique_integer of {}", self.name))?;
        Ok(())
    }

    /// Returns `value` to the pool. Releasing a free value does nothing.
    pub async fn release_unique_integer(&self, value: u32) -> Result<(), Error> {
        self.check_range(value)?;
        update_with_retry(
            self.store.as_ref(),
            &self.name,
            MAX_UPDATE_ATTEMPTS,
            |record| Ok(record.used.remove(&value)),
        )
        .await
        .err_tip(|| format!("In release_unique_integer of {}", self.name))?;
        event!(Level::DEBUG, pool = %self.name, value, "Released integer");
        Ok(())
    }

    /// Number of integers that can still be acquired.
    pub async fn available(&self) -> Result<u64, Error> {
        let record = self.store.get(&self.name).await?;
        Ok(record.capacity() - record.used.len() as u64)
    }
}
