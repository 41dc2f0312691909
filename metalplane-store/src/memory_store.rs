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

use core::fmt::Debug;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::BTreeMap;

use async_trait::async_trait;
use metalplane_error::{Code, Error, make_err, make_input_err};
use metalplane_util::store_trait::{Record, RecordStore};
use parking_lot::RwLock;
use tracing::{Level, event};

/// Record store keeping one table in memory. Honors the same versioning
/// contract as a persistent store, so tests exercise the real conflict
/// paths.
pub struct MemoryRecordStore<R: Record> {
    records: RwLock<BTreeMap<String, R>>,
    last_version: AtomicU64,
}

impl<R: Record> Debug for MemoryRecordStore<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRecordStore")
            .field("kind", &R::KIND)
            .field("len", &self.records.read().len())
            .finish()
    }
}

impl<R: Record> Default for MemoryRecordStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> MemoryRecordStore<R> {
    pub const fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            last_version: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.last_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn check_version(current: &R, expected: &R) -> Result<(), Error> {
        if current.version() != expected.version() {
            return Err(make_err!(
                Code::Aborted,
                "{} {} was modified concurrently, expected version {} but found {}",
                R::KIND,
                current.key(),
                expected.version(),
                current.version()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryRecordStore<R> {
    async fn find(&self, key: &str) -> Result<Option<R>, Error> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<R>, Error> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn create(&self, mut record: R) -> Result<R, Error> {
        let mut records = self.records.write();
        if records.contains_key(record.key()) {
            return Err(make_err!(
                Code::AlreadyExists,
                "{} {} already exists",
                R::KIND,
                record.key()
            ));
        }
        record.set_version(self.next_version());
        records.insert(record.key().to_string(), record.clone());
        Ok(record)
    }

    async fn update(&self, old: &R, mut new: R) -> Result<R, Error> {
        if old.key() != new.key() {
            return Err(make_input_err!(
                "Cannot change the key of {} {} to {}",
                R::KIND,
                old.key(),
                new.key()
            ));
        }
        let mut records = self.records.write();
        let current = records
            .get(old.key())
            .ok_or_else(|| make_err!(Code::NotFound, "{} {} not found", R::KIND, old.key()))?;
        Self::check_version(current, old)?;
        new.set_version(self.next_version());
        records.insert(new.key().to_string(), new.clone());
        Ok(new)
    }

    async fn delete(&self, record: &R) -> Result<(), Error> {
        let mut records = self.records.write();
        let Some(current) = records.get(record.key()) else {
            return Err(make_err!(
                Code::NotFound,
                "{} {} not found",
                R::KIND,
                record.key()
            ));
        };
        Self::check_version(current, record)?;
        records.remove(record.key());
        event!(Level::TRACE, kind = R::KIND, key = record.key(), "Deleted record");
        Ok(())
    }
}
