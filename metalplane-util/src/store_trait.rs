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

use async_trait::async_trait;
use metalplane_error::{Code, Error, ResultExt, make_err};
use tracing::{Level, event};

/// A persisted entity. Every record carries a version that the store bumps
/// on each write; updates are only accepted against the current version.
pub trait Record: Clone + Debug + Send + Sync + 'static {
    /// Name of the table the record lives in, used in error messages.
    const KIND: &'static str;

    fn key(&self) -> &str;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);
}

/// Keyed table of one entity kind.
///
/// Implementations must preserve the optimistic-concurrency contract: an
/// `update` or `delete` whose base record does not carry the currently
/// stored version fails with `Code::Aborted` and leaves the table unchanged.
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Look up a record by key.
    async fn find(&self, key: &str) -> Result<Option<R>, Error>;

    /// All records ordered by key.
    async fn list(&self) -> Result<Vec<R>, Error>;

    /// Insert a new record. Fails with `Code::AlreadyExists` if the key is
    /// taken. Returns the record as stored.
    async fn create(&self, record: R) -> Result<R, Error>;

    /// Replace `old` with `new`. Fails with `Code::Aborted` if `old` is no
    /// longer the stored version and with `Code::NotFound` if the record is
    /// gone. Returns the record as stored.
    async fn update(&self, old: &R, new: R) -> Result<R, Error>;

    /// Delete `record` if it is still the stored version.
    async fn delete(&self, record: &R) -> Result<(), Error>;

    /// Same as `find`, but a missing record is an error.
    async fn get(&self, key: &str) -> Result<R, Error> {
        self.find(key)
            .await?
            .ok_or_else(|| make_err!(Code::NotFound, "{} {key} not found", R::KIND))
    }
}

/// Read-modify-write cycle against `store`. `mutate` is applied to a fresh
/// copy of the record and returns whether it changed anything; unchanged
/// records are not written. Conflicts are retried up to `max_attempts` times
/// with a re-read in between.
pub async fn update_with_retry<R, F>(
    store: &dyn RecordStore<R>,
    key: &str,
    max_attempts: usize,
    mut mutate: F,
) -> Result<R, Error>
where
    R: Record,
    F: FnMut(&mut R) -> Result<bool, Error> + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let old = store.get(key).await?;
        let mut new = old.clone();
        if !mutate(&mut new)? {
            return Ok(old);
        }
        match store.update(&old, new).await {
            Ok(stored) => return Ok(stored),
            Err(err) if err.is_conflict() && attempt < max_attempts => {
                event!(
                    Level::DEBUG,
                    kind = R::KIND,
                    key,
                    attempt,
                    "Conflict while updating record, retrying"
                );
            }
            Err(err) => {
                return Err(err).err_tip(|| {
                    format!("In update_with_retry for {} {key} on attempt {attempt}", R::KIND)
                });
            }
        }
    }
}
