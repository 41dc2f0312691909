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

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use metalplane_error::{Code, Error, make_err};
use metalplane_util::machine::MachineAllocation;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{Level, event};

type AllocationResult = Result<MachineAllocation, Error>;

#[derive(Debug, Default)]
struct Waiters {
    next_id: AtomicU64,
    by_machine: Mutex<HashMap<String, Vec<(u64, oneshot::Sender<AllocationResult>)>>>,
}

/// Lets callers block until a machine gets allocated, e.g. a machine that
/// booted into the waiting state and needs to know when to install.
#[derive(Debug, Clone, Default)]
pub struct AllocationWaiter {
    waiters: Arc<Waiters>,
}

/// Unregisters a waiter when the waiting future is dropped.
struct Registration<'a> {
    waiters: &'a Waiters,
    machine_id: &'a str,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        let mut by_machine = self.waiters.by_machine.lock();
        if let Some(senders) = by_machine.get_mut(self.machine_id) {
            senders.retain(|(id, _)| *id != self.id);
            if senders.is_empty() {
                by_machine.remove(self.machine_id);
            }
        }
    }
}

impl AllocationWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for `machine_id` to be allocated.
    ///
    /// `current` is consulted after registering, so an allocation that
    /// completes between the caller's read and the registration is not
    /// missed. Fails with `Code::DeadlineExceeded` when nothing happened in
    /// time, which callers are expected to answer by polling again.
    pub async fn wait<F, Fut>(
        &self,
        machine_id: &str,
        timeout: Duration,
        current: F,
    ) -> AllocationResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<MachineAllocation>, Error>>,
    {
        let (tx, rx) = oneshot::channel();
        let id = self.waiters.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters
            .by_machine
            .lock()
            .entry(machine_id.to_string())
            .or_default()
            .push((id, tx));
        let _registration = Registration {
            waiters: &self.waiters,
            machine_id,
            id,
        };

        if let Some(allocation) = current().await? {
            return Ok(allocation);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(make_err!(
                Code::Internal,
                "Allocation notifier for machine {machine_id} dropped"
            )),
            Err(_) => Err(make_err!(
                Code::DeadlineExceeded,
                "Machine {machine_id} was not allocated within {timeout:?}"
            )),
        }
    }

    /// Wakes every waiter of `machine_id` with `result`.
    pub fn notify(&self, machine_id: &str, result: &AllocationResult) {
        let Some(senders) = self.waiters.by_machine.lock().remove(machine_id) else {
            return;
        };
        event!(
            Level::DEBUG,
            machine_id,
            waiters = senders.len(),
            ok = result.is_ok(),
            "Notifying allocation waiters"
        );
        for (_, tx) in senders {
            // The receiver may have timed out already.
            let _ = tx.send(result.clone());
        }
    }

    /// Number of callers currently waiting on `machine_id`.
    pub fn waiter_count(&self, machine_id: &str) -> usize {
        self.waiters
            .by_machine
            .lock()
            .get(machine_id)
            .map_or(0, Vec::len)
    }
}
