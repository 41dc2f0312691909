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
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use metalplane_error::{Code, Error, make_err};
use tokio::sync::{Notify, mpsc};
use tracing::{Level, event};

use crate::retry::{Retrier, RetryResult};
use crate::spawn;
use crate::task::JoinHandleDropGuard;

/// Consumer of one job kind.
#[async_trait]
pub trait JobHandler<J>: Send + Sync {
    /// Runs the job. Jobs are delivered at least once, so this must be safe
    /// to run again for the same input.
    async fn handle(&self, job: &J) -> Result<(), Error>;
}

/// Typed queue of deferred jobs consumed by a pool of workers.
///
/// Each job is retried with the worker's `Retrier`; a job that still fails
/// is logged and dropped, since the caller that enqueued it has already
/// returned.
pub struct JobQueue<J> {
    name: &'static str,
    sender: mpsc::UnboundedSender<J>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<J>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            pending: self.pending.clone(),
            idle: self.idle.clone(),
        }
    }
}

impl<J> Debug for JobQueue<J> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue")
            .field("name", &self.name)
            .field("pending", &self.pending.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<J: Debug + Send + Sync + 'static> JobQueue<J> {
    pub fn new(name: &'static str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub fn enqueue(&self, job: J) -> Result<(), Error> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(job).is_err() {
            self.complete_one();
            return Err(make_err!(
                Code::Unavailable,
                "Job queue {} is closed",
                self.name
            ));
        }
        Ok(())
    }

    /// Jobs enqueued but not yet finished, including the ones being worked on.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolves once every enqueued job has finished.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Starts `workers` tasks consuming this queue. Dropping the returned
    /// guards stops them.
    pub fn spawn_workers(
        &self,
        workers: usize,
        retrier: Retrier,
        handler: Arc<dyn JobHandler<J>>,
    ) -> Vec<JoinHandleDropGuard<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let queue = self.clone();
                let retrier = retrier.clone();
                let handler = handler.clone();
                spawn!(
                    "job_queue_worker",
                    async move { queue.run_worker(&retrier, handler.as_ref()).await },
                    queue = self.name,
                    worker
                )
            })
            .collect()
    }

    /// Runs every job that is currently queued on the calling task and
    /// returns how many ran.
    pub async fn drain(&self, retrier: &Retrier, handler: &dyn JobHandler<J>) -> usize {
        let mut ran = 0;
        loop {
            let job = self.receiver.lock().await.try_recv();
            let Ok(job) = job else {
                return ran;
            };
            self.run_job(retrier, handler, job).await;
            ran += 1;
        }
    }

    async fn run_worker(&self, retrier: &Retrier, handler: &dyn JobHandler<J>) {
        loop {
            let job = self.receiver.lock().await.recv().await;
            let Some(job) = job else {
                event!(Level::INFO, queue = self.name, "Job queue closed, worker exiting");
                return;
            };
            self.run_job(retrier, handler, job).await;
        }
    }

    async fn run_job(&self, retrier: &Retrier, handler: &dyn JobHandler<J>, job: J) {
        let _pending_guard = scopeguard::guard((), |()| self.complete_one());
        let job_ref = &job;
        let result = retrier
            .retry(futures::stream::unfold((), move |()| async move {
                let result = match handler.handle(job_ref).await {
                    Ok(()) => RetryResult::Ok(()),
                    Err(err) => {
                        event!(Level::DEBUG, ?err, job = ?job_ref, "Job attempt failed");
                        RetryResult::Retry(err)
                    }
                };
                Some((result, ()))
            }))
            .await;
        if let Err(err) = result {
            event!(
                Level::ERROR,
                queue = self.name,
                ?job,
                ?err,
                "Job failed permanently"
            );
        }
    }

    fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}
