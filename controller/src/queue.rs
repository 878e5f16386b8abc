// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduling reconciliation passes
//!
//! [`WorkQueue`] holds the set of machines that need a pass.  A key is never
//! handed to two workers at once: a key triggered while its pass is running
//! is marked dirty and handed out again once that pass finishes, and any
//! number of triggers in the meantime collapse into that one extra pass.
//!
//! [`Controller`] runs a fixed number of workers pulling from the queue and
//! decides, from each pass's result, when the key should come back.

use crate::config::ControllerConfig;
use crate::reconciler::Outcome;
use crate::reconciler::ReconcileError;
use anyhow::Context;
use async_trait::async_trait;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use vmop_common::api::MachineKey;
use vmop_common::backoff;
use vmop_common::backoff::Backoff;
use vmop_common::backoff::ExponentialBackoff;

/// Something that can run one reconciliation pass for a key
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(
        &self,
        key: &MachineKey,
    ) -> Result<Outcome, ReconcileError>;
}

#[derive(Default)]
struct QueueState {
    /// keys ready to be handed to a worker, in arrival order
    ready: VecDeque<MachineKey>,
    /// keys that need a pass (whether ready or waiting on a running pass)
    dirty: BTreeSet<MachineKey>,
    /// keys currently held by a worker
    processing: BTreeSet<MachineKey>,
    /// per-key retry policy, present while a key keeps failing
    failures: BTreeMap<MachineKey, ExponentialBackoff>,
    shutting_down: bool,
}

/// Keyed, coalescing work queue
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue::default()
    }

    /// Request a pass for `key`.
    pub fn add(&self, key: MachineKey) {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.processing.contains(&key) {
            state.ready.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Request a pass for `key` after `delay`.
    pub fn add_after(self: &Arc<Self>, key: MachineKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Request a pass for `key` after its next retry delay, returning that
    /// delay.
    ///
    /// Consecutive failures of one key back off exponentially until
    /// [`WorkQueue::forget`] is called for it.
    pub fn add_rate_limited(
        self: &Arc<Self>,
        key: MachineKey,
        policy: fn() -> ExponentialBackoff,
    ) -> Duration {
        let delay = {
            let mut state = self.state.lock().unwrap();
            let backoff =
                state.failures.entry(key.clone()).or_insert_with(policy);
            backoff.next_backoff().unwrap_or(backoff.max_interval)
        };
        self.add_after(key, delay);
        delay
    }

    /// Reset the retry delay of `key`.
    pub fn forget(&self, key: &MachineKey) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// Wait for a key to process.  Returns `None` once the queue is shut
    /// down.
    ///
    /// Every key returned must be handed back through [`WorkQueue::done`].
    pub async fn next(&self) -> Option<MachineKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark the pass for `key` finished.
    pub fn done(&self, key: &MachineKey) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.ready.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys; every pending and future [`WorkQueue::next`]
    /// returns `None`.
    pub fn shutdown(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs reconciliation passes from a [`WorkQueue`] with bounded concurrency
pub struct Controller<R> {
    log: Logger,
    queue: Arc<WorkQueue>,
    reconciler: Arc<R>,
    config: ControllerConfig,
}

impl<R: Reconcile> Controller<R> {
    pub fn new(
        log: &Logger,
        reconciler: Arc<R>,
        config: ControllerConfig,
    ) -> Controller<R> {
        Controller {
            log: log.new(o!("component" => "Controller")),
            queue: Arc::new(WorkQueue::new()),
            reconciler,
            config,
        }
    }

    /// The queue this controller pulls from; triggers go here
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Run workers until the queue is shut down.
    pub async fn run(self) -> anyhow::Result<()> {
        let workers = self.config.workers.max(1);
        info!(self.log, "starting"; "workers" => workers);

        let this = Arc::new(self);
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let this = Arc::clone(&this);
            set.spawn(async move { this.worker(worker).await });
        }
        while let Some(result) = set.join_next().await {
            result.context("reconcile worker panicked")?;
        }

        info!(this.log, "stopped");
        Ok(())
    }

    async fn worker(&self, worker: usize) {
        let log = self.log.new(o!("worker" => worker));
        while let Some(key) = self.queue.next().await {
            self.process(&log, &key).await;
            self.queue.done(&key);
        }
    }

    /// Run one pass for `key` and schedule whatever should follow it.
    pub async fn process(&self, log: &Logger, key: &MachineKey) {
        let result = match self.config.pass_deadline {
            None => self.reconciler.reconcile(key).await,
            Some(deadline) => {
                match tokio::time::timeout(
                    deadline,
                    self.reconciler.reconcile(key),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ReconcileError::DeadlineExceeded(deadline)),
                }
            }
        };

        match result {
            Ok(Outcome::Done) => {
                debug!(log, "pass complete"; "vm" => %key);
                self.queue.forget(key);
            }
            Ok(Outcome::Requeue) => {
                debug!(log, "pass requeued"; "vm" => %key);
                self.queue.forget(key);
                self.queue.add_after(key.clone(), self.config.requeue_interval);
            }
            Err(error) => {
                let policy = if error.is_precondition() {
                    backoff::precondition_failure_policy
                } else {
                    backoff::reconcile_failure_policy
                };
                let delay = self.queue.add_rate_limited(key.clone(), policy);
                warn!(log, "pass failed";
                    "vm" => %key,
                    "error" => %error,
                    "retry_after" => ?delay,
                );
            }
        }
    }
}
