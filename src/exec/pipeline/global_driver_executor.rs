// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Global driver executor and worker pool.
//!
//! Responsibilities:
//! - Runs driver quanta on a bounded set of worker threads sharing one ready queue.
//! - Routes each driver after its quantum: requeue, park on a dependency, poll, or complete.
//! - Counts live drivers per fragment and finalizes the fragment when the last one ends.
//!
//! Key exported interfaces:
//! - Types: `FragmentCompletion`, `DriverTask`, `GlobalDriverExecutor`.
//! - Functions: `global_driver_executor`.
//!
//! Current limitations:
//! - The ready queue is FIFO; there is no per-query fairness or priority.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::common::config;
use crate::common::status::ExecError;
use crate::novarocks_logging::{debug, error, info};

use super::blocked_driver_poller::BlockedDriverPoller;
use super::driver::{DriverState, PipelineDriver};
use super::event_scheduler::Readmit;
use super::fragment_context::FragmentContext;
use super::operator::BlockedReason;

/// Live-driver counter of one fragment.
pub struct FragmentCompletion {
    remaining: Mutex<usize>,
    fragment_ctx: Arc<FragmentContext>,
}

impl FragmentCompletion {
    pub(crate) fn new(driver_count: usize, fragment_ctx: Arc<FragmentContext>) -> Arc<Self> {
        Arc::new(Self {
            remaining: Mutex::new(driver_count),
            fragment_ctx,
        })
    }

    pub(crate) fn fragment_ctx(&self) -> &Arc<FragmentContext> {
        &self.fragment_ctx
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock().expect("fragment completion lock")
    }

    /// Record `err` as the fragment status (first one wins) and cancel the rest.
    pub fn fail(&self, err: ExecError) {
        self.fragment_ctx.cancel(err);
    }

    pub fn driver_finished(&self) {
        let finished = {
            let mut remaining = self.remaining.lock().expect("fragment completion lock");
            if *remaining == 0 {
                return;
            }
            *remaining -= 1;
            *remaining == 0
        };
        if finished {
            self.fragment_ctx.finish();
        }
    }

    /// Block until every driver has ended; returns the fragment's final status.
    pub fn wait(&self) -> Result<(), ExecError> {
        self.fragment_ctx.wait_for_completion()
    }
}

/// Schedulable driver plus its fragment bookkeeping.
pub struct DriverTask {
    driver: PipelineDriver,
    completion: Arc<FragmentCompletion>,
    time_slice: Duration,
}

impl DriverTask {
    pub fn new(
        driver: PipelineDriver,
        completion: Arc<FragmentCompletion>,
        time_slice: Duration,
    ) -> Self {
        Self {
            driver,
            completion,
            time_slice,
        }
    }

    pub fn driver(&self) -> &PipelineDriver {
        &self.driver
    }

    pub(crate) fn driver_id(&self) -> i32 {
        self.driver.driver_id()
    }

    pub(crate) fn fragment_ctx(&self) -> &Arc<FragmentContext> {
        self.completion.fragment_ctx()
    }

    pub(crate) fn should_abort(&self) -> bool {
        self.driver.should_abort()
    }

    pub(crate) fn check_is_ready(&self) -> bool {
        self.driver.check_is_ready()
    }

    pub(crate) fn set_ready(&mut self) {
        self.driver.set_ready();
    }

    /// Drop a driver that can no longer be scheduled, failing its fragment.
    pub(crate) fn abandon(self) {
        let completion = Arc::clone(&self.completion);
        completion.fail(ExecError::cancelled(format!(
            "driver {} abandoned by scheduler shutdown",
            self.driver_id()
        )));
        drop(self);
        completion.driver_finished();
    }

    /// Drop the driver (closing its operators) before counting it as finished.
    fn complete(self) {
        let completion = Arc::clone(&self.completion);
        drop(self);
        completion.driver_finished();
    }
}

/// Ready queue shared by the workers, the poller and the event schedulers.
pub(crate) struct ExecutorShared {
    queue: Mutex<VecDeque<DriverTask>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl ExecutorShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Queue `task` for a worker. After shutdown nothing runs it, so it is abandoned.
    pub(crate) fn push(&self, task: DriverTask) {
        {
            let mut queue = self.queue.lock().expect("global executor queue lock");
            if !self.shutdown.load(Ordering::Acquire) {
                queue.push_back(task);
                self.cv.notify_one();
                return;
            }
        }
        task.abandon();
    }

    /// Re-admission path for drivers leaving the event scheduler.
    fn readmit(self: &Arc<Self>) -> Readmit<DriverTask> {
        let shared = Arc::downgrade(self);
        Arc::new(move |mut task: DriverTask| match shared.upgrade() {
            Some(shared) => {
                task.set_ready();
                shared.push(task);
            }
            None => task.abandon(),
        })
    }
}

/// Worker pool that runs pipeline drivers.
pub struct GlobalDriverExecutor {
    shared: Arc<ExecutorShared>,
    poller: BlockedDriverPoller,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl GlobalDriverExecutor {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(ExecutorShared::new());
        let poller = BlockedDriverPoller::new(
            Arc::clone(&shared),
            config::blocked_driver_poll_interval(),
        );
        poller.start();

        let mut workers = Vec::with_capacity(num_threads);
        for idx in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            let poller_cloned = poller.clone();
            let spawned = thread::Builder::new()
                .name(format!("pip_exec_{}", idx))
                .spawn(move || Worker::new(shared_cloned, poller_cloned).run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => error!("failed to spawn pipeline worker {}: {}", idx, err),
            }
        }
        info!("GlobalDriverExecutor started: threads={}", workers.len());

        Self {
            shared,
            poller,
            workers: Mutex::new(workers),
        }
    }

    pub fn submit(&self, tasks: Vec<DriverTask>) {
        if tasks.is_empty() {
            return;
        }
        let mut queue = self
            .shared
            .queue
            .lock()
            .expect("global executor queue lock");
        queue.extend(tasks);
        self.shared.cv.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stop the workers and the poller. Drivers still queued are abandoned.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cv.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock().expect("global executor workers lock"));
        for handle in workers {
            let _ = handle.join();
        }
        self.poller.shutdown();
        let leftover = std::mem::take(&mut *self.shared.queue.lock().expect("global executor queue lock"));
        for task in leftover {
            task.abandon();
        }
        info!("GlobalDriverExecutor stopped");
    }
}

impl Drop for GlobalDriverExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

static GLOBAL_DRIVER_EXECUTOR: OnceLock<GlobalDriverExecutor> = OnceLock::new();

/// Process-wide executor sized by `runtime.pipeline_exec_thread_pool_thread_num`.
pub fn global_driver_executor() -> &'static GlobalDriverExecutor {
    GLOBAL_DRIVER_EXECUTOR.get_or_init(|| GlobalDriverExecutor::new(config::pipeline_exec_threads()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    match payload.downcast_ref::<String>() {
        Some(message) => message.clone(),
        None => "unknown panic payload".to_string(),
    }
}

/// State owned by one worker thread.
struct Worker {
    shared: Arc<ExecutorShared>,
    poller: BlockedDriverPoller,
    readmit: Readmit<DriverTask>,
}

impl Worker {
    fn new(shared: Arc<ExecutorShared>, poller: BlockedDriverPoller) -> Self {
        let readmit = shared.readmit();
        Self {
            shared,
            poller,
            readmit,
        }
    }

    fn run(self) {
        while let Some(mut task) = self.next_task() {
            let state = run_quantum(&mut task);
            self.route(task, state);
        }
    }

    /// Blocks for the next queued driver; `None` once the executor shuts down.
    fn next_task(&self) -> Option<DriverTask> {
        let mut queue = self.shared.queue.lock().expect("global executor queue lock");
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            queue = self
                .shared
                .cv
                .wait(queue)
                .expect("global executor queue condvar wait");
        }
    }

    fn route(&self, task: DriverTask, state: DriverState) {
        match state {
            DriverState::Ready | DriverState::Running => self.shared.push(task),
            DriverState::Blocked(BlockedReason::Dependency(dep)) => {
                let scheduler = Arc::clone(task.fragment_ctx().event_scheduler());
                scheduler.park(task, &dep, Arc::clone(&self.readmit));
            }
            DriverState::Blocked(_) | DriverState::PendingFinish => self.poller.add_blocked(task),
            DriverState::Finished => task.complete(),
            DriverState::Canceled => {
                let status = task
                    .driver
                    .runtime_state()
                    .error()
                    .unwrap_or_else(|| ExecError::cancelled("pipeline driver canceled"));
                debug!("driver {} canceled: {}", task.driver_id(), status);
                task.completion.fail(status);
                task.complete();
            }
            DriverState::Failed(err) => {
                debug!("driver {} failed: {}", task.driver_id(), err);
                task.completion.fail(err);
                task.complete();
            }
        }
    }
}

/// One quantum of `task`; a panic inside the driver becomes `Failed`.
fn run_quantum(task: &mut DriverTask) -> DriverState {
    let time_slice = task.time_slice;
    let driver = &mut task.driver;
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| driver.process(time_slice))) {
        Ok(state) => state,
        Err(payload) => DriverState::Failed(ExecError::internal(format!(
            "driver panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}
