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
//! Fragment-level pipeline runtime context.
//!
//! Responsibilities:
//! - Holds the state shared by every driver of one fragment instance: ids, runtime
//!   state, runtime filter hub, pipelines and the event scheduler.
//! - Records the first non-OK status and carries cancellation to parked drivers.
//! - Finalizes the fragment once its last driver has ended.
//!
//! Key exported interfaces:
//! - Types: `FragmentContext`.
//!
//! Current limitations:
//! - Completion callbacks run on the thread that ended the last driver.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::common::status::{ExecError, ExecResult};
use crate::common::types::UniqueId;
use crate::exec::pipeline::pipeline::Pipeline;
use crate::exec::pipeline::event_scheduler::EventScheduler;
use crate::exec::pipeline::global_driver_executor::DriverTask;
use crate::exec::runtime_filter::RuntimeFilterHub;
use crate::novarocks_logging::{debug, info};
use crate::runtime::profile::Profiler;
use crate::runtime::result_buffer::ResultBuffer;
use crate::runtime::runtime_state::RuntimeState;

type FinishCallback = Box<dyn FnOnce(&FragmentContext) + Send>;

/// Fragment-scoped runtime context shared across drivers and operator instances.
pub struct FragmentContext {
    query_id: UniqueId,
    fragment_instance_id: UniqueId,
    runtime_state: Arc<RuntimeState>,
    runtime_filter_hub: Arc<RuntimeFilterHub>,
    pipelines: Vec<Pipeline>,
    profiler: Option<Profiler>,
    result_buffer: Option<Arc<ResultBuffer>>,
    event_scheduler: Arc<EventScheduler<DriverTask>>,
    next_driver_id: AtomicI32,
    final_status: Mutex<Option<ExecError>>,
    finished: Mutex<bool>,
    finished_cv: Condvar,
    finish_callbacks: Mutex<Vec<FinishCallback>>,
}

impl FragmentContext {
    pub fn new(
        runtime_state: Arc<RuntimeState>,
        runtime_filter_hub: Arc<RuntimeFilterHub>,
        pipelines: Vec<Pipeline>,
    ) -> Self {
        Self {
            query_id: runtime_state.query_id().unwrap_or_default(),
            fragment_instance_id: runtime_state.fragment_instance_id().unwrap_or_default(),
            runtime_state,
            runtime_filter_hub,
            pipelines,
            profiler: None,
            result_buffer: None,
            event_scheduler: EventScheduler::new(),
            next_driver_id: AtomicI32::new(0),
            final_status: Mutex::new(None),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            finish_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_profiler(mut self, profiler: Profiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Buffer closed with the final status once the fragment ends.
    pub fn with_result_buffer(mut self, buffer: Arc<ResultBuffer>) -> Self {
        self.result_buffer = Some(buffer);
        self
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> UniqueId {
        self.fragment_instance_id
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn runtime_filter_hub(&self) -> &Arc<RuntimeFilterHub> {
        &self.runtime_filter_hub
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn profiler(&self) -> Option<&Profiler> {
        self.profiler.as_ref()
    }

    pub fn result_buffer(&self) -> Option<&Arc<ResultBuffer>> {
        self.result_buffer.as_ref()
    }

    pub fn next_driver_id(&self) -> i32 {
        self.next_driver_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn event_scheduler(&self) -> &Arc<EventScheduler<DriverTask>> {
        &self.event_scheduler
    }

    /// Returns true if `err` became the final status.
    pub fn set_final_status(&self, err: ExecError) -> bool {
        let mut guard = self.final_status.lock().expect("final status lock");
        if guard.is_some() {
            return false;
        }
        *guard = Some(err);
        true
    }

    /// First non-OK status, if any.
    pub fn final_status(&self) -> Option<ExecError> {
        self.final_status.lock().expect("final status lock").clone()
    }

    /// Cancel every driver of the fragment. Idempotent; the first status is kept.
    pub fn cancel(&self, status: ExecError) {
        if self.set_final_status(status.clone()) {
            debug!(
                "fragment cancelled: finst={} status={}",
                self.fragment_instance_id, status
            );
        }
        self.runtime_state.cancel(status);
        self.event_scheduler.wake_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.runtime_state.is_cancelled()
    }

    pub fn add_finish_callback(&self, callback: impl FnOnce(&FragmentContext) + Send + 'static) {
        self.finish_callbacks
            .lock()
            .expect("finish callbacks lock")
            .push(Box::new(callback));
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock().expect("fragment finished lock")
    }

    /// Close factories, the event scheduler and the filter hub, publish the final status and
    /// run completion callbacks. Called once, after the last driver has ended.
    pub(crate) fn finish(&self) {
        {
            let finished = self.finished.lock().expect("fragment finished lock");
            if *finished {
                return;
            }
        }
        for pipeline in &self.pipelines {
            pipeline.close(self.runtime_state.as_ref());
        }
        self.event_scheduler.close();
        self.runtime_filter_hub.close();
        let status = self.final_status();
        if let Some(buffer) = self.result_buffer.as_ref() {
            buffer.close(status.clone().map_or(Ok(()), Err));
        }
        info!(
            "fragment finished: finst={} status={}",
            self.fragment_instance_id,
            status
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "OK".to_string())
        );
        let callbacks = std::mem::take(&mut *self.finish_callbacks.lock().expect("finish callbacks lock"));
        {
            let mut finished = self.finished.lock().expect("fragment finished lock");
            *finished = true;
            self.finished_cv.notify_all();
        }
        for callback in callbacks {
            callback(self);
        }
    }

    pub fn wait_for_completion(&self) -> ExecResult<()> {
        let mut finished = self.finished.lock().expect("fragment finished lock");
        while !*finished {
            finished = self
                .finished_cv
                .wait(finished)
                .expect("fragment finished condvar wait");
        }
        drop(finished);
        self.final_status().map_or(Ok(()), Err)
    }

    /// `None` when the fragment is still running after `timeout`.
    pub fn wait_for_completion_timeout(&self, timeout: Duration) -> Option<ExecResult<()>> {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock().expect("fragment finished lock");
        while !*finished {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .finished_cv
                .wait_timeout(finished, deadline - now)
                .expect("fragment finished condvar wait");
            finished = guard;
        }
        drop(finished);
        Some(self.final_status().map_or(Ok(()), Err))
    }
}
