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
//! Fragment instance setup, submission and registry.
//!
//! Responsibilities:
//! - Builds the runtime state and context of one fragment instance, prepares its
//!   pipelines and drivers, and submits the drivers to the executor.
//! - Keeps the registry of running fragment instances used for duplicate detection
//!   and cancellation.
//!
//! Key exported interfaces:
//! - Types: `FragmentExecParams`, `FragmentExecutor`, `FragmentManager`.
//! - Functions: `fragment_mgr`.
//!
//! Current limitations:
//! - A fragment instance is registered for its whole lifetime and cannot be re-run with the same id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::common::app_config::StreamingPreaggregationMode;
use crate::common::config;
use crate::common::status::{ExecError, ExecResult};
use crate::common::types::UniqueId;
use crate::exec::runtime_filter::RuntimeFilterHub;
use crate::novarocks_logging::{debug, info, warn};
use crate::runtime::mem_tracker::{self, MemTracker};
use crate::runtime::profile::Profiler;
use crate::runtime::result_buffer::ResultBuffer;
use crate::runtime::runtime_state::RuntimeState;

use super::driver::PipelineDriver;
use super::fragment_context::FragmentContext;
use super::global_driver_executor::{DriverTask, FragmentCompletion, GlobalDriverExecutor};
use super::pipeline::Pipeline;

/// Everything needed to run one fragment instance.
pub struct FragmentExecParams {
    pub query_id: UniqueId,
    pub fragment_instance_id: UniqueId,
    pub pipelines: Vec<Pipeline>,
    pub runtime_filter_hub: Arc<RuntimeFilterHub>,
    pub result_buffer: Option<Arc<ResultBuffer>>,
    pub chunk_size: Option<usize>,
    pub streaming_preaggregation_mode: Option<StreamingPreaggregationMode>,
    /// Bytes; `None` leaves the fragment bounded only by the process tracker.
    pub mem_limit: Option<i64>,
    pub enable_profile: bool,
}

impl FragmentExecParams {
    pub fn new(
        query_id: UniqueId,
        fragment_instance_id: UniqueId,
        pipelines: Vec<Pipeline>,
        runtime_filter_hub: Arc<RuntimeFilterHub>,
    ) -> Self {
        Self {
            query_id,
            fragment_instance_id,
            pipelines,
            runtime_filter_hub,
            result_buffer: None,
            chunk_size: None,
            streaming_preaggregation_mode: None,
            mem_limit: None,
            enable_profile: false,
        }
    }

    fn build_runtime_state(&self) -> RuntimeState {
        let mut state = RuntimeState::new(self.query_id, self.fragment_instance_id);
        if let Some(limit) = self.mem_limit {
            state = state.with_mem_tracker(MemTracker::new_child_with_limit(
                format!("fragment {}", self.fragment_instance_id),
                limit,
                &mem_tracker::process_mem_tracker(),
            ));
        }
        state = state.with_chunk_size(self.chunk_size.unwrap_or_else(config::chunk_size));
        if let Some(mode) = self.streaming_preaggregation_mode {
            state = state.with_streaming_preaggregation_mode(mode);
        }
        state
    }
}

/// Registry of live fragment instances keyed by fragment instance id.
#[derive(Default)]
pub struct FragmentManager {
    fragments: Mutex<HashMap<UniqueId, Arc<FragmentContext>>>,
}

impl FragmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ctx: &Arc<FragmentContext>) -> ExecResult<()> {
        let mut fragments = self.fragments.lock().expect("fragment manager lock");
        let finst = ctx.fragment_instance_id();
        if fragments.contains_key(&finst) {
            return Err(ExecError::DuplicateRpcInvocation(format!(
                "fragment instance {} already prepared",
                finst
            )));
        }
        fragments.insert(finst, Arc::clone(ctx));
        Ok(())
    }

    pub fn unregister(&self, finst: UniqueId) -> Option<Arc<FragmentContext>> {
        self.fragments
            .lock()
            .expect("fragment manager lock")
            .remove(&finst)
    }

    pub fn get(&self, finst: UniqueId) -> Option<Arc<FragmentContext>> {
        self.fragments
            .lock()
            .expect("fragment manager lock")
            .get(&finst)
            .cloned()
    }

    pub fn contains(&self, finst: UniqueId) -> bool {
        self.fragments
            .lock()
            .expect("fragment manager lock")
            .contains_key(&finst)
    }

    /// Returns false when the instance is unknown or already finished.
    pub fn cancel(&self, finst: UniqueId, reason: ExecError) -> bool {
        let Some(ctx) = self.get(finst) else {
            debug!("cancel of unknown fragment instance: finst={}", finst);
            return false;
        };
        ctx.cancel(reason);
        true
    }

    pub fn len(&self) -> usize {
        self.fragments.lock().expect("fragment manager lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static FRAGMENT_MGR: OnceLock<Arc<FragmentManager>> = OnceLock::new();

pub fn fragment_mgr() -> &'static Arc<FragmentManager> {
    FRAGMENT_MGR.get_or_init(|| Arc::new(FragmentManager::new()))
}

/// A prepared fragment instance whose drivers have not been submitted yet.
pub struct FragmentExecutor {
    ctx: Arc<FragmentContext>,
    drivers: Vec<PipelineDriver>,
    submitted: bool,
}

impl FragmentExecutor {
    /// Register the instance and prepare its pipelines and drivers.
    ///
    /// A second prepare of the same instance id fails with `DuplicateRpcInvocation`.
    pub fn prepare(mgr: &Arc<FragmentManager>, params: FragmentExecParams) -> ExecResult<Self> {
        let finst = params.fragment_instance_id;
        if mgr.contains(finst) {
            return Err(ExecError::DuplicateRpcInvocation(format!(
                "fragment instance {} already prepared",
                finst
            )));
        }
        if params.pipelines.is_empty() {
            return Err(ExecError::invalid_argument(format!(
                "fragment instance {} has no pipelines",
                finst
            )));
        }
        let state = Arc::new(params.build_runtime_state());
        let mut ctx = FragmentContext::new(
            Arc::clone(&state),
            params.runtime_filter_hub,
            params.pipelines,
        );
        if params.enable_profile {
            ctx = ctx.with_profiler(Profiler::new(format!("Fragment (finst={})", finst)));
        }
        if let Some(buffer) = params.result_buffer {
            ctx = ctx.with_result_buffer(buffer);
        }
        let ctx = Arc::new(ctx);
        mgr.register(&ctx)?;
        let weak_mgr = Arc::downgrade(mgr);
        ctx.add_finish_callback(move |ctx| {
            if let Some(mgr) = weak_mgr.upgrade() {
                mgr.unregister(ctx.fragment_instance_id());
            }
        });

        let mut executor = Self {
            ctx,
            drivers: Vec::new(),
            submitted: false,
        };
        if let Err(err) = executor.prepare_drivers() {
            warn!("fragment prepare failed: finst={} error={}", finst, err);
            executor.abort(err.clone());
            return Err(err);
        }
        info!(
            "fragment prepared: finst={} pipelines={} drivers={}",
            finst,
            executor.ctx.pipelines().len(),
            executor.drivers.len()
        );
        Ok(executor)
    }

    fn prepare_drivers(&mut self) -> ExecResult<()> {
        let state = Arc::clone(self.ctx.runtime_state());
        for pipeline in self.ctx.pipelines() {
            pipeline.prepare(state.as_ref())?;
        }
        let pipelines = self.ctx.pipelines();
        for pipeline in pipelines {
            for mut driver in pipeline.instantiate_drivers(&self.ctx) {
                driver.prepare()?;
                self.drivers.push(driver);
            }
        }
        Ok(())
    }

    /// Cancel, close every driver and finalize the context.
    fn abort(&mut self, err: ExecError) {
        self.ctx.cancel(err);
        self.drivers.clear();
        self.ctx.finish();
    }

    pub fn context(&self) -> &Arc<FragmentContext> {
        &self.ctx
    }

    pub fn num_drivers(&self) -> usize {
        self.drivers.len()
    }

    /// Hand every driver to `executor`. Returns the context to wait on.
    pub fn execute(mut self, executor: &GlobalDriverExecutor) -> ExecResult<Arc<FragmentContext>> {
        if executor.is_shutdown() {
            let err = ExecError::ServiceUnavailable("driver executor is shut down".to_string());
            self.abort(err.clone());
            return Err(err);
        }
        self.submitted = true;
        let drivers = std::mem::take(&mut self.drivers);
        let completion = FragmentCompletion::new(drivers.len(), Arc::clone(&self.ctx));
        let time_slice = config::driver_time_slice();
        let tasks = drivers
            .into_iter()
            .map(|driver| DriverTask::new(driver, Arc::clone(&completion), time_slice))
            .collect();
        executor.submit(tasks);
        Ok(Arc::clone(&self.ctx))
    }
}

impl Drop for FragmentExecutor {
    fn drop(&mut self) {
        if !self.submitted && !self.ctx.is_finished() {
            self.abort(ExecError::cancelled("fragment dropped before execution"));
        }
    }
}
