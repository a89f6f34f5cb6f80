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
//! Pipeline driver execution loop.
//!
//! Responsibilities:
//! - Owns one operator instance per factory of a pipeline and moves chunks between them.
//! - Runs cooperatively: every call to `process` is bounded by a time slice and a chunk quota.
//! - Tracks operator lifecycle order and reports blocking reasons to the scheduler.
//!
//! Key exported interfaces:
//! - Types: `DriverState`, `PipelineDriver`.
//!
//! Current limitations:
//! - A driver that makes no progress without an identifiable blocking reason yields as `Ready`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::dependency::DependencyHandle;
use super::operator::{BlockedReason, Operator, OperatorStage};
use crate::common::config;
use crate::common::status::{ExecError, ExecResult};
use crate::common::types::UniqueId;
use crate::exec::chunk::ChunkPtr;
use crate::novarocks_logging::{debug, error, warn};
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{
    CounterRef, CounterUnit, OperatorProfiles, Profiler, clamp_u128_to_i64,
};
use crate::runtime::runtime_state::RuntimeState;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Runtime state for a single pipeline driver.
///
/// **State machine (high level)**
/// ```text
///              (scheduled)                 (quantum ends)
///   Ready ───────────────────► Running ─────────────────────► Ready
///                               │  │
///                               │  ├─ blocks on input/output/deps ──► Blocked(reason)
///                               │  │                                   │
///                               │  │        (re-admitted)              │
///                               │  └───────────────────────────────────┘
///                               │
///                               ├─ async work in flight ──────► PendingFinish
///                               ├─ completes normally ────────► Finished
///                               ├─ canceled ──────────────────► Canceled
///                               └─ fatal error ───────────────► Failed(err)
/// ```
pub enum DriverState {
    Ready,
    Running,
    Blocked(BlockedReason),
    PendingFinish,
    Finished,
    Canceled,
    Failed(ExecError),
}

impl DriverState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            DriverState::Finished | DriverState::Canceled | DriverState::Failed(_)
        )
    }
}

#[derive(Clone)]
struct OperatorCounters {
    operator_total_time: CounterRef,
    push_total_time: CounterRef,
    pull_total_time: CounterRef,
    set_finishing_time: CounterRef,
    close_time: CounterRef,
    push_row_num: CounterRef,
    pull_row_num: CounterRef,
    mem_peak: CounterRef,
    mem_allocated: CounterRef,
}

impl OperatorCounters {
    fn new(p: &OperatorProfiles) -> Self {
        Self {
            operator_total_time: p.common.add_timer("OperatorTotalTime"),
            push_total_time: p.common.add_timer("PushTotalTime"),
            pull_total_time: p.common.add_timer("PullTotalTime"),
            set_finishing_time: p.common.add_timer("SetFinishingTime"),
            close_time: p.common.add_timer("CloseTime"),
            push_row_num: p.common.add_counter("PushRowNum", CounterUnit::Unit),
            pull_row_num: p.common.add_counter("PullRowNum", CounterUnit::Unit),
            mem_peak: p
                .common
                .add_counter("OperatorPeakMemoryUsage", CounterUnit::Bytes),
            mem_allocated: p
                .common
                .add_counter("OperatorAllocatedMemoryUsage", CounterUnit::Bytes),
        }
    }
}

fn elapsed_ns(start: Instant) -> i64 {
    clamp_u128_to_i64(start.elapsed().as_nanos())
}

/// Cooperative execution driver for one pipeline instance.
pub struct PipelineDriver {
    driver_id: i32,
    operators: Vec<Box<dyn Operator>>,
    stages: Vec<OperatorStage>,
    precondition_ready: Vec<bool>,
    profiler: Option<Profiler>,
    driver_total_time: Option<CounterRef>,
    schedule_count: Option<CounterRef>,
    operator_counters: Vec<OperatorCounters>,
    runtime_state: Arc<RuntimeState>,
    state: DriverState,
    prepared: bool,
    closed: bool,
    pending_finish_state: Option<DriverState>,
    yield_max_chunks_moved: usize,

    edge_chunks: Vec<Option<ChunkPtr>>,
    edge_closed: Vec<bool>,
    operator_mem_trackers: Vec<Option<Arc<MemTracker>>>,
}

impl PipelineDriver {
    pub fn new(
        driver_id: i32,
        operators: Vec<Box<dyn Operator>>,
        profiler: Option<Profiler>,
        runtime_state: Arc<RuntimeState>,
    ) -> Self {
        let operator_count = operators.len();
        let edge_count = operator_count.saturating_sub(1);
        let driver_total_time = profiler.as_ref().map(|p| p.add_timer("DriverTotalTime"));
        let schedule_count = profiler
            .as_ref()
            .map(|p| p.add_counter("ScheduleCount", CounterUnit::Unit));
        Self {
            driver_id,
            operators,
            stages: vec![OperatorStage::Created; operator_count],
            precondition_ready: vec![false; operator_count],
            profiler,
            driver_total_time,
            schedule_count,
            operator_counters: Vec::new(),
            runtime_state,
            state: DriverState::Ready,
            prepared: false,
            closed: false,
            pending_finish_state: None,
            yield_max_chunks_moved: config::driver_yield_max_chunks_moved(),
            edge_chunks: vec![None; edge_count],
            edge_closed: vec![false; edge_count],
            operator_mem_trackers: vec![None; operator_count],
        }
    }

    /// Override the per-quantum chunk quota.
    pub fn with_yield_max_chunks_moved(mut self, max_chunks: usize) -> Self {
        self.yield_max_chunks_moved = max_chunks.max(1);
        self
    }

    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        self.runtime_state.fragment_instance_id()
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn operators(&self) -> &[Box<dyn Operator>] {
        &self.operators
    }

    pub fn operator_stage(&self, idx: usize) -> Option<OperatorStage> {
        self.stages.get(idx).copied()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn profile(&self) -> Option<&Profiler> {
        self.profiler.as_ref()
    }

    /// Prepare every operator once, in pipeline order.
    ///
    /// On failure every operator is closed, including those never prepared.
    pub fn prepare(&mut self) -> ExecResult<()> {
        if self.prepared {
            return Err(ExecError::internal(format!(
                "driver {} prepared twice",
                self.driver_id
            )));
        }
        self.prepared = true;
        if self.operators.is_empty() {
            return Err(ExecError::internal("pipeline driver has no operators"));
        }
        let mem_root = self.runtime_state.mem_tracker();
        for idx in 0..self.operators.len() {
            if let Err(err) = self.prepare_operator(idx, mem_root.as_ref()) {
                warn!(
                    "driver prepare failed: driver_id={} op={} error={}",
                    self.driver_id,
                    self.operators[idx].name(),
                    err
                );
                self.close_operators();
                return Err(err);
            }
        }
        Ok(())
    }

    fn prepare_operator(&mut self, idx: usize, mem_root: Option<&Arc<MemTracker>>) -> ExecResult<()> {
        let op = &mut self.operators[idx];
        if let Some(root) = mem_root {
            let label = format!("operator {}: {}", idx, op.name());
            let tracker = MemTracker::new_child(label, root);
            op.base_mut().set_mem_tracker(Arc::clone(&tracker));
            self.operator_mem_trackers[idx] = Some(tracker);
        }
        if let Some(profiler) = self.profiler.as_ref() {
            let profiles = OperatorProfiles::new(format!(
                "{} (plan_node_id={})",
                op.name(),
                op.base().plan_node_id()
            ));
            profiler.add_child(profiles.operator.clone());
            self.operator_counters.push(OperatorCounters::new(&profiles));
            op.base_mut().set_profiles(profiles);
        }
        self.stages[idx].check_transition(OperatorStage::Prepared)?;
        op.prepare(self.runtime_state.as_ref())?;
        self.stages[idx] = OperatorStage::Prepared;
        Ok(())
    }

    /// True while any operator still has asynchronous work referencing fragment state.
    pub fn has_pending_finish(&self) -> bool {
        self.operators
            .iter()
            .zip(&self.stages)
            .any(|(op, stage)| *stage != OperatorStage::Closed && op.pending_finish())
    }

    /// Run one quantum.
    pub fn process(&mut self, time_slice: Duration) -> DriverState {
        let start = Instant::now();
        if let Some(counter) = self.schedule_count.as_ref() {
            counter.add(1);
        }
        let state = self.process_inner(start, time_slice);
        if let Some(counter) = self.driver_total_time.as_ref() {
            counter.add(elapsed_ns(start));
        }
        state
    }

    fn process_inner(&mut self, start: Instant, time_slice: Duration) -> DriverState {
        if self.closed {
            return self.state.clone();
        }
        if !self.prepared {
            return self.finish_with_state(DriverState::Failed(ExecError::internal(
                "driver processed before prepare",
            )));
        }
        if let Some(final_state) = self.pending_finish_state.clone() {
            if self.has_pending_finish() {
                self.state = DriverState::PendingFinish;
                return self.state.clone();
            }
            self.pending_finish_state = None;
            return self.finish_with_state(final_state);
        }

        self.state = DriverState::Running;
        let mut chunks_moved = 0usize;
        loop {
            if let Some(state) = self.check_abort() {
                return self.finish_with_state(state);
            }

            if self.is_finished() {
                return self.finish_normally();
            }

            match self.check_preconditions() {
                Ok(Some(dep)) => return self.block(BlockedReason::Dependency(dep)),
                Ok(None) => {}
                Err(err) => return self.finish_with_state(DriverState::Failed(err)),
            }

            let mut moved = 0usize;
            let mut made_progress = false;
            let step = self
                .propagate_early_finish(&mut made_progress)
                .and_then(|_| self.propagate_edge_closure(&mut made_progress))
                .and_then(|_| self.drive_set_finishing(&mut made_progress))
                .and_then(|_| self.drive_push_edges(&mut moved))
                .and_then(|_| self.drive_pull_edges(&mut moved));
            if let Err(err) = step {
                return self.finish_with_state(DriverState::Failed(err));
            }
            chunks_moved += moved;

            if made_progress || moved > 0 {
                if chunks_moved >= self.yield_max_chunks_moved || start.elapsed() >= time_slice {
                    self.state = DriverState::Ready;
                    return self.state.clone();
                }
                continue;
            }

            if self.is_finished() {
                return self.finish_normally();
            }

            let has_buffered = self.edge_chunks.iter().any(|c| c.is_some());
            if !has_buffered && !self.source_ready() {
                return self.block(BlockedReason::InputEmpty);
            }
            if !self.sink_ready() {
                return self.block(BlockedReason::OutputFull);
            }
            if has_buffered && !self.source_ready() {
                return self.block(BlockedReason::InputEmpty);
            }

            self.state = DriverState::Ready;
            return self.state.clone();
        }
    }

    /// Cancellation or a first error recorded by another driver ends this one.
    fn check_abort(&self) -> Option<DriverState> {
        if self.runtime_state.is_cancelled() {
            return Some(DriverState::Canceled);
        }
        let err = self.runtime_state.error()?;
        if !err.is_cancelled() {
            debug!(
                "driver aborting on fragment error: driver_id={} error={}",
                self.driver_id, err
            );
        }
        Some(DriverState::Canceled)
    }

    /// True when the driver should stop being parked and run to teardown.
    pub(crate) fn should_abort(&self) -> bool {
        self.runtime_state.is_cancelled() || self.runtime_state.error().is_some()
    }

    /// Gate on the first unready precondition; run `set_precondition_ready` once per operator.
    fn check_preconditions(&mut self) -> ExecResult<Option<DependencyHandle>> {
        for idx in 0..self.operators.len() {
            if self.precondition_ready[idx] || self.stages[idx] != OperatorStage::Prepared {
                continue;
            }
            let op = &mut self.operators[idx];
            if let Some(dep) = op.precondition_dependency()
                && !dep.is_ready()
            {
                return Ok(Some(dep));
            }
            op.set_precondition_ready(self.runtime_state.as_ref())?;
            self.precondition_ready[idx] = true;
        }
        Ok(None)
    }

    pub(crate) fn source_ready(&self) -> bool {
        let Some(op) = self.operators.first() else {
            return true;
        };
        op.is_finished() || op.has_output()
    }

    pub(crate) fn sink_ready(&self) -> bool {
        let Some(op) = self.operators.last() else {
            return true;
        };
        op.is_finished() || op.need_input()
    }

    /// Whether a re-admitted driver can make progress now.
    pub(crate) fn check_is_ready(&self) -> bool {
        if self.state == DriverState::PendingFinish {
            return !self.has_pending_finish();
        }
        if self.should_abort() {
            return true;
        }
        match &self.state {
            DriverState::Blocked(reason) => match reason {
                BlockedReason::InputEmpty => {
                    self.source_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
                BlockedReason::OutputFull => {
                    self.sink_ready() || self.is_finished() || self.has_ready_finishing_work()
                }
                BlockedReason::Dependency(dep) => dep.is_ready(),
            },
            _ => true,
        }
    }

    fn has_ready_finishing_work(&self) -> bool {
        (1..self.operators.len()).any(|idx| {
            self.stages[idx] == OperatorStage::Prepared
                && self.edge_closed[idx - 1]
                && self.edge_chunks[idx - 1].is_none()
        }) || self.finished_index().is_some_and(|idx| {
            self.stages[..idx]
                .iter()
                .any(|s| matches!(s, OperatorStage::Prepared | OperatorStage::Finishing))
        })
    }

    pub(crate) fn set_ready(&mut self) {
        self.state = DriverState::Ready;
    }

    fn is_finished(&self) -> bool {
        self.operators
            .last()
            .map(|op| op.is_finished())
            .unwrap_or(true)
    }

    fn finished_index(&self) -> Option<usize> {
        (1..self.operators.len())
            .rev()
            .find(|idx| self.operators[*idx].is_finished())
    }

    fn block(&mut self, reason: BlockedReason) -> DriverState {
        if let BlockedReason::Dependency(dep) = &reason {
            debug!(
                "driver blocked on dependency: finst={:?} driver_id={} dep_name={}",
                self.fragment_instance_id().map(|id| id.to_string()),
                self.driver_id,
                dep.name()
            );
        }
        self.state = DriverState::Blocked(reason);
        self.state.clone()
    }

    /// The sink is done: stop everything upstream, then finish.
    fn finish_normally(&mut self) -> DriverState {
        match self.propagate_early_finish(&mut false) {
            Ok(()) => self.finish_with_state(DriverState::Finished),
            Err(err) => self.finish_with_state(DriverState::Failed(err)),
        }
    }

    fn finish_with_state(&mut self, state: DriverState) -> DriverState {
        match &state {
            DriverState::Canceled => self.cancel_operators(),
            DriverState::Failed(err) => {
                self.runtime_state.set_error(err.clone());
                self.cancel_operators();
            }
            _ => {}
        }
        if state.is_done() && self.pending_finish_state.is_none() && self.has_pending_finish() {
            self.pending_finish_state = Some(state);
            self.state = DriverState::PendingFinish;
            return self.state.clone();
        }
        match &state {
            DriverState::Finished => debug!(
                "driver finished: finst={:?} driver_id={} last_op={}",
                self.fragment_instance_id().map(|id| id.to_string()),
                self.driver_id,
                self.operators.last().map(|op| op.name()).unwrap_or("unknown")
            ),
            DriverState::Canceled => debug!(
                "driver canceled: finst={:?} driver_id={}",
                self.fragment_instance_id().map(|id| id.to_string()),
                self.driver_id
            ),
            DriverState::Failed(err) => error!(
                "driver failed: finst={:?} driver_id={} error={}",
                self.fragment_instance_id().map(|id| id.to_string()),
                self.driver_id,
                err
            ),
            _ => {}
        }
        if state.is_done() {
            self.close_operators();
        }
        self.state = state;
        self.state.clone()
    }

    fn cancel_operators(&mut self) {
        let state = Arc::clone(&self.runtime_state);
        for idx in 0..self.operators.len() {
            if self.stages[idx].check_transition(OperatorStage::Cancelled).is_err() {
                continue;
            }
            if let Err(err) = self.operators[idx].set_cancelled(state.as_ref()) {
                warn!(
                    "operator set_cancelled failed: {}: {}",
                    self.operators[idx].name(),
                    err
                );
            }
            self.stages[idx] = OperatorStage::Cancelled;
        }
        self.release_edge_buffers();
    }

    /// Close every operator in reverse order. Runs at most once.
    pub(crate) fn close_operators(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release_edge_buffers();
        for idx in (0..self.operators.len()).rev() {
            if self.stages[idx] == OperatorStage::Closed {
                continue;
            }
            let op = &mut self.operators[idx];
            let start = Instant::now();
            if let Err(err) = op.close(self.runtime_state.as_ref()) {
                error!("operator close failed: {}: {}", op.name(), err);
            }
            self.stages[idx] = OperatorStage::Closed;
            let ns = elapsed_ns(start);
            if let Some(counters) = self.operator_counters.get(idx) {
                counters.close_time.add(ns);
                counters.operator_total_time.add(ns);
            }
        }
        for idx in 0..self.operator_counters.len() {
            self.update_operator_mem_counters(idx);
        }
    }

    fn release_edge_buffers(&mut self) {
        for chunk in self.edge_chunks.iter_mut() {
            let _ = chunk.take();
        }
    }

    fn update_operator_mem_counters(&self, idx: usize) {
        let (Some(counters), Some(Some(tracker))) =
            (self.operator_counters.get(idx), self.operator_mem_trackers.get(idx))
        else {
            return;
        };
        counters.mem_peak.set(tracker.peak());
        counters.mem_allocated.set(tracker.allocated());
    }

    /// Once an operator finishes, everything upstream of it can stop early.
    fn propagate_early_finish(&mut self, made_progress: &mut bool) -> ExecResult<()> {
        let Some(finished_idx) = self.finished_index() else {
            return Ok(());
        };
        for idx in 0..finished_idx {
            if !matches!(
                self.stages[idx],
                OperatorStage::Prepared | OperatorStage::Finishing
            ) {
                continue;
            }
            self.stages[idx].check_transition(OperatorStage::Finished)?;
            self.operators[idx].set_finished(self.runtime_state.as_ref())?;
            self.stages[idx] = OperatorStage::Finished;
            debug!(
                "driver early finish: driver_id={} op={} downstream={}",
                self.driver_id,
                self.operators[idx].name(),
                self.operators[finished_idx].name()
            );
            *made_progress = true;
        }
        for e in 0..finished_idx {
            if self.edge_chunks[e].take().is_some() {
                *made_progress = true;
            }
            if !self.edge_closed[e] {
                self.edge_closed[e] = true;
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn propagate_edge_closure(&mut self, made_progress: &mut bool) -> ExecResult<()> {
        for e in 0..self.edge_chunks.len() {
            if self.edge_closed[e] || self.edge_chunks[e].is_some() {
                continue;
            }
            if self.operators[e].is_finished() {
                self.edge_closed[e] = true;
                debug!(
                    "driver edge closed: driver_id={} edge={} upstream_op={}",
                    self.driver_id,
                    e,
                    self.operators[e].name()
                );
                *made_progress = true;
            }
        }
        Ok(())
    }

    fn drive_set_finishing(&mut self, made_progress: &mut bool) -> ExecResult<()> {
        for idx in 1..self.operators.len() {
            let in_edge = idx - 1;
            if self.stages[idx] != OperatorStage::Prepared
                || !self.edge_closed[in_edge]
                || self.edge_chunks[in_edge].is_some()
            {
                continue;
            }
            self.stages[idx].check_transition(OperatorStage::Finishing)?;
            let start = Instant::now();
            self.operators[idx].set_finishing(self.runtime_state.as_ref())?;
            self.stages[idx] = OperatorStage::Finishing;
            if let Some(counters) = self.operator_counters.get(idx) {
                let ns = elapsed_ns(start);
                counters.set_finishing_time.add(ns);
                counters.operator_total_time.add(ns);
            }
            debug!(
                "driver set_finishing: driver_id={} op_idx={} op_name={}",
                self.driver_id,
                idx,
                self.operators[idx].name()
            );
            *made_progress = true;
        }
        Ok(())
    }

    /// Hand buffered chunks downstream, sink side first.
    fn drive_push_edges(&mut self, moved: &mut usize) -> ExecResult<()> {
        for e in (0..self.edge_chunks.len()).rev() {
            let downstream_idx = e + 1;
            if self.edge_chunks[e].is_none()
                || self.stages[downstream_idx] != OperatorStage::Prepared
                || !self.operators[downstream_idx].need_input()
            {
                continue;
            }
            let Some(mut chunk) = self.edge_chunks[e].take() else {
                continue;
            };
            if let Some(Some(tracker)) = self.operator_mem_trackers.get(downstream_idx)
                && let Some(owned) = Arc::get_mut(&mut chunk)
            {
                owned.transfer_to(tracker);
            }
            let rows = chunk.num_rows() as i64;
            let start = Instant::now();
            self.operators[downstream_idx].push_chunk(self.runtime_state.as_ref(), chunk)?;
            if let Some(counters) = self.operator_counters.get(downstream_idx) {
                let ns = elapsed_ns(start);
                counters.push_total_time.add(ns);
                counters.operator_total_time.add(ns);
                counters.push_row_num.add(rows);
            }
            self.update_operator_mem_counters(downstream_idx);
            *moved += 1;
        }
        Ok(())
    }

    fn drive_pull_edges(&mut self, moved: &mut usize) -> ExecResult<()> {
        for e in 0..self.edge_chunks.len() {
            if self.edge_chunks[e].is_some() || self.edge_closed[e] {
                continue;
            }
            let (left, right) = self.operators.split_at_mut(e + 1);
            let upstream = &mut left[e];
            let downstream = &right[0];
            if !upstream.has_output() || !downstream.need_input() {
                continue;
            }
            let start = Instant::now();
            let pulled = upstream.pull_chunk(self.runtime_state.as_ref())?;
            if let Some(counters) = self.operator_counters.get(e) {
                let ns = elapsed_ns(start);
                counters.pull_total_time.add(ns);
                counters.operator_total_time.add(ns);
            }
            let Some(chunk) = pulled else {
                continue;
            };
            if chunk.is_empty() {
                continue;
            }
            if let Some(counters) = self.operator_counters.get(e) {
                counters.pull_row_num.add(chunk.num_rows() as i64);
            }
            self.edge_chunks[e] = Some(chunk);
            *moved += 1;
        }
        Ok(())
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        self.close_operators();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::Chunk;
    use crate::exec::pipeline::operator::OperatorBase;
    use crate::exec::pipeline::operator_factory::FactoryRuntimeFilters;
    use arrow::array::{ArrayRef, Int32Array};
    use std::sync::Mutex;

    fn base(name: &str) -> OperatorBase {
        OperatorBase::new(0, 0, name, 0, Vec::new(), Arc::new(FactoryRuntimeFilters::new()))
    }

    fn chunk(values: Vec<i32>) -> ChunkPtr {
        Arc::new(
            Chunk::from_columns(vec![(
                SlotId::new(1),
                Arc::new(Int32Array::from(values)) as ArrayRef,
            )])
            .expect("chunk"),
        )
    }

    struct VecSource {
        base: OperatorBase,
        chunks: Vec<ChunkPtr>,
        fail_prepare: bool,
        closed: Arc<Mutex<Vec<String>>>,
    }

    impl Operator for VecSource {
        fn base(&self) -> &OperatorBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut OperatorBase {
            &mut self.base
        }
        fn prepare(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            if self.fail_prepare {
                return Err(ExecError::internal("prepare failed"));
            }
            Ok(())
        }
        fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            self.closed.lock().expect("lock").push(self.name().to_string());
            Ok(())
        }
        fn has_output(&self) -> bool {
            !self.chunks.is_empty()
        }
        fn need_input(&self) -> bool {
            false
        }
        fn is_finished(&self) -> bool {
            self.chunks.is_empty()
        }
        fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            Ok(())
        }
        fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            self.chunks.clear();
            Ok(())
        }
        fn push_chunk(&mut self, _state: &RuntimeState, _chunk: ChunkPtr) -> ExecResult<()> {
            Err(ExecError::internal("source does not take input"))
        }
        fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
            Ok(if self.chunks.is_empty() {
                None
            } else {
                Some(self.chunks.remove(0))
            })
        }
    }

    struct CollectSink {
        base: OperatorBase,
        rows: Arc<Mutex<usize>>,
        limit: Option<usize>,
        finishing: bool,
        closed: Arc<Mutex<Vec<String>>>,
    }

    impl Operator for CollectSink {
        fn base(&self) -> &OperatorBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut OperatorBase {
            &mut self.base
        }
        fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            self.closed.lock().expect("lock").push(self.name().to_string());
            Ok(())
        }
        fn has_output(&self) -> bool {
            false
        }
        fn need_input(&self) -> bool {
            !self.is_finished()
        }
        fn is_finished(&self) -> bool {
            self.finishing
                || self
                    .limit
                    .is_some_and(|limit| *self.rows.lock().expect("lock") >= limit)
        }
        fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            self.finishing = true;
            Ok(())
        }
        fn push_chunk(&mut self, _state: &RuntimeState, chunk: ChunkPtr) -> ExecResult<()> {
            *self.rows.lock().expect("lock") += chunk.num_rows();
            Ok(())
        }
        fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
            Err(ExecError::internal("sink has no output"))
        }
    }

    struct Harness {
        rows: Arc<Mutex<usize>>,
        closed: Arc<Mutex<Vec<String>>>,
    }

    fn driver(
        chunks: Vec<ChunkPtr>,
        limit: Option<usize>,
        fail_prepare: bool,
        state: Arc<RuntimeState>,
    ) -> (PipelineDriver, Harness) {
        let rows = Arc::new(Mutex::new(0));
        let closed = Arc::new(Mutex::new(Vec::new()));
        let source = VecSource {
            base: base("SOURCE"),
            chunks,
            fail_prepare,
            closed: Arc::clone(&closed),
        };
        let sink = CollectSink {
            base: base("SINK"),
            rows: Arc::clone(&rows),
            limit,
            finishing: false,
            closed: Arc::clone(&closed),
        };
        let driver = PipelineDriver::new(
            0,
            vec![Box::new(source), Box::new(sink)],
            Some(Profiler::new("driver")),
            state,
        );
        (driver, Harness { rows, closed })
    }

    #[test]
    fn moves_all_chunks_and_closes_in_reverse_order() {
        let state = Arc::new(RuntimeState::default());
        let (mut d, h) = driver(vec![chunk(vec![1, 2]), chunk(vec![3])], None, false, state);
        d.prepare().expect("prepare");
        let mut result = d.process(Duration::from_secs(5));
        for _ in 0..10 {
            if result.is_done() {
                break;
            }
            result = d.process(Duration::from_secs(5));
        }
        assert_eq!(result, DriverState::Finished);
        assert_eq!(*h.rows.lock().expect("lock"), 3);
        assert_eq!(*h.closed.lock().expect("lock"), vec!["SINK", "SOURCE"]);
        assert_eq!(d.operator_stage(1), Some(OperatorStage::Closed));
        drop(d);
        assert_eq!(h.closed.lock().expect("lock").len(), 2);
    }

    #[test]
    fn chunk_quota_bounds_one_quantum() {
        let state = Arc::new(RuntimeState::default());
        let chunks = (0..10).map(|i| chunk(vec![i])).collect();
        let (d, h) = driver(chunks, None, false, state);
        let mut d = d.with_yield_max_chunks_moved(2);
        d.prepare().expect("prepare");
        assert_eq!(d.process(Duration::from_secs(5)), DriverState::Ready);
        assert!(*h.rows.lock().expect("lock") < 10);
    }

    #[test]
    fn sink_finishing_early_finishes_upstream() {
        let state = Arc::new(RuntimeState::default());
        let chunks = (0..10).map(|i| chunk(vec![i, i])).collect();
        let (mut d, h) = driver(chunks, Some(3), false, state);
        d.prepare().expect("prepare");
        let mut result = d.process(Duration::from_secs(5));
        while !result.is_done() {
            result = d.process(Duration::from_secs(5));
        }
        assert_eq!(result, DriverState::Finished);
        assert!(*h.rows.lock().expect("lock") < 20);
    }

    #[test]
    fn failed_prepare_closes_every_operator() {
        let state = Arc::new(RuntimeState::default());
        let (mut d, h) = driver(vec![chunk(vec![1])], None, true, state);
        assert!(d.prepare().is_err());
        assert!(d.is_closed());
        assert_eq!(*h.closed.lock().expect("lock"), vec!["SINK", "SOURCE"]);
    }

    #[test]
    fn cancellation_is_observed_at_cycle_start() {
        let state = Arc::new(RuntimeState::default());
        let (mut d, h) = driver(vec![chunk(vec![1])], None, false, Arc::clone(&state));
        d.prepare().expect("prepare");
        state.cancel(ExecError::cancelled("user cancel"));
        assert_eq!(d.process(Duration::from_secs(5)), DriverState::Canceled);
        assert_eq!(*h.rows.lock().expect("lock"), 0);
        assert_eq!(h.closed.lock().expect("lock").len(), 2);
    }
}
