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
//! Operator contract and per-instance state.
//!
//! Responsibilities:
//! - Defines the push/pull and lifecycle contract every operator implements.
//! - Holds the state shared by all operators: identity, memory tracker, profile,
//!   cached conjuncts and the runtime-filter evaluation context.
//!
//! Key exported interfaces:
//! - Types: `Operator`, `OperatorBase`, `OperatorStage`, `BlockedReason`.
//! - Functions: `eval_conjuncts`.
//!
//! Current limitations:
//! - `reset_state` is only implemented by operators that buffer between input partitions.

use std::sync::Arc;

use arrow::array::Array;
use arrow::compute::is_not_null;

use crate::common::config;
use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::expr::ExprContext;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator_factory::FactoryRuntimeFilters;
use crate::exec::runtime_filter::RuntimeBloomFilterEvalContext;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterUnit, OperatorProfiles};
use crate::runtime::runtime_state::RuntimeState;

/// Why a driver cannot make progress right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// The source has nothing to hand out.
    InputEmpty,
    /// The sink cannot take more input.
    OutputFull,
    /// An operator waits for an event such as runtime filters or a finished build side.
    Dependency(DependencyHandle),
}

/// Lifecycle position of one operator instance, tracked by its driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorStage {
    Created,
    Prepared,
    Finishing,
    Finished,
    Cancelled,
    Closed,
}

impl OperatorStage {
    pub(crate) fn check_transition(self, to: OperatorStage) -> ExecResult<()> {
        use OperatorStage::*;
        let allowed = match to {
            Prepared => self == Created,
            Finishing => self == Prepared,
            Finished => matches!(self, Prepared | Finishing),
            Cancelled => matches!(self, Prepared | Finishing | Finished),
            Closed => self != Closed,
            Created => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(ExecError::internal(format!(
                "illegal operator lifecycle transition {:?} -> {:?}",
                self, to
            )))
        }
    }
}

/// One stage of a pipeline. Every call is made by the owning driver's thread.
///
/// Lifecycle: `prepare` once, then any number of `push_chunk`/`pull_chunk`,
/// `set_finishing` once when the input is exhausted, `pending_finish` polled
/// until false, and `close` exactly once. `set_finished` and `set_cancelled`
/// end the operator early; both must be idempotent.
pub trait Operator: Send {
    fn base(&self) -> &OperatorBase;

    fn base_mut(&mut self) -> &mut OperatorBase;

    fn name(&self) -> &str {
        self.base().name()
    }

    fn prepare(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }

    /// Release resources. Must be safe after a failed or skipped `prepare`.
    fn close(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }

    fn has_output(&self) -> bool;

    fn need_input(&self) -> bool;

    fn is_finished(&self) -> bool;

    /// No more input will arrive.
    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()>;

    /// Stop now and drop buffered state; output can no longer be consumed.
    fn set_finished(&mut self, state: &RuntimeState) -> ExecResult<()> {
        self.set_finishing(state)
    }

    fn set_cancelled(&mut self, state: &RuntimeState) -> ExecResult<()> {
        self.set_finished(state)
    }

    /// True while asynchronous work still references fragment resources.
    fn pending_finish(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: ChunkPtr) -> ExecResult<()>;

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<ChunkPtr>>;

    /// Event that must fire before this operator may run.
    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        self.base().runtime_filter_dependency()
    }

    /// Called once after every precondition dependency is ready.
    fn set_precondition_ready(&mut self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        self.base_mut().bind_runtime_in_filters()
    }

    /// Re-initialize for a new input partition, replaying `refill_chunks` as prior output.
    fn reset_state(&mut self, state: &RuntimeState, refill_chunks: Vec<ChunkPtr>) -> ExecResult<()> {
        let _ = (state, refill_chunks);
        Err(ExecError::not_supported(format!(
            "{} does not support reset_state",
            self.name()
        )))
    }
}

/// Per-instance state common to every operator.
pub struct OperatorBase {
    id: i32,
    plan_node_id: PlanNodeId,
    name: String,
    driver_sequence: i32,
    mem_tracker: Option<Arc<MemTracker>>,
    profiles: Option<OperatorProfiles>,
    conjuncts: Vec<ExprContext>,
    cached_conjuncts_and_in_filters: Vec<ExprContext>,
    in_filters_bound: bool,
    runtime_filters: Arc<FactoryRuntimeFilters>,
    bloom_filter_eval_context: Option<RuntimeBloomFilterEvalContext>,
}

impl OperatorBase {
    pub fn new(
        id: i32,
        plan_node_id: PlanNodeId,
        name: impl Into<String>,
        driver_sequence: i32,
        conjuncts: Vec<ExprContext>,
        runtime_filters: Arc<FactoryRuntimeFilters>,
    ) -> Self {
        Self {
            id,
            plan_node_id,
            name: name.into(),
            driver_sequence,
            mem_tracker: None,
            profiles: None,
            cached_conjuncts_and_in_filters: conjuncts.clone(),
            conjuncts,
            in_filters_bound: false,
            runtime_filters,
            bloom_filter_eval_context: None,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn plan_node_id(&self) -> PlanNodeId {
        self.plan_node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_sequence(&self) -> i32 {
        self.driver_sequence
    }

    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(tracker);
    }

    pub fn mem_tracker(&self) -> Option<&Arc<MemTracker>> {
        self.mem_tracker.as_ref()
    }

    pub fn set_profiles(&mut self, profiles: OperatorProfiles) {
        self.profiles = Some(profiles);
    }

    pub fn profiles(&self) -> Option<&OperatorProfiles> {
        self.profiles.as_ref()
    }

    pub fn conjuncts(&self) -> &[ExprContext] {
        &self.conjuncts
    }

    pub fn runtime_filters(&self) -> &Arc<FactoryRuntimeFilters> {
        &self.runtime_filters
    }

    pub fn in_filters_bound(&self) -> bool {
        self.in_filters_bound
    }

    /// Dependency of the first runtime filter in the wait set that has not arrived.
    pub fn runtime_filter_dependency(&self) -> Option<DependencyHandle> {
        self.runtime_filters.pending_dependency()
    }

    /// Append the factory's in-filters to the cached conjunct list. Idempotent.
    pub fn bind_runtime_in_filters(&mut self) -> ExecResult<()> {
        if self.in_filters_bound {
            return Ok(());
        }
        let in_filters = self.runtime_filters.prepare_runtime_in_filters()?;
        self.cached_conjuncts_and_in_filters = self
            .conjuncts
            .iter()
            .chain(in_filters.iter())
            .cloned()
            .collect();
        self.in_filters_bound = true;
        if let Some(profiles) = self.profiles.as_ref() {
            profiles
                .unique
                .counter_set("RuntimeInFilterNum", CounterUnit::Unit, in_filters.len() as i64);
        }
        Ok(())
    }

    /// Evaluate the cached conjuncts, bound in-filters and `conjuncts` over `chunk`.
    ///
    /// The selection vector is written to `filter_out` when given; rows are
    /// removed from `chunk` only when `apply_filter` is set.
    pub fn eval_conjuncts_and_in_filters(
        &self,
        conjuncts: &[ExprContext],
        chunk: &mut Chunk,
        filter_out: Option<&mut Vec<u8>>,
        apply_filter: bool,
    ) -> ExecResult<()> {
        let num_rows = chunk.num_rows();
        let mut selection = vec![1u8; num_rows];
        if num_rows > 0 {
            for expr in self.cached_conjuncts_and_in_filters.iter().chain(conjuncts) {
                and_predicate(expr, chunk, &mut selection)?;
                if selection.iter().all(|v| *v == 0) {
                    break;
                }
            }
        }
        if apply_filter {
            chunk.filter(&selection)?;
            if let Some(profiles) = self.profiles.as_ref() {
                profiles
                    .common
                    .counter_add("ConjunctsInputRows", CounterUnit::Unit, num_rows as i64);
                profiles.common.counter_add(
                    "ConjunctsOutputRows",
                    CounterUnit::Unit,
                    chunk.num_rows() as i64,
                );
            }
        }
        if let Some(out) = filter_out {
            *out = selection;
        }
        Ok(())
    }

    pub fn eval_conjuncts(&self, chunk: &mut Chunk) -> ExecResult<()> {
        self.eval_conjuncts_and_in_filters(&[], chunk, None, true)
    }

    /// Apply the published bloom filters of the factory's probe collector.
    /// Filters that have not arrived yet are skipped.
    pub fn eval_runtime_bloom_filters(&mut self, chunk: &mut Chunk) -> ExecResult<()> {
        let Some(hub) = self.runtime_filters.hub() else {
            return Ok(());
        };
        let Some(collector) = self.runtime_filters.probe_collector() else {
            return Ok(());
        };
        if collector.is_empty() || chunk.is_empty() {
            return Ok(());
        }
        let ctx = self.bloom_filter_eval_context.get_or_insert_with(|| {
            let cfg = config::runtime_filter_config();
            RuntimeBloomFilterEvalContext::new(
                collector.descriptors().len(),
                cfg.bloom_filter_min_selectivity_rows,
                cfg.bloom_filter_skip_pass_ratio,
            )
        });
        let input_rows = chunk.num_rows();
        collector.evaluate(hub, chunk, ctx)?;
        if let Some(profiles) = self.profiles.as_ref() {
            profiles.common.counter_add(
                "JoinRuntimeFilterInputRows",
                CounterUnit::Unit,
                input_rows as i64,
            );
            profiles.common.counter_add(
                "JoinRuntimeFilterOutputRows",
                CounterUnit::Unit,
                chunk.num_rows() as i64,
            );
        }
        Ok(())
    }

    /// Drop rows whose value is null in any of the factory's null-rejecting columns.
    pub fn eval_null_rejecting_filters(&self, chunk: &mut Chunk) -> ExecResult<()> {
        let slots = self.runtime_filters.filter_null_value_columns();
        if slots.is_empty() || chunk.is_empty() {
            return Ok(());
        }
        let mut selection = vec![1u8; chunk.num_rows()];
        let mut any_null = false;
        for slot in slots {
            let Ok(column) = chunk.column_by_slot_id(*slot) else {
                continue;
            };
            if column.null_count() == 0 {
                continue;
            }
            any_null = true;
            let valid = is_not_null(column.as_ref())?;
            for (sel, ok) in selection.iter_mut().zip(valid.values().iter()) {
                if !ok {
                    *sel = 0;
                }
            }
        }
        if any_null {
            chunk.filter(&selection)?;
        }
        Ok(())
    }
}

fn and_predicate(expr: &ExprContext, chunk: &Chunk, selection: &mut [u8]) -> ExecResult<()> {
    let mask = expr.evaluate(chunk)?;
    if mask.len() != selection.len() {
        return Err(ExecError::internal(format!(
            "predicate returned {} rows for a chunk of {}",
            mask.len(),
            selection.len()
        )));
    }
    for (i, sel) in selection.iter_mut().enumerate() {
        if *sel != 0 && !(mask.is_valid(i) && mask.value(i)) {
            *sel = 0;
        }
    }
    Ok(())
}

/// Filter `chunk` in place by every predicate of `conjuncts`.
pub fn eval_conjuncts(conjuncts: &[ExprContext], chunk: &mut Chunk) -> ExecResult<()> {
    if conjuncts.is_empty() || chunk.is_empty() {
        return Ok(());
    }
    let mut selection = vec![1u8; chunk.num_rows()];
    for expr in conjuncts {
        and_predicate(expr, chunk, &mut selection)?;
    }
    chunk.filter(&selection)
}
