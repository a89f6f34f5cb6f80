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
//! Hash-join probe operator.
//!
//! Holds two joiner references: `prober`, whose probe state this operator drives, and
//! `builder`, which owns the hash table. They are the same joiner for partitioned
//! joins. For broadcast joins every probe driver has its own prober and all of them
//! share one builder; the `builder` reference only keeps the table alive. Both are
//! dropped on `close`, and the table is freed when the last reference goes.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::ChunkPtr;
use crate::exec::pipeline::dependency::DependencyHandle;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::runtime::profile::CounterUnit;
use crate::runtime::runtime_state::RuntimeState;

use super::hash_joiner::HashJoiner;
use super::hash_joiner_factory::HashJoinerFactory;

pub struct HashJoinProbeOperatorFactory {
    base: OperatorFactoryBase,
    joiner_factory: Arc<HashJoinerFactory>,
}

impl HashJoinProbeOperatorFactory {
    pub fn new(id: i32, plan_node_id: PlanNodeId, joiner_factory: Arc<HashJoinerFactory>) -> Self {
        Self {
            base: OperatorFactoryBase::new(
                id,
                plan_node_id,
                format!("HASH_JOIN_PROBE (id={plan_node_id})"),
            ),
            joiner_factory,
        }
    }
}

impl OperatorFactory for HashJoinProbeOperatorFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, _dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        let joiners = self.joiner_factory.create_prober(driver_sequence).and_then(|prober| {
            Ok((prober, self.joiner_factory.get_builder(driver_sequence)?))
        });
        let (prober, builder, create_error) = match joiners {
            Ok((prober, builder)) => (Some(prober), Some(builder), None),
            Err(err) => (None, None, Some(err)),
        };
        Box::new(HashJoinProbeOperator {
            base: self.base.new_operator_base(driver_sequence),
            prober,
            builder,
            create_error,
            finished: false,
        })
    }

    fn close(&self, _state: &RuntimeState) {
        self.joiner_factory.close();
    }
}

struct HashJoinProbeOperator {
    base: OperatorBase,
    prober: Option<Arc<HashJoiner>>,
    builder: Option<Arc<HashJoiner>>,
    /// Why the joiners could not be obtained; reported by `prepare`.
    create_error: Option<ExecError>,
    finished: bool,
}

impl HashJoinProbeOperator {
    /// False until the builder's table is complete.
    fn is_ready(&self) -> bool {
        self.builder.as_ref().is_some_and(|b| b.is_build_done())
    }

    fn joiners(&self) -> ExecResult<(&Arc<HashJoiner>, &Arc<HashJoiner>)> {
        match (self.prober.as_ref(), self.builder.as_ref()) {
            (Some(prober), Some(builder)) => Ok((prober, builder)),
            _ => Err(ExecError::internal(format!(
                "{} has no joiner for driver {}",
                self.base.name(),
                self.base.driver_sequence()
            ))),
        }
    }
}

impl Operator for HashJoinProbeOperator {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn prepare(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if let Some(err) = self.create_error.take() {
            return Err(err);
        }
        self.joiners().map(|_| ())
    }

    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.prober = None;
        self.builder = None;
        Ok(())
    }

    fn precondition_dependency(&self) -> Option<DependencyHandle> {
        if let Some(builder) = self.builder.as_ref()
            && !builder.is_build_done()
        {
            return Some(builder.build_done_dependency());
        }
        self.base.runtime_filter_dependency()
    }

    fn has_output(&self) -> bool {
        !self.finished && self.prober.as_ref().is_some_and(|p| p.has_probe_output())
    }

    fn need_input(&self) -> bool {
        !self.finished && self.is_ready() && self.prober.as_ref().is_some_and(|p| p.probe_need_input())
    }

    fn is_finished(&self) -> bool {
        self.finished || self.prober.as_ref().is_none_or(|p| p.probe_finished())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if let Some(prober) = self.prober.as_ref() {
            prober.probe_eos();
        }
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finished = true;
        if let Some(prober) = self.prober.as_ref() {
            prober.reset_probe();
        }
        Ok(())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: ChunkPtr) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        let rows = chunk.num_rows();
        let (prober, builder) = self.joiners()?;
        prober.push_probe_chunk(builder, chunk)?;
        if let Some(profiles) = self.base.profiles() {
            profiles
                .unique
                .counter_add("ProbeRows", CounterUnit::Unit, rows as i64);
        }
        Ok(())
    }

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        if self.finished {
            return Ok(None);
        }
        let (prober, builder) = self.joiners()?;
        let out = prober.pull_probe_chunk(builder, state.chunk_size())?;
        Ok(out.map(Arc::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::Chunk;
    use crate::exec::operators::hashjoin::{HashJoinerParam, JoinDistributionMode, JoinType};
    use arrow::array::{ArrayRef, Int32Array};
    use arrow::datatypes::DataType;

    fn key_chunk(slot: u32, keys: Vec<i32>) -> ChunkPtr {
        Arc::new(
            Chunk::from_columns(vec![(
                SlotId::new(slot),
                Arc::new(Int32Array::from(keys)) as ArrayRef,
            )])
            .expect("chunk"),
        )
    }

    #[test]
    fn probe_waits_for_build_then_joins() {
        let state = RuntimeState::default();
        let factory = HashJoinerFactory::try_new(
            HashJoinerParam {
                plan_node_id: 3,
                join_type: JoinType::Inner,
                build_keys: vec![(SlotId::new(10), DataType::Int32)],
                probe_key_slots: vec![SlotId::new(1)],
                build_output: vec![(SlotId::new(10), DataType::Int32)],
            },
            JoinDistributionMode::Broadcast,
            1,
            None,
        )
        .expect("factory");
        let probe_factory = HashJoinProbeOperatorFactory::new(2, 3, Arc::clone(&factory));
        let mut probe = probe_factory.create(2, 1);
        probe.prepare(&state).expect("prepare");
        let dep = probe.precondition_dependency().expect("gated");
        assert!(!dep.is_ready());
        assert!(!probe.need_input());

        let builder = factory.get_builder(0).expect("builder");
        builder.append_build_chunk(key_chunk(10, vec![1, 2, 3])).expect("append");
        assert!(builder.finish_build_driver());
        builder.build_hash_table().expect("build");
        assert!(dep.is_ready());
        assert!(probe.precondition_dependency().is_none());
        assert!(probe.need_input());

        probe.push_chunk(&state, key_chunk(1, vec![2, 4, 3])).expect("push");
        let out = probe.pull_chunk(&state).expect("pull").expect("chunk");
        assert_eq!(out.num_rows(), 2);
        probe.set_finishing(&state).expect("finishing");
        assert!(probe.is_finished());
        probe.close(&state).expect("close");
    }

    #[test]
    fn prepare_reports_why_the_builder_is_missing() {
        let state = RuntimeState::default();
        let factory = HashJoinerFactory::try_new(
            HashJoinerParam {
                plan_node_id: 4,
                join_type: JoinType::Inner,
                build_keys: vec![(SlotId::new(10), DataType::Int32)],
                probe_key_slots: vec![SlotId::new(1)],
                build_output: vec![(SlotId::new(10), DataType::Int32)],
            },
            JoinDistributionMode::Partitioned,
            1,
            None,
        )
        .expect("factory");
        let mut probe = HashJoinProbeOperatorFactory::new(2, 4, factory).create(2, 1);
        let err = probe.prepare(&state).expect_err("no builder for lane 1");
        assert!(err.to_string().contains("has no builder for driver 1"), "{err}");
    }
}
