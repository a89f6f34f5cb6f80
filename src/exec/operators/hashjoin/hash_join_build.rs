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
//! Hash-join build sink.
//!
//! Responsibilities:
//! - Feeds build-side chunks into its driver's builder.
//! - The last build driver of a builder freezes the table, reports it to the runtime
//!   filter publisher and wakes the probe drivers gated on the build.
//!
//! Key exported interfaces:
//! - Types: `HashJoinBuildOperatorFactory`.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::ChunkPtr;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::novarocks_logging::debug;
use crate::runtime::profile::CounterUnit;
use crate::runtime::runtime_state::RuntimeState;

use super::hash_joiner::HashJoiner;
use super::hash_joiner_factory::HashJoinerFactory;

pub struct HashJoinBuildOperatorFactory {
    base: OperatorFactoryBase,
    joiner_factory: Arc<HashJoinerFactory>,
}

impl HashJoinBuildOperatorFactory {
    pub fn new(id: i32, plan_node_id: PlanNodeId, joiner_factory: Arc<HashJoinerFactory>) -> Self {
        Self {
            base: OperatorFactoryBase::new(
                id,
                plan_node_id,
                format!("HASH_JOIN_BUILD (id={plan_node_id})"),
            ),
            joiner_factory,
        }
    }
}

impl OperatorFactory for HashJoinBuildOperatorFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, _dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        let (builder, create_error) = match self.joiner_factory.get_builder(driver_sequence) {
            Ok(builder) => (Some(builder), None),
            Err(err) => (None, Some(err)),
        };
        Box::new(HashJoinBuildOperator {
            base: self.base.new_operator_base(driver_sequence),
            joiner_factory: Arc::clone(&self.joiner_factory),
            builder,
            create_error,
            finished: false,
        })
    }

    fn close(&self, _state: &RuntimeState) {
        self.joiner_factory.close();
    }
}

struct HashJoinBuildOperator {
    base: OperatorBase,
    joiner_factory: Arc<HashJoinerFactory>,
    builder: Option<Arc<HashJoiner>>,
    create_error: Option<ExecError>,
    finished: bool,
}

impl HashJoinBuildOperator {
    fn builder(&self) -> ExecResult<&Arc<HashJoiner>> {
        self.builder.as_ref().ok_or_else(|| {
            ExecError::internal(format!(
                "{} has no builder for driver {}",
                self.base.name(),
                self.base.driver_sequence()
            ))
        })
    }
}

impl Operator for HashJoinBuildOperator {
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
        let builder = self.builder()?;
        if let Some(tracker) = self.base.mem_tracker() {
            builder.set_mem_tracker(Arc::clone(tracker));
        }
        Ok(())
    }

    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.builder = None;
        Ok(())
    }

    fn has_output(&self) -> bool {
        false
    }

    fn need_input(&self) -> bool {
        !self.finished
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let builder = Arc::clone(self.builder()?);
        if !builder.finish_build_driver() {
            return Ok(());
        }
        builder.build_hash_table()?;
        if let Some(profiles) = self.base.profiles() {
            profiles.unique.counter_set(
                "HashTableMemoryUsage",
                CounterUnit::Bytes,
                builder.hash_table_memory_usage() as i64,
            );
            profiles
                .unique
                .counter_set("BuildRows", CounterUnit::Unit, builder.num_build_rows() as i64);
        }
        self.joiner_factory.rf_publisher().add_builder(&builder)
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if !self.finished {
            debug!("{} finished before its input ended", self.base.name());
        }
        self.finished = true;
        Ok(())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: ChunkPtr) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        self.builder()?.append_build_chunk(chunk)
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        Err(ExecError::internal(format!(
            "{} is a sink and cannot be pulled",
            self.base.name()
        )))
    }
}
