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
//! Result sink handing query output to the client-facing `ResultBuffer`.
//!
//! Responsibilities:
//! - Appends every input chunk to the fragment's result buffer.
//! - Applies backpressure: `need_input` is false while the buffer is full.
//!
//! Key exported interfaces:
//! - Types: `ResultSinkFactory`.
//!
//! Current limitations:
//! - The buffer is closed by the fragment on completion, not by the sink, so the final
//!   status reaches the client even when a sibling driver failed.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::ExecResult;
use crate::exec::chunk::ChunkPtr;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::runtime::profile::CounterUnit;
use crate::runtime::result_buffer::ResultBuffer;
use crate::runtime::runtime_state::RuntimeState;

/// Factory for result sinks that append output chunks to query result buffers.
pub struct ResultSinkFactory {
    base: OperatorFactoryBase,
    buffer: Arc<ResultBuffer>,
}

impl ResultSinkFactory {
    pub fn new(id: i32, plan_node_id: PlanNodeId, buffer: Arc<ResultBuffer>) -> Self {
        let name = format!("RESULT_SINK (plan_node_id={plan_node_id})");
        Self {
            base: OperatorFactoryBase::new(id, plan_node_id, name),
            buffer,
        }
    }

    pub fn buffer(&self) -> &Arc<ResultBuffer> {
        &self.buffer
    }
}

impl OperatorFactory for ResultSinkFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, _dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        Box::new(ResultSinkOperator {
            base: self.base.new_operator_base(driver_sequence),
            buffer: Arc::clone(&self.buffer),
            finished: false,
        })
    }
}

struct ResultSinkOperator {
    base: OperatorBase,
    buffer: Arc<ResultBuffer>,
    finished: bool,
}

impl Operator for ResultSinkOperator {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn need_input(&self) -> bool {
        !self.finished && !self.buffer.is_full()
    }

    fn has_output(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finished = true;
        Ok(())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: ChunkPtr) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        if let Some(profiles) = self.base.profiles() {
            profiles
                .unique
                .counter_add("SentRows", CounterUnit::Unit, chunk.num_rows() as i64);
        }
        self.buffer.add_chunk(chunk);
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::common::types::UniqueId;
    use crate::exec::chunk::Chunk;
    use arrow::array::{ArrayRef, Int32Array};
    use std::time::Duration;

    #[test]
    fn full_buffer_blocks_input() {
        let state = RuntimeState::default();
        let buffer = Arc::new(ResultBuffer::new(UniqueId::new(1, 2), 1));
        let mut op = ResultSinkFactory::new(1, 3, Arc::clone(&buffer)).create(1, 0);
        let chunk: ChunkPtr = Arc::new(
            Chunk::from_columns(vec![(
                SlotId::new(1),
                Arc::new(Int32Array::from(vec![1, 2])) as ArrayRef,
            )])
            .expect("chunk"),
        );
        assert!(op.need_input());
        op.push_chunk(&state, chunk).expect("push");
        assert!(!op.need_input());

        let fetched = buffer.fetch(Duration::from_secs(1)).expect("fetch");
        assert_eq!(fetched.map(|c| c.num_rows()), Some(2));
        assert!(op.need_input());
        op.set_finishing(&state).expect("finishing");
        assert!(op.is_finished());
        assert!(!op.need_input());
    }
}
