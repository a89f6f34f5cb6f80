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
//! VALUES source operator.
//!
//! Responsibilities:
//! - Emits a fixed list of chunks, spread round-robin over the drivers of its pipeline.
//! - Applies its conjuncts, bound runtime in-filters and bloom filters before emitting.
//!
//! Key exported interfaces:
//! - Types: `ValuesSourceFactory`.
//!
//! Current limitations:
//! - Chunks are assigned by position, not by size; drivers may receive uneven row counts.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::expr::ExprContext;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::runtime::runtime_state::RuntimeState;

/// Factory for sources that emit literal chunks.
pub struct ValuesSourceFactory {
    base: OperatorFactoryBase,
    chunks: Vec<ChunkPtr>,
}

impl ValuesSourceFactory {
    pub fn new(id: i32, plan_node_id: PlanNodeId, chunks: Vec<ChunkPtr>) -> Self {
        Self {
            base: OperatorFactoryBase::new(id, plan_node_id, format!("VALUES_SOURCE (id={plan_node_id})")),
            chunks,
        }
    }

    pub fn with_conjuncts(mut self, conjuncts: Vec<ExprContext>) -> Self {
        self.base = self.base.with_conjuncts(conjuncts);
        self
    }
}

impl OperatorFactory for ValuesSourceFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        let dop = dop.max(1) as usize;
        let seq = driver_sequence.max(0) as usize;
        let chunks = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(idx, _)| idx % dop == seq)
            .map(|(_, chunk)| Arc::clone(chunk))
            .collect();
        Box::new(ValuesSourceOperator {
            base: self.base.new_operator_base(driver_sequence),
            chunks,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct ValuesSourceOperator {
    base: OperatorBase,
    chunks: VecDeque<ChunkPtr>,
}

impl Operator for ValuesSourceOperator {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
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
        Err(ExecError::internal("values source does not accept input"))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        let Some(chunk) = self.chunks.pop_front() else {
            return Ok(None);
        };
        let mut chunk: Chunk = Arc::unwrap_or_clone(chunk);
        self.base.eval_conjuncts(&mut chunk)?;
        self.base.eval_runtime_bloom_filters(&mut chunk)?;
        self.base.eval_null_rejecting_filters(&mut chunk)?;
        if chunk.is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(chunk)))
    }
}
