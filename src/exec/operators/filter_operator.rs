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
//! Row filter between a source and a sink.
//!
//! Applies the factory conjuncts, bound runtime in-filters, published bloom filters
//! and null-rejecting columns to every input chunk. One chunk is buffered at a time.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::expr::ExprContext;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::runtime::runtime_state::RuntimeState;

/// Factory for filters that drop rows rejected by their predicates.
pub struct FilterOperatorFactory {
    base: OperatorFactoryBase,
}

impl FilterOperatorFactory {
    pub fn new(id: i32, plan_node_id: PlanNodeId, conjuncts: Vec<ExprContext>) -> Self {
        let name = if plan_node_id >= 0 {
            format!("FILTER (id={plan_node_id})")
        } else {
            "FILTER".to_string()
        };
        Self {
            base: OperatorFactoryBase::new(id, plan_node_id, name).with_conjuncts(conjuncts),
        }
    }
}

impl OperatorFactory for FilterOperatorFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, _dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        Box::new(FilterOperator {
            base: self.base.new_operator_base(driver_sequence),
            pending_output: None,
            finishing: false,
            finished: false,
        })
    }
}

struct FilterOperator {
    base: OperatorBase,
    pending_output: Option<ChunkPtr>,
    finishing: bool,
    finished: bool,
}

impl Operator for FilterOperator {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn need_input(&self) -> bool {
        !self.finishing && !self.finished && self.pending_output.is_none()
    }

    fn has_output(&self) -> bool {
        self.pending_output.is_some()
    }

    fn is_finished(&self) -> bool {
        self.finished || (self.finishing && self.pending_output.is_none())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finishing = true;
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finished = true;
        self.pending_output = None;
        Ok(())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: ChunkPtr) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        if self.pending_output.is_some() {
            return Err(ExecError::internal(
                "filter received input while output buffer is full",
            ));
        }
        let mut chunk: Chunk = Arc::unwrap_or_clone(chunk);
        self.base.eval_conjuncts(&mut chunk)?;
        self.base.eval_runtime_bloom_filters(&mut chunk)?;
        self.base.eval_null_rejecting_filters(&mut chunk)?;
        if !chunk.is_empty() {
            self.pending_output = Some(Arc::new(chunk));
        }
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        Ok(self.pending_output.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::expr::{CompareOp, ComparePredicate};
    use arrow::array::{ArrayRef, Int32Array};

    fn chunk(values: Vec<i32>) -> ChunkPtr {
        Arc::new(
            Chunk::from_columns(vec![(
                SlotId::new(1),
                Arc::new(Int32Array::from(values)) as ArrayRef,
            )])
            .expect("chunk"),
        )
    }

    #[test]
    fn filters_and_finishes_after_drain() {
        let state = RuntimeState::default();
        let pred: ExprContext = Arc::new(
            ComparePredicate::try_new(
                SlotId::new(1),
                CompareOp::Ge,
                Arc::new(Int32Array::from(vec![10])) as ArrayRef,
            )
            .expect("predicate"),
        );
        let factory = FilterOperatorFactory::new(1, 2, vec![pred]);
        let mut op = factory.create(1, 0);
        assert!(op.need_input());
        op.push_chunk(&state, chunk(vec![1, 10, 20])).expect("push");
        assert!(!op.need_input());
        assert!(op.push_chunk(&state, chunk(vec![30])).is_err());

        op.set_finishing(&state).expect("finishing");
        assert!(!op.is_finished());
        let out = op.pull_chunk(&state).expect("pull").expect("chunk");
        assert_eq!(out.num_rows(), 2);
        assert!(op.is_finished());
    }

    #[test]
    fn fully_filtered_chunk_produces_nothing() {
        let state = RuntimeState::default();
        let pred: ExprContext = Arc::new(
            ComparePredicate::try_new(
                SlotId::new(1),
                CompareOp::Lt,
                Arc::new(Int32Array::from(vec![0])) as ArrayRef,
            )
            .expect("predicate"),
        );
        let mut op = FilterOperatorFactory::new(1, 2, vec![pred]).create(1, 0);
        op.push_chunk(&state, chunk(vec![1, 2])).expect("push");
        assert!(!op.has_output());
        assert!(op.need_input());
    }
}
