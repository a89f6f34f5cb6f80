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
//! Source half of the distinct streaming pre-aggregation: drains streamed
//! chunks as they arrive, then the hash set once the sink has completed.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::ChunkPtr;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::runtime::profile::CounterUnit;
use crate::runtime::runtime_state::RuntimeState;

use super::aggregator::{Aggregator, AggregatorFactory};

pub struct AggregateDistinctStreamingSourceOperatorFactory {
    base: OperatorFactoryBase,
    aggregator_factory: Arc<AggregatorFactory>,
}

impl AggregateDistinctStreamingSourceOperatorFactory {
    pub fn new(
        id: i32,
        plan_node_id: PlanNodeId,
        aggregator_factory: Arc<AggregatorFactory>,
    ) -> Self {
        Self {
            base: OperatorFactoryBase::new(
                id,
                plan_node_id,
                format!("AGGREGATE_DISTINCT_STREAMING_SOURCE (id={plan_node_id})"),
            ),
            aggregator_factory,
        }
    }
}

impl OperatorFactory for AggregateDistinctStreamingSourceOperatorFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, _dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        let (aggregator, create_error) = match self.aggregator_factory.get_or_create(driver_sequence) {
            Ok(aggregator) => (Some(aggregator), None),
            Err(err) => (None, Some(err)),
        };
        Box::new(AggregateDistinctStreamingSourceOperator {
            base: self.base.new_operator_base(driver_sequence),
            aggregator,
            create_error,
            chunk_size: 0,
            finished: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }

    fn prepare(&self, _state: &RuntimeState) -> ExecResult<()> {
        self.aggregator_factory.validate()
    }

    fn close(&self, _state: &RuntimeState) {
        self.aggregator_factory.close();
    }
}

struct AggregateDistinctStreamingSourceOperator {
    base: OperatorBase,
    aggregator: Option<Arc<Aggregator>>,
    create_error: Option<ExecError>,
    chunk_size: usize,
    finished: bool,
}

impl Operator for AggregateDistinctStreamingSourceOperator {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn prepare(&mut self, state: &RuntimeState) -> ExecResult<()> {
        if let Some(err) = self.create_error.take() {
            return Err(err);
        }
        if self.aggregator.is_none() {
            return Err(ExecError::internal(format!(
                "{} has no aggregator for driver {}",
                self.base.name(),
                self.base.driver_sequence()
            )));
        }
        self.chunk_size = state.chunk_size().max(1);
        Ok(())
    }

    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.aggregator = None;
        Ok(())
    }

    fn has_output(&self) -> bool {
        !self.finished && self.aggregator.as_ref().is_some_and(|agg| agg.has_output())
    }

    fn need_input(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.finished
            || self
                .aggregator
                .as_ref()
                .is_none_or(|agg| agg.is_output_finished())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finished = true;
        if let Some(aggregator) = self.aggregator.as_ref() {
            aggregator.set_finished();
        }
        Ok(())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: ChunkPtr) -> ExecResult<()> {
        Err(ExecError::internal(format!(
            "{} is a source and cannot accept input",
            self.base.name()
        )))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        if self.finished {
            return Ok(None);
        }
        let Some(aggregator) = self.aggregator.as_ref() else {
            return Ok(None);
        };
        let chunk = aggregator.pull_output(self.chunk_size)?;
        if let Some(chunk) = chunk.as_ref()
            && let Some(profiles) = self.base.profiles()
        {
            profiles
                .unique
                .counter_add("OutputRowCount", CounterUnit::Unit, chunk.num_rows() as i64);
        }
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::app_config::StreamingPreaggregationMode;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::Chunk;
    use crate::exec::operators::aggregate::{
        AggregateDistinctStreamingSinkOperatorFactory, AggregatorParams,
    };
    use arrow::array::{ArrayRef, Int64Array};
    use arrow::datatypes::DataType;

    #[test]
    fn early_finish_releases_lane_and_stops_sink() {
        let state = RuntimeState::default().with_chunk_size(2);
        let agg_factory = AggregatorFactory::new(AggregatorParams::new(
            5,
            vec![(SlotId::new(1), DataType::Int64)],
        ));
        let mut sink =
            AggregateDistinctStreamingSinkOperatorFactory::new(1, 5, Arc::clone(&agg_factory))
                .with_mode(StreamingPreaggregationMode::ForcePreaggregation)
                .create(1, 0);
        let source_factory =
            AggregateDistinctStreamingSourceOperatorFactory::new(2, 5, Arc::clone(&agg_factory));
        assert!(source_factory.is_source());
        let mut source = source_factory.create(1, 0);
        sink.prepare(&state).expect("prepare");
        source.prepare(&state).expect("prepare");

        let chunk = Chunk::from_columns(vec![(
            SlotId::new(1),
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5])) as ArrayRef,
        )])
        .expect("chunk");
        sink.push_chunk(&state, Arc::new(chunk)).expect("push");
        sink.set_finishing(&state).expect("finishing");
        assert!(source.has_output());

        let first = source.pull_chunk(&state).expect("pull").expect("chunk");
        assert_eq!(first.num_rows(), 2);
        source.set_finished(&state).expect("finished");
        assert!(source.is_finished());
        assert!(!source.has_output());
        assert!(sink.is_finished());
        assert!(source.pull_chunk(&state).expect("pull").is_none());
    }
}
