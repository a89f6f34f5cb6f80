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
//! Sink half of the distinct streaming pre-aggregation.
//!
//! Each input chunk is either absorbed into the lane's hash set or streamed
//! straight to the source, depending on the streaming mode:
//! - `ForceStreaming`: duplicates are collapsed within the chunk only.
//! - `ForcePreaggregation`: every key is absorbed.
//! - `Auto`: absorbed while the set has room or growth still pays off;
//!   otherwise rows with known keys stream through and rows with new keys are
//!   held back until a chunk's worth accumulates.

use std::sync::Arc;

use crate::common::app_config::StreamingPreaggregationMode;
use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::novarocks_logging::debug;
use crate::runtime::profile::CounterUnit;
use crate::runtime::runtime_state::RuntimeState;

use super::aggregator::{Aggregator, AggregatorFactory};

pub struct AggregateDistinctStreamingSinkOperatorFactory {
    base: OperatorFactoryBase,
    aggregator_factory: Arc<AggregatorFactory>,
    mode: Option<StreamingPreaggregationMode>,
}

impl AggregateDistinctStreamingSinkOperatorFactory {
    pub fn new(
        id: i32,
        plan_node_id: PlanNodeId,
        aggregator_factory: Arc<AggregatorFactory>,
    ) -> Self {
        Self {
            base: OperatorFactoryBase::new(
                id,
                plan_node_id,
                format!("AGGREGATE_DISTINCT_STREAMING_SINK (id={plan_node_id})"),
            ),
            aggregator_factory,
            mode: None,
        }
    }

    /// Override the mode taken from the runtime state.
    pub fn with_mode(mut self, mode: StreamingPreaggregationMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

impl OperatorFactory for AggregateDistinctStreamingSinkOperatorFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, _dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        let (aggregator, create_error) = match self.aggregator_factory.get_or_create(driver_sequence) {
            Ok(aggregator) => (Some(aggregator), None),
            Err(err) => (None, Some(err)),
        };
        Box::new(AggregateDistinctStreamingSinkOperator {
            base: self.base.new_operator_base(driver_sequence),
            aggregator,
            create_error,
            mode: self.mode.unwrap_or_default(),
            mode_override: self.mode.is_some(),
            chunk_size: 0,
            selection: Vec::new(),
            finished: false,
        })
    }

    fn prepare(&self, _state: &RuntimeState) -> ExecResult<()> {
        self.aggregator_factory.validate()
    }

    fn close(&self, _state: &RuntimeState) {
        self.aggregator_factory.close();
    }
}

struct AggregateDistinctStreamingSinkOperator {
    base: OperatorBase,
    aggregator: Option<Arc<Aggregator>>,
    create_error: Option<ExecError>,
    mode: StreamingPreaggregationMode,
    mode_override: bool,
    chunk_size: usize,
    selection: Vec<u8>,
    finished: bool,
}

impl AggregateDistinctStreamingSinkOperator {
    fn aggregator(&self) -> ExecResult<Arc<Aggregator>> {
        self.aggregator.clone().ok_or_else(|| {
            ExecError::internal(format!(
                "{} has no aggregator for driver {}",
                self.base.name(),
                self.base.driver_sequence()
            ))
        })
    }

    fn push_force_streaming(&mut self, aggregator: &Aggregator, chunk: &Chunk) -> ExecResult<()> {
        let keys = aggregator.evaluate_group_by(chunk)?;
        let output = aggregator.output_chunk_by_streaming(&keys)?;
        aggregator.offer_chunk_to_buffer(output);
        Ok(())
    }

    fn push_force_preaggregation(
        &mut self,
        aggregator: &Aggregator,
        chunk: &Chunk,
    ) -> ExecResult<()> {
        let keys = aggregator.evaluate_group_by(chunk)?;
        aggregator.build_hash_set(&keys)?;
        aggregator.try_convert_to_two_level_set();
        Ok(())
    }

    fn push_auto(&mut self, aggregator: &Aggregator, chunk: &Chunk) -> ExecResult<()> {
        // Held-back rows get another chance in front of the new chunk.
        let keys = aggregator.evaluate_group_by(chunk)?;
        let mut chunk = aggregator.group_by_chunk(keys)?;
        let pending = aggregator.take_pending();
        if !pending.is_empty() {
            let mut parts = pending;
            parts.push(Arc::new(chunk));
            chunk = Chunk::concat(&parts)?.ok_or_else(|| {
                ExecError::internal("concatenating pending rows produced no chunk")
            })?;
        }
        let num_rows = chunk.num_rows();
        let keys = chunk.columns().to_vec();

        let absorb = !aggregator.needs_expansion(num_rows)
            || aggregator.should_expand_preagg_hash_tables(
                aggregator.num_input_rows(),
                num_rows,
                aggregator.hash_set_allocated_memory_usage(),
                aggregator.hash_set_size(),
            );
        if absorb {
            aggregator.build_hash_set(&keys)?;
            aggregator.try_convert_to_two_level_set();
            return Ok(());
        }

        aggregator.build_hash_set_with_selection(&keys, &mut self.selection)?;
        if self.selection.len() != num_rows {
            // Cancelled while probing.
            return Ok(());
        }
        let unmatched = self.selection.iter().filter(|s| **s == 0).count();
        if unmatched == 0 {
            aggregator.offer_chunk_to_buffer(chunk);
        } else if unmatched == num_rows {
            aggregator.add_pending(chunk);
        } else {
            aggregator.offer_chunk_to_buffer(
                aggregator.output_chunk_by_streaming_with_selection(&keys, &self.selection)?,
            );
            aggregator.add_pending(aggregator.unmatched_rows(&keys, &self.selection)?);
        }
        if aggregator.pending_rows() >= self.chunk_size {
            aggregator.flush_pending()?;
        }
        Ok(())
    }
}

impl Operator for AggregateDistinctStreamingSinkOperator {
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
        let aggregator = self.aggregator()?;
        aggregator.prepare(
            self.base.mem_tracker(),
            self.base.profiles().map(|p| p.unique.clone()),
        );
        if !self.mode_override {
            self.mode = state.streaming_preaggregation_mode();
        }
        self.chunk_size = state.chunk_size().max(1);
        debug!(
            "{} prepared: driver={} mode={:?}",
            self.base.name(),
            self.base.driver_sequence(),
            self.mode
        );
        Ok(())
    }

    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.aggregator = None;
        Ok(())
    }

    fn has_output(&self) -> bool {
        false
    }

    fn need_input(&self) -> bool {
        !self.is_finished()
            && self
                .aggregator
                .as_ref()
                .is_some_and(|agg| !agg.is_chunk_buffer_full())
    }

    fn is_finished(&self) -> bool {
        self.finished || self.aggregator.as_ref().is_none_or(|agg| agg.is_stopped())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let aggregator = self.aggregator()?;
        if aggregator.is_stopped() {
            return Ok(());
        }
        aggregator.flush_pending()?;
        if aggregator.hash_set_size() == 0 {
            aggregator.set_ht_eos();
        }
        aggregator.sink_complete();
        debug!(
            "{} input done: driver={} input_rows={} pass_through_rows={} ht_size={}",
            self.base.name(),
            self.base.driver_sequence(),
            aggregator.num_input_rows(),
            aggregator.num_pass_through_rows(),
            aggregator.hash_set_size()
        );
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finished = true;
        if let Some(aggregator) = self.aggregator.as_ref() {
            aggregator.set_finished();
        }
        Ok(())
    }

    fn set_cancelled(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.finished = true;
        if let Some(aggregator) = self.aggregator.as_ref() {
            aggregator.set_cancelled();
        }
        Ok(())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, chunk: ChunkPtr) -> ExecResult<()> {
        let aggregator = self.aggregator()?;
        if self.finished || aggregator.is_stopped() || chunk.is_empty() {
            return Ok(());
        }
        let _timer = self
            .base
            .profiles()
            .map(|p| p.unique.scoped_timer("AggComputeTime"));
        aggregator.update_num_input_rows(chunk.num_rows());
        if let Some(profiles) = self.base.profiles() {
            profiles
                .unique
                .counter_add("InputRowCount", CounterUnit::Unit, chunk.num_rows() as i64);
        }
        match self.mode {
            StreamingPreaggregationMode::ForceStreaming => {
                self.push_force_streaming(&aggregator, &chunk)
            }
            StreamingPreaggregationMode::ForcePreaggregation => {
                self.push_force_preaggregation(&aggregator, &chunk)
            }
            StreamingPreaggregationMode::Auto => self.push_auto(&aggregator, &chunk),
        }
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        Err(ExecError::internal(format!(
            "{} is a sink and cannot be pulled",
            self.base.name()
        )))
    }

    fn reset_state(&mut self, state: &RuntimeState, refill_chunks: Vec<ChunkPtr>) -> ExecResult<()> {
        let aggregator = self.aggregator()?;
        aggregator.reset_state();
        self.finished = false;
        for chunk in refill_chunks {
            self.push_chunk(state, chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::app_config::StreamingHtMinReduction;
    use crate::common::ids::SlotId;
    use crate::exec::operators::aggregate::AggregatorParams;
    use crate::exec::operators::aggregate::AggregateDistinctStreamingSourceOperatorFactory;
    use arrow::array::{Array, ArrayRef, Int64Array};
    use arrow::datatypes::DataType;

    fn chunk(values: Vec<i64>) -> ChunkPtr {
        Arc::new(
            Chunk::from_columns(vec![(
                SlotId::new(1),
                Arc::new(Int64Array::from(values)) as ArrayRef,
            )])
            .expect("chunk"),
        )
    }

    fn values(chunk: &Chunk) -> Vec<i64> {
        let column = chunk.column_by_slot_id(SlotId::new(1)).expect("column");
        column
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64")
            .values()
            .to_vec()
    }

    fn factory(table: Option<Vec<StreamingHtMinReduction>>) -> Arc<AggregatorFactory> {
        let mut params = AggregatorParams::new(3, vec![(SlotId::new(1), DataType::Int64)]);
        if let Some(table) = table {
            params = params.with_streaming_ht_min_reduction(table);
        }
        AggregatorFactory::new(params)
    }

    fn drain(source: &mut Box<dyn Operator>, state: &RuntimeState) -> Vec<i64> {
        let mut out = Vec::new();
        while !source.is_finished() {
            match source.pull_chunk(state).expect("pull") {
                Some(chunk) => out.extend(values(&chunk)),
                None => break,
            }
        }
        out
    }

    #[test]
    fn auto_mode_absorbs_while_reduction_is_high() {
        let state = RuntimeState::default();
        let agg_factory = factory(None);
        let sink_factory = AggregateDistinctStreamingSinkOperatorFactory::new(1, 3, Arc::clone(&agg_factory))
            .with_mode(StreamingPreaggregationMode::Auto);
        let source_factory = AggregateDistinctStreamingSourceOperatorFactory::new(2, 3, Arc::clone(&agg_factory));
        let mut sink = sink_factory.create(1, 0);
        let mut source = source_factory.create(1, 0);
        sink.prepare(&state).expect("prepare sink");
        source.prepare(&state).expect("prepare source");

        sink.push_chunk(&state, chunk(vec![1, 1, 2])).expect("push");
        sink.push_chunk(&state, chunk(vec![1, 3, 3])).expect("push");
        assert!(!source.has_output());
        sink.set_finishing(&state).expect("finishing");
        assert!(sink.is_finished());

        let mut out = drain(&mut source, &state);
        out.sort();
        assert_eq!(out, vec![1, 2, 3]);
        assert!(source.is_finished());
    }

    #[test]
    fn auto_mode_streams_known_keys_when_growth_does_not_pay() {
        let state = RuntimeState::default();
        let table = vec![StreamingHtMinReduction { min_ht_mem: 0, min_reduction: 10.0 }];
        let agg_factory = factory(Some(table));
        let sink_factory = AggregateDistinctStreamingSinkOperatorFactory::new(1, 3, Arc::clone(&agg_factory))
            .with_mode(StreamingPreaggregationMode::Auto);
        let mut sink = sink_factory.create(1, 0);
        sink.prepare(&state).expect("prepare");

        sink.push_chunk(&state, chunk(vec![7])).expect("push");
        let aggregator = agg_factory.get_or_create(0).expect("aggregator");
        assert_eq!(aggregator.hash_set_size(), 1);

        sink.push_chunk(&state, chunk(vec![7, 7, 7])).expect("push");
        assert_eq!(aggregator.hash_set_size(), 1);
        assert_eq!(aggregator.num_pass_through_rows(), 3);
        assert!(aggregator.has_output());
    }

    #[test]
    fn auto_mode_picks_reduction_level_from_allocated_bytes() {
        // Five int64 keys: 8 buckets reserve 173 bytes but only 125 are allocated.
        let state = RuntimeState::default();
        let table = vec![
            StreamingHtMinReduction { min_ht_mem: 0, min_reduction: 0.0 },
            StreamingHtMinReduction { min_ht_mem: 150, min_reduction: 100.0 },
        ];
        let agg_factory = factory(Some(table));
        let mut sink = AggregateDistinctStreamingSinkOperatorFactory::new(1, 3, Arc::clone(&agg_factory))
            .with_mode(StreamingPreaggregationMode::Auto)
            .create(1, 0);
        sink.prepare(&state).expect("prepare");

        sink.push_chunk(&state, chunk(vec![0, 1, 2, 3, 4])).expect("push");
        let aggregator = agg_factory.get_or_create(0).expect("aggregator");
        assert_eq!(aggregator.hash_set_size(), 5);
        assert_eq!(aggregator.hash_set_capacity(), 8);
        assert!(aggregator.hash_set_allocated_memory_usage() < 150);
        assert!(aggregator.needs_expansion(5));

        sink.push_chunk(&state, chunk(vec![5, 6, 7, 8, 9])).expect("push");
        assert_eq!(aggregator.hash_set_size(), 10);
        assert_eq!(aggregator.pending_rows(), 0);
    }

    #[test]
    fn force_streaming_dedups_within_chunk_only() {
        let state = RuntimeState::default();
        let agg_factory = factory(None);
        let mut sink = AggregateDistinctStreamingSinkOperatorFactory::new(1, 3, Arc::clone(&agg_factory))
            .with_mode(StreamingPreaggregationMode::ForceStreaming)
            .create(1, 0);
        let mut source = AggregateDistinctStreamingSourceOperatorFactory::new(2, 3, Arc::clone(&agg_factory))
            .create(1, 0);
        sink.prepare(&state).expect("prepare");
        source.prepare(&state).expect("prepare");
        sink.push_chunk(&state, chunk(vec![4, 4, 5])).expect("push");
        sink.push_chunk(&state, chunk(vec![5, 4])).expect("push");
        sink.set_finishing(&state).expect("finishing");
        assert_eq!(drain(&mut source, &state), vec![4, 5, 5, 4]);
        assert_eq!(agg_factory.get_or_create(0).expect("agg").hash_set_size(), 0);
    }

    #[test]
    fn sink_cannot_be_pulled_and_reset_replays_refill() {
        let state = RuntimeState::default();
        let agg_factory = factory(None);
        let mut sink = AggregateDistinctStreamingSinkOperatorFactory::new(1, 3, Arc::clone(&agg_factory))
            .with_mode(StreamingPreaggregationMode::ForcePreaggregation)
            .create(1, 0);
        sink.prepare(&state).expect("prepare");
        assert!(sink.pull_chunk(&state).is_err());

        sink.push_chunk(&state, chunk(vec![1, 2, 3])).expect("push");
        sink.set_finishing(&state).expect("finishing");
        sink.reset_state(&state, vec![chunk(vec![9, 9])]).expect("reset");
        let aggregator = agg_factory.get_or_create(0).expect("agg");
        assert!(!sink.is_finished());
        assert!(!aggregator.is_sink_complete());
        assert_eq!(aggregator.hash_set_size(), 1);
        assert_eq!(aggregator.num_input_rows(), 2);
    }

    #[test]
    fn prepare_reports_why_the_aggregator_is_missing() {
        let state = RuntimeState::default();
        let agg_factory = AggregatorFactory::new(AggregatorParams::new(5, Vec::new()));
        let mut sink = AggregateDistinctStreamingSinkOperatorFactory::new(1, 5, agg_factory).create(1, 0);
        let err = sink.prepare(&state).expect_err("no grouping keys");
        assert!(err.to_string().contains("has no grouping keys"), "{err}");
    }

    #[test]
    fn cancel_stops_further_input() {
        let state = RuntimeState::default();
        let agg_factory = factory(None);
        let mut sink = AggregateDistinctStreamingSinkOperatorFactory::new(1, 3, Arc::clone(&agg_factory))
            .with_mode(StreamingPreaggregationMode::ForcePreaggregation)
            .create(1, 0);
        sink.prepare(&state).expect("prepare");
        sink.push_chunk(&state, chunk(vec![1, 2])).expect("push");
        sink.set_cancelled(&state).expect("cancel");
        assert!(sink.is_finished());
        sink.push_chunk(&state, chunk(vec![3])).expect("push after cancel");
        assert_eq!(agg_factory.get_or_create(0).expect("agg").hash_set_size(), 0);
    }
}
