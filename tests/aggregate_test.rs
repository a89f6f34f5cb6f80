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
//! Integration tests for the distinct streaming pre-aggregation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arrow::datatypes::DataType;
use proptest::prelude::*;

use novarocks_exec::common::ids::SlotId;
use novarocks_exec::exec::chunk::ChunkPtr;
use novarocks_exec::exec::operators::{
    AggregateDistinctStreamingSinkOperatorFactory, AggregateDistinctStreamingSourceOperatorFactory,
    Aggregator, AggregatorFactory, AggregatorParams,
};
use novarocks_exec::exec::pipeline::operator::Operator;
use novarocks_exec::exec::pipeline::operator_factory::OperatorFactory;
use novarocks_exec::novarocks_config::{StreamingHtMinReduction, StreamingPreaggregationMode};
use novarocks_exec::runtime::mem_tracker::MemTracker;
use novarocks_exec::runtime::runtime_state::RuntimeState;

use crate::common::{int64_chunk, non_null_values, setup};

mod common;

const KEY_SLOT: u32 = 1;
const AGG_NODE: i32 = 7;

fn reduction_table(min_reduction: f64) -> Vec<StreamingHtMinReduction> {
    vec![StreamingHtMinReduction {
        min_ht_mem: 0,
        min_reduction,
    }]
}

/// One sink/source pair sharing a lane, driven by hand.
struct Lane {
    state: RuntimeState,
    factory: Arc<AggregatorFactory>,
    sink: Box<dyn Operator>,
    source: Box<dyn Operator>,
    tracker: Arc<MemTracker>,
}

impl Lane {
    fn new(
        mode: StreamingPreaggregationMode,
        table: Option<Vec<StreamingHtMinReduction>>,
        chunk_size: usize,
    ) -> Self {
        setup();
        let mut params = AggregatorParams::new(AGG_NODE, vec![(SlotId::new(KEY_SLOT), DataType::Int64)]);
        if let Some(table) = table {
            params = params.with_streaming_ht_min_reduction(table);
        }
        let factory = AggregatorFactory::new(params);
        let sink_factory =
            AggregateDistinctStreamingSinkOperatorFactory::new(1, AGG_NODE, Arc::clone(&factory))
                .with_mode(mode);
        let source_factory =
            AggregateDistinctStreamingSourceOperatorFactory::new(2, AGG_NODE, Arc::clone(&factory));
        let state = RuntimeState::default().with_chunk_size(chunk_size);
        let tracker = MemTracker::new_root("aggregate lane");
        let mut sink = sink_factory.create(1, 0);
        let mut source = source_factory.create(1, 0);
        sink.base_mut()
            .set_mem_tracker(MemTracker::new_child("sink", &tracker));
        sink.prepare(&state).expect("prepare sink");
        source.prepare(&state).expect("prepare source");
        Self {
            state,
            factory,
            sink,
            source,
            tracker,
        }
    }

    fn aggregator(&self) -> Arc<Aggregator> {
        self.factory.get_or_create(0).expect("aggregator")
    }

    fn push(&mut self, values: Vec<i64>) {
        self.sink
            .push_chunk(&self.state, int64_chunk(KEY_SLOT, values))
            .expect("push");
    }

    /// Whatever the source can emit right now.
    fn drain(&mut self) -> Vec<ChunkPtr> {
        let mut out = Vec::new();
        while let Some(chunk) = self.source.pull_chunk(&self.state).expect("pull") {
            out.push(chunk);
        }
        out
    }

    fn finish(&mut self) -> Vec<ChunkPtr> {
        self.sink.set_finishing(&self.state).expect("finishing");
        let out = self.drain();
        assert!(self.source.is_finished());
        out
    }
}

fn sorted(values: Vec<i64>) -> Vec<i64> {
    let mut values = values;
    values.sort();
    values
}

#[test]
fn auto_mode_with_ample_capacity_absorbs_everything() {
    let mut lane = Lane::new(StreamingPreaggregationMode::Auto, None, 4096);
    lane.push(vec![1, 1, 2]);
    lane.push(vec![1, 3, 3]);

    let aggregator = lane.aggregator();
    assert_eq!(aggregator.num_pass_through_rows(), 0);
    assert_eq!(aggregator.streaming_buffer_len(), 0);
    assert_eq!(aggregator.hash_set_size(), 3);
    assert!(lane.drain().is_empty());

    let out = lane.finish();
    assert_eq!(sorted(non_null_values(&out, KEY_SLOT)), vec![1, 2, 3]);
    assert_eq!(lane.tracker.current(), 0);
}

#[test]
fn auto_mode_streams_known_keys_when_reduction_is_low() {
    let mut lane = Lane::new(StreamingPreaggregationMode::Auto, Some(reduction_table(10.0)), 4096);
    lane.push(vec![42]);
    let aggregator = lane.aggregator();
    assert_eq!(aggregator.hash_set_size(), 1);
    let capacity = aggregator.hash_set_capacity();

    lane.push(vec![42, 42, 42]);
    assert_eq!(aggregator.hash_set_size(), 1);
    assert_eq!(aggregator.hash_set_capacity(), capacity);
    let streamed = lane.drain();
    assert_eq!(streamed.len(), 1);
    assert_eq!(non_null_values(&streamed, KEY_SLOT), vec![42, 42, 42]);

    let rest = lane.finish();
    assert_eq!(non_null_values(&rest, KEY_SLOT), vec![42]);
}

#[test]
fn auto_mode_holds_back_rows_with_only_new_keys() {
    let mut lane = Lane::new(StreamingPreaggregationMode::Auto, Some(reduction_table(1000.0)), 4);
    lane.push(vec![1]);
    let aggregator = lane.aggregator();

    lane.push(vec![2, 3, 4]);
    assert_eq!(aggregator.hash_set_size(), 1);
    assert_eq!(aggregator.pending_rows(), 3);
    assert!(lane.drain().is_empty());

    // Held rows are re-decided with the next chunk and flushed once a chunk's worth is held.
    lane.push(vec![1, 5]);
    assert_eq!(aggregator.pending_rows(), 0);
    let streamed = lane.drain();
    assert_eq!(sorted(non_null_values(&streamed, KEY_SLOT)), vec![1, 2, 3, 4, 5]);

    lane.push(vec![6, 6]);
    assert_eq!(aggregator.pending_rows(), 2);
    let rest = lane.finish();
    assert_eq!(sorted(non_null_values(&rest, KEY_SLOT)), vec![1, 6]);
}

#[test]
fn expansion_is_required_exactly_at_real_capacity() {
    let lane = Lane::new(StreamingPreaggregationMode::ForcePreaggregation, None, 4096);
    let aggregator = lane.aggregator();
    let keys = |values: Vec<i64>| {
        let chunk = int64_chunk(KEY_SLOT, values);
        aggregator.evaluate_group_by(&chunk).expect("keys")
    };

    aggregator.build_hash_set(&keys((0..6).collect())).expect("build");
    assert_eq!(aggregator.hash_set_capacity(), 8);
    assert!(!aggregator.needs_expansion(1));
    assert!(aggregator.needs_expansion(2));

    aggregator.build_hash_set(&keys(vec![6])).expect("build");
    assert_eq!(aggregator.hash_set_size(), 7);
    // size == real capacity (8 - 8/8): nothing fits anymore.
    assert!(aggregator.needs_expansion(0));
    assert!(aggregator.needs_expansion(1));
}

#[test]
fn force_streaming_keeps_no_history_between_chunks() {
    let mut lane = Lane::new(StreamingPreaggregationMode::ForceStreaming, None, 4096);
    lane.push(vec![5, 3, 5, 3, 9]);
    let first = lane.drain();
    lane.push(vec![5, 3, 5, 3, 9]);
    let second = lane.drain();

    assert_eq!(non_null_values(&first, KEY_SLOT), vec![5, 3, 9]);
    assert_eq!(non_null_values(&first, KEY_SLOT), non_null_values(&second, KEY_SLOT));
    assert_eq!(lane.aggregator().hash_set_size(), 0);
    assert!(lane.finish().is_empty());
}

#[test]
fn cancel_during_push_leaves_consistent_state() {
    let lane = Lane::new(StreamingPreaggregationMode::ForcePreaggregation, None, 4096);
    let Lane {
        state,
        factory,
        mut sink,
        source: _source,
        tracker,
    } = lane;
    let aggregator = factory.get_or_create(0).expect("aggregator");

    let pusher = thread::spawn(move || {
        for batch in 0..200i64 {
            let values = (batch * 64..batch * 64 + 64).collect();
            sink.push_chunk(&state, int64_chunk(KEY_SLOT, values))
                .expect("push");
        }
        sink
    });
    thread::sleep(Duration::from_millis(1));
    aggregator.set_cancelled();
    let sink = pusher.join().expect("pusher thread");

    assert!(aggregator.is_stopped());
    assert!(sink.is_finished());
    assert_eq!(aggregator.hash_set_size(), 0);
    assert_eq!(tracker.current(), 0);
    assert!(!aggregator.has_output());
}

#[test]
fn memory_limit_surfaces_as_alloc_failure() {
    setup();
    let params = AggregatorParams::new(AGG_NODE, vec![(SlotId::new(KEY_SLOT), DataType::Int64)]);
    let factory = AggregatorFactory::new(params);
    let state = RuntimeState::default();
    let mut sink = AggregateDistinctStreamingSinkOperatorFactory::new(1, AGG_NODE, Arc::clone(&factory))
        .with_mode(StreamingPreaggregationMode::ForcePreaggregation)
        .create(1, 0);
    sink.base_mut()
        .set_mem_tracker(MemTracker::new_root_with_limit("tiny", 256));
    sink.prepare(&state).expect("prepare");
    let err = sink
        .push_chunk(&state, int64_chunk(KEY_SLOT, (0..10_000).collect()))
        .expect_err("limit exceeded");
    assert!(err.is_mem_alloc_failed());
    sink.close(&state).expect("close");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn auto_mode_output_covers_input_without_duplicate_keys(
        chunks in prop::collection::vec(prop::collection::vec(0i64..40, 1..24), 1..12),
        min_reduction in 0.0f64..4.0,
        chunk_size in 1usize..16,
        drain_every in 1usize..4,
    ) {
        let mut lane = Lane::new(
            StreamingPreaggregationMode::Auto,
            Some(vec![
                StreamingHtMinReduction { min_ht_mem: 0, min_reduction: 0.0 },
                StreamingHtMinReduction { min_ht_mem: 64, min_reduction },
            ]),
            chunk_size,
        );
        let aggregator = lane.aggregator();
        let mut expected = BTreeSet::new();
        let mut streamed = Vec::new();
        for (idx, values) in chunks.into_iter().enumerate() {
            expected.extend(values.iter().copied());
            lane.push(values);
            if idx % drain_every == 0 {
                streamed.extend(non_null_values(&lane.drain(), KEY_SLOT));
            }
        }
        aggregator.flush_pending().expect("flush");
        streamed.extend(non_null_values(&lane.drain(), KEY_SLOT));
        let ht_size = aggregator.hash_set_size();

        let from_hash_set = non_null_values(&lane.finish(), KEY_SLOT);
        prop_assert_eq!(from_hash_set.len(), ht_size);
        let distinct = from_hash_set.iter().copied().collect::<BTreeSet<_>>();
        prop_assert_eq!(distinct.len(), from_hash_set.len());

        let mut seen = distinct;
        seen.extend(streamed);
        prop_assert_eq!(seen, expected);
        prop_assert_eq!(lane.tracker.current(), 0);
    }
}
