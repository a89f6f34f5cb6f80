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
//! Integration tests for hash join: table lifetime across drivers and each join type
//! run end to end through the driver executor.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arrow::datatypes::DataType;

use novarocks_exec::common::ids::SlotId;
use novarocks_exec::exec::chunk::ChunkPtr;
use novarocks_exec::exec::operators::{
    HashJoinBuildOperatorFactory, HashJoinProbeOperatorFactory, HashJoinerFactory, HashJoinerParam,
    JoinDistributionMode, JoinType, ResultSinkFactory, ValuesSourceFactory,
};
use novarocks_exec::exec::pipeline::fragment_executor::{
    FragmentExecParams, FragmentExecutor, FragmentManager,
};
use novarocks_exec::exec::pipeline::global_driver_executor::GlobalDriverExecutor;
use novarocks_exec::exec::pipeline::operator_factory::{OperatorFactory, RowDescriptor};
use novarocks_exec::exec::pipeline::pipeline::Pipeline;
use novarocks_exec::exec::runtime_filter::{
    RuntimeFilterHub, RuntimeFilterProbeCollector, RuntimeFilterProbeDescriptor,
};
use novarocks_exec::runtime::mem_tracker::MemTracker;
use novarocks_exec::runtime::result_buffer::ResultBuffer;
use novarocks_exec::runtime::runtime_state::RuntimeState;

use crate::common::{column_values, pair_chunk, setup, unique_id, wait_for};

mod common;

const JOIN_NODE: i32 = 5;
const PROBE_KEY: u32 = 1;
const PROBE_PAYLOAD: u32 = 2;
const BUILD_KEY: u32 = 10;
const BUILD_VALUE: u32 = 11;

fn join_param(join_type: JoinType) -> HashJoinerParam {
    HashJoinerParam {
        plan_node_id: JOIN_NODE,
        join_type,
        build_keys: vec![(SlotId::new(BUILD_KEY), DataType::Int64)],
        probe_key_slots: vec![SlotId::new(PROBE_KEY)],
        build_output: vec![(SlotId::new(BUILD_VALUE), DataType::Int64)],
    }
}

fn build_rows() -> ChunkPtr {
    pair_chunk(
        (BUILD_KEY, BUILD_VALUE),
        vec![(1, 100), (2, 200), (2, 201), (4, 400)],
    )
}

fn probe_chunks() -> Vec<ChunkPtr> {
    vec![
        pair_chunk((PROBE_KEY, PROBE_PAYLOAD), vec![(1, 10), (3, 30)]),
        pair_chunk((PROBE_KEY, PROBE_PAYLOAD), vec![(2, 20), (5, 50)]),
    ]
}

#[test]
fn broadcast_table_outlives_builder_until_last_prober_closes() {
    setup();
    let state = RuntimeState::default();
    let root = MemTracker::new_root("hash join lifetime");
    let factory = HashJoinerFactory::try_new(
        join_param(JoinType::Inner),
        JoinDistributionMode::Broadcast,
        1,
        None,
    )
    .expect("factory");
    let weak = Arc::downgrade(&factory.get_builder(0).expect("builder"));

    let build_factory = HashJoinBuildOperatorFactory::new(1, JOIN_NODE, Arc::clone(&factory));
    let probe_factory = HashJoinProbeOperatorFactory::new(2, JOIN_NODE, Arc::clone(&factory));

    let mut build = build_factory.create(1, 0);
    build
        .base_mut()
        .set_mem_tracker(MemTracker::new_child("build", &root));
    build.prepare(&state).expect("prepare build");
    build.push_chunk(&state, build_rows()).expect("push build");
    build.set_finishing(&state).expect("finish build");
    assert!(build.is_finished());
    assert!(root.current() > 0);

    let mut probers = (0..2)
        .map(|seq| {
            let mut op = probe_factory.create(2, seq);
            op.prepare(&state).expect("prepare probe");
            op
        })
        .collect::<Vec<_>>();
    assert!(probers.iter().all(|op| op.need_input()));

    build.close(&state).expect("close build");
    drop(build);
    build_factory.close(&state);
    assert!(weak.upgrade().is_some());

    let mut first = probers.remove(0);
    first
        .push_chunk(&state, pair_chunk((PROBE_KEY, PROBE_PAYLOAD), vec![(2, 20)]))
        .expect("push probe");
    let out = first.pull_chunk(&state).expect("pull").expect("joined rows");
    assert_eq!(out.num_rows(), 2);
    first.close(&state).expect("close probe");
    assert!(weak.upgrade().is_some());
    assert!(root.current() > 0);

    let mut last = probers.remove(0);
    last.close(&state).expect("close probe");
    drop(last);
    drop(first);
    assert!(weak.upgrade().is_none());
    assert_eq!(root.current(), 0);
}

/// Run build and probe pipelines of one join as a single fragment and collect
/// (payload, build value) pairs, sorted.
fn run_join(
    name: &str,
    join_type: JoinType,
) -> (Vec<(Option<i64>, Option<i64>)>, Arc<RuntimeFilterHub>) {
    setup();
    let finst = unique_id(name);
    let hub = Arc::new(RuntimeFilterHub::new());
    let factory = HashJoinerFactory::try_new(
        join_param(join_type),
        JoinDistributionMode::Broadcast,
        1,
        Some(Arc::clone(&hub)),
    )
    .expect("joiner factory");

    let build = Pipeline::new(
        0,
        vec![
            Box::new(ValuesSourceFactory::new(1, 20, vec![build_rows()])),
            Box::new(HashJoinBuildOperatorFactory::new(2, JOIN_NODE, Arc::clone(&factory))),
        ],
        1,
    )
    .expect("build pipeline");

    let probe_source = ValuesSourceFactory::new(3, 21, probe_chunks());
    if join_type.supports_runtime_filters() {
        probe_source
            .runtime_filters()
            .init_runtime_filter(
                Arc::clone(&hub),
                BTreeSet::from([JOIN_NODE]),
                RowDescriptor::new(vec![SlotId::new(PROBE_KEY), SlotId::new(PROBE_PAYLOAD)]),
                RuntimeFilterProbeCollector::new(vec![RuntimeFilterProbeDescriptor::new(
                    JOIN_NODE,
                    SlotId::new(PROBE_KEY),
                )]),
                Vec::new(),
                Vec::new(),
            )
            .expect("wire runtime filters");
    }
    let buffer = Arc::new(ResultBuffer::new(finst, 64));
    let probe = Pipeline::new(
        1,
        vec![
            Box::new(probe_source),
            Box::new(HashJoinProbeOperatorFactory::new(4, JOIN_NODE, Arc::clone(&factory))),
            Box::new(ResultSinkFactory::new(5, 22, Arc::clone(&buffer))),
        ],
        2,
    )
    .expect("probe pipeline");

    let mut params = FragmentExecParams::new(
        unique_id("hash_join_query"),
        finst,
        vec![build, probe],
        Arc::clone(&hub),
    );
    params.result_buffer = Some(Arc::clone(&buffer));
    let mgr = Arc::new(FragmentManager::new());
    let executor = GlobalDriverExecutor::new(2);
    let ctx = FragmentExecutor::prepare(&mgr, params)
        .expect("prepare")
        .execute(&executor)
        .expect("execute");

    let chunks = buffer.drain(Duration::from_secs(10)).expect("drain results");
    let status = ctx
        .wait_for_completion_timeout(Duration::from_secs(10))
        .expect("fragment finished");
    assert_eq!(status, Ok(()));
    assert!(wait_for(|| !mgr.contains(finst), Duration::from_secs(5)));
    executor.shutdown();

    let payloads = column_values(&chunks, PROBE_PAYLOAD);
    let values = if join_type.emits_build_columns() {
        column_values(&chunks, BUILD_VALUE)
    } else {
        vec![None; payloads.len()]
    };
    let mut rows = payloads.into_iter().zip(values).collect::<Vec<_>>();
    rows.sort();
    (rows, hub)
}

#[test]
fn inner_join_emits_every_match() {
    let (rows, hub) = run_join("inner_join_emits_every_match", JoinType::Inner);
    assert_eq!(
        rows,
        vec![
            (Some(10), Some(100)),
            (Some(20), Some(200)),
            (Some(20), Some(201)),
        ]
    );
    assert!(hub.is_ready(JOIN_NODE));
    assert_eq!(hub.in_filters(JOIN_NODE).len(), 1);
}

#[test]
fn left_outer_join_pads_unmatched_probe_rows() {
    let (rows, hub) = run_join("left_outer_join_pads_unmatched_probe_rows", JoinType::LeftOuter);
    assert_eq!(
        rows,
        vec![
            (Some(10), Some(100)),
            (Some(20), Some(200)),
            (Some(20), Some(201)),
            (Some(30), None),
            (Some(50), None),
        ]
    );
    assert!(hub.is_ready(JOIN_NODE));
    assert!(hub.get(JOIN_NODE).expect("published").is_empty());
}

#[test]
fn left_semi_join_emits_each_matching_probe_row_once() {
    let (rows, _) = run_join("left_semi_join_emits_each_matching_probe_row_once", JoinType::LeftSemi);
    assert_eq!(rows, vec![(Some(10), None), (Some(20), None)]);
}

#[test]
fn left_anti_join_keeps_only_unmatched_probe_rows() {
    let (rows, _) = run_join("left_anti_join_keeps_only_unmatched_probe_rows", JoinType::LeftAnti);
    assert_eq!(rows, vec![(Some(30), None), (Some(50), None)]);
}
