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
//! Integration test for the fragment service entry points and the worker exit flag.

use std::sync::Arc;
use std::time::Duration;

use novarocks_exec::exec::operators::{ChunkQueue, ChunkQueueSourceFactory, ResultSinkFactory};
use novarocks_exec::exec::pipeline::fragment_executor::{FragmentExecParams, fragment_mgr};
use novarocks_exec::exec::pipeline::pipeline::Pipeline;
use novarocks_exec::exec::runtime_filter::RuntimeFilterHub;
use novarocks_exec::runtime::exec_env;
use novarocks_exec::runtime::result_buffer::ResultBuffer;
use novarocks_exec::{ExecError, UniqueId, cancel_plan_fragment, exec_plan_fragment};

use crate::common::{int64_chunk, non_null_values, setup, unique_id, wait_for};

mod common;

const WAIT: Duration = Duration::from_secs(10);

fn queue_fragment(
    finst: UniqueId,
    queue: &Arc<ChunkQueue>,
    buffer: &Arc<ResultBuffer>,
) -> FragmentExecParams {
    let pipeline = Pipeline::new(
        0,
        vec![
            Box::new(ChunkQueueSourceFactory::new(1, 1, vec![Arc::clone(queue)])),
            Box::new(ResultSinkFactory::new(2, 2, Arc::clone(buffer))),
        ],
        1,
    )
    .expect("pipeline");
    let mut params = FragmentExecParams::new(
        unique_id("service_test_query"),
        finst,
        vec![pipeline],
        Arc::new(RuntimeFilterHub::new()),
    );
    params.result_buffer = Some(Arc::clone(buffer));
    params
}

#[test]
fn service_requests_follow_the_exit_flag() {
    setup();
    exec_env::init();

    // A fragment runs to completion.
    let finst = unique_id("service_completes");
    let queue = ChunkQueue::new(4);
    assert!(queue.push(int64_chunk(1, vec![1, 2, 3])));
    queue.close();
    let buffer = Arc::new(ResultBuffer::new(finst, 8));
    let ctx = exec_plan_fragment(queue_fragment(finst, &queue, &buffer))
        .expect("exec")
        .expect("started");
    let chunks = buffer.drain(WAIT).expect("drain");
    assert_eq!(non_null_values(&chunks, 1), vec![1, 2, 3]);
    assert_eq!(ctx.wait_for_completion_timeout(WAIT), Some(Ok(())));

    // A repeated request for a running instance is accepted without starting anything.
    let finst = unique_id("service_duplicate");
    let queue = ChunkQueue::new(4);
    let buffer = Arc::new(ResultBuffer::new(finst, 8));
    let ctx = exec_plan_fragment(queue_fragment(finst, &queue, &buffer))
        .expect("exec")
        .expect("started");
    let again =
        exec_plan_fragment(queue_fragment(finst, &queue, &buffer)).expect("duplicate is ok");
    assert!(again.is_none());
    assert!(fragment_mgr().contains(finst));

    assert_eq!(cancel_plan_fragment(finst, None), Ok(true));
    let status = ctx.wait_for_completion_timeout(WAIT).expect("finished");
    assert!(status.is_err_and(|e| e.is_cancelled()));
    assert!(wait_for(|| !fragment_mgr().contains(finst), WAIT));
    assert_eq!(cancel_plan_fragment(finst, None), Ok(false));

    // Once the worker is exiting every request fails fast.
    exec_env::set_process_exiting();
    let finst = unique_id("service_exiting");
    let queue = ChunkQueue::new(4);
    let buffer = Arc::new(ResultBuffer::new(finst, 8));
    let err = exec_plan_fragment(queue_fragment(finst, &queue, &buffer))
        .err()
        .expect("rejected");
    assert!(matches!(err, ExecError::ServiceUnavailable(_)));
    assert!(!fragment_mgr().contains(finst));
    let err = cancel_plan_fragment(finst, Some(ExecError::cancelled("late")))
        .err()
        .expect("rejected");
    assert!(matches!(err, ExecError::ServiceUnavailable(_)));

    exec_env::init();
    assert_eq!(cancel_plan_fragment(finst, None), Ok(false));
}
