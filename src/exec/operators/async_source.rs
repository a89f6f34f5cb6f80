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
//! Source that reads from a blocking producer on the I/O pool.
//!
//! Responsibilities:
//! - Runs `ChunkProducer::next_chunk` on `io_executor()` so a driver quantum never blocks.
//! - Buffers up to `operator_buffer_chunks` chunks per I/O task; `has_output` stays false
//!   until a task has delivered.
//! - Reports `pending_finish` while a task is still running so the fragment outlives it.
//!
//! Key exported interfaces:
//! - Types: `ChunkProducer`, `ChunkProducerBuilder`, `AsyncChunkSourceFactory`.
//!
//! Current limitations:
//! - At most one I/O task per operator is in flight.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::common::config;
use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::expr::ExprContext;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::novarocks_logging::{debug, warn};
use crate::runtime::io::{IoTaskContext, IoTaskHandle, io_executor};
use crate::runtime::runtime_state::RuntimeState;

/// Blocking chunk reader. Called only from I/O threads, one call at a time.
pub trait ChunkProducer: Send {
    /// `Ok(None)` marks end of stream.
    fn next_chunk(&mut self, ctx: &IoTaskContext) -> ExecResult<Option<Chunk>>;
}

/// Creates the producer of one driver from `(dop, driver_sequence)`.
pub type ChunkProducerBuilder = Arc<dyn Fn(i32, i32) -> Box<dyn ChunkProducer> + Send + Sync>;

#[derive(Default)]
struct SharedState {
    buffer: VecDeque<ChunkPtr>,
    eos: bool,
    error: Option<ExecError>,
    in_flight: bool,
}

pub struct AsyncChunkSourceFactory {
    base: OperatorFactoryBase,
    builder: ChunkProducerBuilder,
}

impl AsyncChunkSourceFactory {
    pub fn new(id: i32, plan_node_id: PlanNodeId, builder: ChunkProducerBuilder) -> Self {
        Self {
            base: OperatorFactoryBase::new(
                id,
                plan_node_id,
                format!("ASYNC_SOURCE (id={plan_node_id})"),
            ),
            builder,
        }
    }

    pub fn with_conjuncts(mut self, conjuncts: Vec<ExprContext>) -> Self {
        self.base = self.base.with_conjuncts(conjuncts);
        self
    }
}

impl OperatorFactory for AsyncChunkSourceFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        Box::new(AsyncChunkSourceOperator {
            base: self.base.new_operator_base(driver_sequence),
            producer: Arc::new(Mutex::new((self.builder)(dop, driver_sequence))),
            shared: Arc::new(Mutex::new(SharedState::default())),
            handle: None,
            finished: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }
}

struct AsyncChunkSourceOperator {
    base: OperatorBase,
    producer: Arc<Mutex<Box<dyn ChunkProducer>>>,
    shared: Arc<Mutex<SharedState>>,
    handle: Option<IoTaskHandle>,
    finished: bool,
}

impl AsyncChunkSourceOperator {
    fn submit_io_task(&mut self) {
        {
            let mut shared = self.shared.lock().expect("async source lock");
            if shared.in_flight || shared.eos || shared.error.is_some() {
                return;
            }
            shared.in_flight = true;
        }
        let producer = Arc::clone(&self.producer);
        let shared = Arc::clone(&self.shared);
        let max_chunks = config::operator_buffer_chunks();
        let name = self.base.name().to_string();
        let handle = io_executor().submit(move |ctx| {
            let mut chunks = Vec::new();
            let mut eos = false;
            let mut error = None;
            {
                let mut producer = producer.lock().expect("chunk producer lock");
                while chunks.len() < max_chunks {
                    if ctx.is_cancelled() {
                        eos = true;
                        break;
                    }
                    match producer.next_chunk(&ctx) {
                        Ok(Some(chunk)) => {
                            if !chunk.is_empty() {
                                chunks.push(Arc::new(chunk));
                            }
                        }
                        Ok(None) => {
                            eos = true;
                            break;
                        }
                        Err(err) => {
                            warn!("{} producer failed: {}", name, err);
                            error = Some(err);
                            break;
                        }
                    }
                }
            }
            let mut shared = shared.lock().expect("async source lock");
            shared.buffer.extend(chunks);
            shared.eos |= eos;
            if shared.error.is_none() {
                shared.error = error;
            }
            shared.in_flight = false;
        });
        self.handle = Some(handle);
    }

    fn cancel_io_task(&mut self) {
        if let Some(handle) = self.handle.as_ref() {
            handle.cancel();
        }
    }
}

impl Operator for AsyncChunkSourceOperator {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn prepare(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.submit_io_task();
        Ok(())
    }

    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.cancel_io_task();
        Ok(())
    }

    fn has_output(&self) -> bool {
        if self.finished {
            return false;
        }
        let shared = self.shared.lock().expect("async source lock");
        if !shared.buffer.is_empty() || shared.error.is_some() {
            return true;
        }
        // Nothing buffered and no task running: a pull submits the next task.
        !shared.in_flight && !shared.eos
    }

    fn need_input(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        if self.finished {
            return true;
        }
        let shared = self.shared.lock().expect("async source lock");
        shared.eos && shared.buffer.is_empty() && shared.error.is_none() && !shared.in_flight
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.cancel_io_task();
        let mut shared = self.shared.lock().expect("async source lock");
        shared.buffer.clear();
        debug!("{} finished early", self.base.name());
        Ok(())
    }

    fn pending_finish(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: ChunkPtr) -> ExecResult<()> {
        Err(ExecError::internal("async source does not accept input"))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        if self.finished {
            return Ok(None);
        }
        let next = {
            let mut shared = self.shared.lock().expect("async source lock");
            if let Some(err) = shared.error.clone() {
                return Err(err);
            }
            if shared.in_flight && self.handle.as_ref().is_some_and(|h| h.is_finished()) {
                // The task ended without publishing, which only happens when it panicked.
                return Err(ExecError::internal(format!(
                    "{} I/O task exited without a result",
                    self.base.name()
                )));
            }
            shared.buffer.pop_front()
        };
        let Some(chunk) = next else {
            self.submit_io_task();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use arrow::array::{ArrayRef, Int32Array};
    use std::time::{Duration, Instant};

    struct CountingProducer {
        remaining: usize,
    }

    impl ChunkProducer for CountingProducer {
        fn next_chunk(&mut self, _ctx: &IoTaskContext) -> ExecResult<Option<Chunk>> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let chunk = Chunk::from_columns(vec![(
                SlotId::new(1),
                Arc::new(Int32Array::from(vec![self.remaining as i32])) as ArrayRef,
            )])?;
            Ok(Some(chunk))
        }
    }

    struct FailingProducer;

    impl ChunkProducer for FailingProducer {
        fn next_chunk(&mut self, _ctx: &IoTaskContext) -> ExecResult<Option<Chunk>> {
            Err(ExecError::internal("disk gone"))
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn reads_everything_off_thread() {
        let state = RuntimeState::default();
        let builder: ChunkProducerBuilder =
            Arc::new(|_, _| Box::new(CountingProducer { remaining: 20 }));
        let factory = AsyncChunkSourceFactory::new(1, 1, builder);
        let mut op = factory.create(1, 0);
        op.prepare(&state).expect("prepare");

        let mut rows = 0;
        wait_until(|| {
            if op.has_output() {
                if let Some(chunk) = op.pull_chunk(&state).expect("pull") {
                    rows += chunk.num_rows();
                }
            }
            op.is_finished()
        });
        assert_eq!(rows, 20);
        wait_until(|| !op.pending_finish());
        op.close(&state).expect("close");
    }

    #[test]
    fn producer_error_fails_pull() {
        let state = RuntimeState::default();
        let builder: ChunkProducerBuilder = Arc::new(|_, _| Box::new(FailingProducer));
        let factory = AsyncChunkSourceFactory::new(1, 1, builder);
        let mut op = factory.create(1, 0);
        op.prepare(&state).expect("prepare");
        wait_until(|| !op.pending_finish());
        assert!(op.has_output());
        assert!(op.pull_chunk(&state).is_err());
        assert!(!op.is_finished());
    }
}
