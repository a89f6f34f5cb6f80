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
//! Source fed by an external producer through a bounded chunk queue.
//!
//! Responsibilities:
//! - Lets code outside the pipeline (exchange receivers, scan threads, tests) hand
//!   chunks to a driver without the driver ever blocking on the producer.
//! - Surfaces a producer error as the operator's error on the next pull.
//!
//! Key exported interfaces:
//! - Types: `ChunkQueue`, `ChunkQueueSourceFactory`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::expr::ExprContext;
use crate::exec::pipeline::operator::{Operator, OperatorBase};
use crate::exec::pipeline::operator_factory::{OperatorFactory, OperatorFactoryBase};
use crate::novarocks_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<ChunkPtr>,
    closed: bool,
    error: Option<ExecError>,
}

/// Bounded queue between one producer and one source operator.
///
/// `push` never blocks; producers check `is_full` and retry later.
pub struct ChunkQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("chunk queue lock").chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Returns false when the queue is closed or full; the chunk is dropped in that case.
    pub fn push(&self, chunk: ChunkPtr) -> bool {
        let mut state = self.state.lock().expect("chunk queue lock");
        if state.closed || state.chunks.len() >= self.capacity {
            return false;
        }
        state.chunks.push_back(chunk);
        true
    }

    /// No more chunks will be pushed. Queued chunks are still delivered.
    pub fn close(&self) {
        self.state.lock().expect("chunk queue lock").closed = true;
    }

    pub fn close_with_error(&self, err: ExecError) {
        let mut state = self.state.lock().expect("chunk queue lock");
        state.closed = true;
        if state.error.is_none() {
            state.error = Some(err);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("chunk queue lock").closed
    }

    fn has_output(&self) -> bool {
        let state = self.state.lock().expect("chunk queue lock");
        !state.chunks.is_empty() || state.error.is_some()
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock().expect("chunk queue lock");
        state.closed && state.chunks.is_empty() && state.error.is_none()
    }

    fn pop(&self) -> ExecResult<Option<ChunkPtr>> {
        let mut state = self.state.lock().expect("chunk queue lock");
        if let Some(err) = state.error.clone() {
            return Err(err);
        }
        Ok(state.chunks.pop_front())
    }

    fn clear(&self) {
        let mut state = self.state.lock().expect("chunk queue lock");
        state.chunks.clear();
        state.closed = true;
    }
}

/// Factory for sources reading from `ChunkQueue`s; driver `i` reads queue `i % queues.len()`.
pub struct ChunkQueueSourceFactory {
    base: OperatorFactoryBase,
    queues: Vec<Arc<ChunkQueue>>,
}

impl ChunkQueueSourceFactory {
    pub fn new(id: i32, plan_node_id: PlanNodeId, queues: Vec<Arc<ChunkQueue>>) -> Self {
        Self {
            base: OperatorFactoryBase::new(
                id,
                plan_node_id,
                format!("CHUNK_QUEUE_SOURCE (id={plan_node_id})"),
            ),
            queues,
        }
    }

    pub fn with_conjuncts(mut self, conjuncts: Vec<ExprContext>) -> Self {
        self.base = self.base.with_conjuncts(conjuncts);
        self
    }
}

impl OperatorFactory for ChunkQueueSourceFactory {
    fn base(&self) -> &OperatorFactoryBase {
        &self.base
    }

    fn create(&self, _dop: i32, driver_sequence: i32) -> Box<dyn Operator> {
        let queue = if self.queues.is_empty() {
            None
        } else {
            let idx = driver_sequence.max(0) as usize % self.queues.len();
            Some(Arc::clone(&self.queues[idx]))
        };
        Box::new(ChunkQueueSourceOperator {
            base: self.base.new_operator_base(driver_sequence),
            queue,
            finished: false,
        })
    }

    fn is_source(&self) -> bool {
        true
    }

    fn prepare(&self, _state: &RuntimeState) -> ExecResult<()> {
        if self.queues.is_empty() {
            return Err(ExecError::invalid_argument(format!(
                "{} has no input queue",
                self.base.name()
            )));
        }
        Ok(())
    }
}

struct ChunkQueueSourceOperator {
    base: OperatorBase,
    queue: Option<Arc<ChunkQueue>>,
    finished: bool,
}

impl Operator for ChunkQueueSourceOperator {
    fn base(&self) -> &OperatorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OperatorBase {
        &mut self.base
    }

    fn has_output(&self) -> bool {
        !self.finished && self.queue.as_ref().is_some_and(|q| q.has_output())
    }

    fn need_input(&self) -> bool {
        false
    }

    fn is_finished(&self) -> bool {
        self.finished || self.queue.as_ref().is_none_or(|q| q.is_drained())
    }

    fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    fn set_finished(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(queue) = self.queue.as_ref() {
            debug!(
                "{} finished early, dropping {} queued chunks",
                self.base.name(),
                queue.len()
            );
            queue.clear();
        }
        Ok(())
    }

    fn push_chunk(&mut self, _state: &RuntimeState, _chunk: ChunkPtr) -> ExecResult<()> {
        Err(ExecError::internal("chunk queue source does not accept input"))
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<ChunkPtr>> {
        if self.finished {
            return Ok(None);
        }
        let Some(queue) = self.queue.as_ref() else {
            return Ok(None);
        };
        let Some(chunk) = queue.pop()? else {
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
