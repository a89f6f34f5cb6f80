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
//! Client-facing result queue of one fragment instance.
//!
//! Responsibilities:
//! - Buffers chunks produced by the result sink until the client fetches them.
//! - Carries the final fragment status (EOS, failure or cancellation) to the fetcher.
//!
//! Key exported interfaces:
//! - Types: `ResultBuffer`, `FetchError`, `FetchErrorKind`.
//! - Functions: `create_sender`, `get_sender`, `remove_sender`.
//!
//! Current limitations:
//! - Chunks are handed out as-is; row serialization for the wire is the caller's job.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::common::status::ExecError;
use crate::common::types::UniqueId;
use crate::exec::chunk::ChunkPtr;
use crate::novarocks_logging::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FetchErrorKind {
    Cancelled,
    Failed,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

#[derive(Debug)]
struct BufferControlBlock {
    queue: VecDeque<ChunkPtr>,
    closed_ok: bool,
    status_error: Option<ExecError>,
    num_rows_returned: usize,
}

impl BufferControlBlock {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            closed_ok: false,
            status_error: None,
            num_rows_returned: 0,
        }
    }
}

/// Bounded in-memory queue between the result sink and the client fetch loop.
#[derive(Debug)]
pub struct ResultBuffer {
    finst_id: UniqueId,
    capacity: usize,
    block: Mutex<BufferControlBlock>,
    cv: Condvar,
}

impl ResultBuffer {
    pub fn new(finst_id: UniqueId, capacity: usize) -> Self {
        Self {
            finst_id,
            capacity: capacity.max(1),
            block: Mutex::new(BufferControlBlock::new()),
            cv: Condvar::new(),
        }
    }

    pub fn finst_id(&self) -> UniqueId {
        self.finst_id
    }

    /// True when the sink has to stop pushing until the client drains.
    pub fn is_full(&self) -> bool {
        self.block.lock().expect("result buffer lock").queue.len() >= self.capacity
    }

    pub fn add_chunk(&self, chunk: ChunkPtr) {
        let mut block = self.block.lock().expect("result buffer lock");
        if block.status_error.is_some() || block.closed_ok {
            return;
        }
        block.queue.push_back(chunk);
        self.cv.notify_all();
    }

    /// Record the final status. Only the first close is kept.
    pub fn close(&self, status: Result<(), ExecError>) {
        let mut block = self.block.lock().expect("result buffer lock");
        if block.closed_ok || block.status_error.is_some() {
            return;
        }
        match status {
            Ok(()) => block.closed_ok = true,
            Err(err) => {
                debug!(
                    "result buffer closed with error: finst={} error={}",
                    self.finst_id, err
                );
                block.status_error = Some(err);
                block.queue.clear();
            }
        }
        self.cv.notify_all();
    }

    pub fn cancel(&self) {
        self.close(Err(ExecError::cancelled("result buffer cancelled")));
    }

    pub fn num_rows_returned(&self) -> usize {
        self.block.lock().expect("result buffer lock").num_rows_returned
    }

    /// Next chunk, `Ok(None)` at end of stream.
    pub fn fetch(&self, timeout: Duration) -> Result<Option<ChunkPtr>, FetchError> {
        let start = Instant::now();
        let mut block = self.block.lock().expect("result buffer lock");
        loop {
            if let Some(err) = block.status_error.as_ref() {
                let kind = if err.is_cancelled() {
                    FetchErrorKind::Cancelled
                } else {
                    FetchErrorKind::Failed
                };
                return Err(FetchError {
                    kind,
                    message: err.to_string(),
                });
            }
            if let Some(chunk) = block.queue.pop_front() {
                block.num_rows_returned += chunk.num_rows();
                return Ok(Some(chunk));
            }
            if block.closed_ok {
                return Ok(None);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(
                    "fetch: TIMEOUT waiting for result finst={} after {:?}",
                    self.finst_id, elapsed
                );
                return Err(FetchError {
                    kind: FetchErrorKind::Timeout,
                    message: format!("timeout waiting for result after {:?}", elapsed),
                });
            }
            let (guard, _) = self
                .cv
                .wait_timeout(block, timeout - elapsed)
                .expect("result buffer wait");
            block = guard;
        }
    }

    /// Fetch until end of stream.
    pub fn drain(&self, timeout: Duration) -> Result<Vec<ChunkPtr>, FetchError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.fetch(timeout)? {
            out.push(chunk);
        }
        Ok(out)
    }
}

struct ResultCtx {
    buffers: Mutex<HashMap<UniqueId, Arc<ResultBuffer>>>,
}

static CTX: OnceLock<ResultCtx> = OnceLock::new();

fn ctx() -> &'static ResultCtx {
    CTX.get_or_init(|| ResultCtx {
        buffers: Mutex::new(HashMap::new()),
    })
}

/// Get or create the buffer of `finst_id`.
pub fn create_sender(finst_id: UniqueId, capacity: usize) -> Arc<ResultBuffer> {
    let mut guard = ctx().buffers.lock().expect("result ctx lock");
    Arc::clone(
        guard
            .entry(finst_id)
            .or_insert_with(|| Arc::new(ResultBuffer::new(finst_id, capacity))),
    )
}

pub fn get_sender(finst_id: UniqueId) -> Option<Arc<ResultBuffer>> {
    ctx()
        .buffers
        .lock()
        .expect("result ctx lock")
        .get(&finst_id)
        .cloned()
}

pub fn remove_sender(finst_id: UniqueId) -> Option<Arc<ResultBuffer>> {
    ctx()
        .buffers
        .lock()
        .expect("result ctx lock")
        .remove(&finst_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ids::SlotId;
    use crate::exec::chunk::Chunk;
    use arrow::array::{ArrayRef, Int32Array};
    use std::thread;

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
    fn cancel_unblocks_waiter() {
        let buffer = create_sender(UniqueId::new(42, 7), 4);
        let waiter = Arc::clone(&buffer);
        let handle = thread::spawn(move || waiter.fetch(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        buffer.cancel();
        let err = handle.join().expect("join").expect_err("cancel error");
        assert_eq!(err.kind, FetchErrorKind::Cancelled);
        remove_sender(UniqueId::new(42, 7));
    }

    #[test]
    fn bounded_queue_then_eos() {
        let buffer = ResultBuffer::new(UniqueId::new(1, 2), 2);
        buffer.add_chunk(chunk(vec![1, 2]));
        assert!(!buffer.is_full());
        buffer.add_chunk(chunk(vec![3]));
        assert!(buffer.is_full());
        buffer.close(Ok(()));
        let chunks = buffer.drain(Duration::from_secs(1)).expect("drain");
        assert_eq!(chunks.len(), 2);
        assert_eq!(buffer.num_rows_returned(), 3);
    }

    #[test]
    fn close_error_is_observable() {
        let buffer = ResultBuffer::new(UniqueId::new(1, 3), 2);
        buffer.add_chunk(chunk(vec![1]));
        buffer.close(Err(ExecError::internal("boom")));
        let err = buffer.fetch(Duration::from_millis(10)).expect_err("error");
        assert_eq!(err.kind, FetchErrorKind::Failed);
        assert!(err.message.contains("boom"));
    }
}
