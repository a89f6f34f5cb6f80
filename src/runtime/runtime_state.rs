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
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::app_config::StreamingPreaggregationMode;
use crate::common::config;
use crate::common::status::ExecError;
use crate::common::types::UniqueId;
use crate::runtime::mem_tracker::{self, MemTracker};

/// RuntimeState is the per-fragment-instance execution context.
///
/// Cloning shares the error slot, the cancel flag and the memory tracker, so every
/// driver of one fragment observes the same first error and the same cancellation.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    query_id: Option<UniqueId>,
    fragment_instance_id: Option<UniqueId>,
    chunk_size: usize,
    streaming_preaggregation_mode: StreamingPreaggregationMode,
    error_state: Arc<RuntimeErrorState>,
    cancelled: Arc<AtomicBool>,
    mem_tracker: Option<Arc<MemTracker>>,
}

/// First-error-wins slot shared by all drivers of a fragment.
#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<ExecError>>,
}

impl RuntimeErrorState {
    /// Returns true if this call recorded the first error.
    pub fn set_error(&self, err: ExecError) -> bool {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
            return true;
        }
        false
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            query_id: None,
            fragment_instance_id: None,
            chunk_size: config::chunk_size(),
            streaming_preaggregation_mode: config::streaming_preaggregation_mode(),
            error_state: Arc::new(RuntimeErrorState::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            mem_tracker: None,
        }
    }
}

impl RuntimeState {
    pub fn new(query_id: UniqueId, fragment_instance_id: UniqueId) -> Self {
        let label = format!("fragment {}", fragment_instance_id);
        Self {
            query_id: Some(query_id),
            fragment_instance_id: Some(fragment_instance_id),
            mem_tracker: Some(MemTracker::new_child(
                label,
                &mem_tracker::process_mem_tracker(),
            )),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_mem_tracker(mut self, tracker: Arc<MemTracker>) -> Self {
        self.mem_tracker = Some(tracker);
        self
    }

    pub fn with_streaming_preaggregation_mode(mut self, mode: StreamingPreaggregationMode) -> Self {
        self.streaming_preaggregation_mode = mode;
        self
    }

    pub fn query_id(&self) -> Option<UniqueId> {
        self.query_id
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        self.fragment_instance_id
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn streaming_preaggregation_mode(&self) -> StreamingPreaggregationMode {
        self.streaming_preaggregation_mode
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.mem_tracker.clone()
    }

    pub fn error_state(&self) -> &Arc<RuntimeErrorState> {
        &self.error_state
    }

    pub fn set_error(&self, err: ExecError) -> bool {
        self.error_state.set_error(err)
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error_state.error()
    }

    /// Raise the cancel flag. Safe to call from any thread, any number of times.
    pub fn cancel(&self, reason: ExecError) {
        self.set_error(reason);
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
