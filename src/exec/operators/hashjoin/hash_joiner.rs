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
//! Build and probe state of one hash join.
//!
//! Responsibilities:
//! - Collects build chunks, then freezes them into a `JoinHashTable` exactly once.
//! - Probes chunks against a built table for `Inner`, `LeftOuter`, `LeftSemi` and
//!   `LeftAnti` joins, emitting at most `chunk_size` rows per pull.
//!
//! Key exported interfaces:
//! - Types: `HashJoiner`, `HashJoinerParam`, `JoinType`, `HashJoinPhase`.
//!
//! Current limitations:
//! - Only `=` keys; a null key never matches, including on the build side.
//!
//! The built table is written once and read by any number of probers afterwards, so
//! probing takes no lock on it. Per-prober state lives behind an uncontended mutex.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use arrow::array::{ArrayRef, UInt32Array, new_null_array};
use arrow::compute::take;
use arrow::datatypes::DataType;

use crate::common::ids::{PlanNodeId, SlotId};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::pipeline::dependency::{Dependency, DependencyHandle};
use crate::novarocks_logging::debug;
use crate::runtime::mem_tracker::MemTracker;

use super::join_hash_table::{JoinHashTable, ROW_NONE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    LeftSemi,
    LeftAnti,
}

impl JoinType {
    pub fn emits_build_columns(self) -> bool {
        matches!(self, JoinType::Inner | JoinType::LeftOuter)
    }

    /// Joins that drop every unmatched probe row may filter the probe side early.
    pub fn supports_runtime_filters(self) -> bool {
        matches!(self, JoinType::Inner | JoinType::LeftSemi)
    }
}

/// Static description of one join, shared by every builder and prober.
#[derive(Clone, Debug)]
pub struct HashJoinerParam {
    pub plan_node_id: PlanNodeId,
    pub join_type: JoinType,
    /// Build key slots with the type the keys are compared in.
    pub build_keys: Vec<(SlotId, DataType)>,
    /// Probe key slots, positionally matching `build_keys`.
    pub probe_key_slots: Vec<SlotId>,
    /// Build columns appended to the probe columns for `Inner` and `LeftOuter`.
    pub build_output: Vec<(SlotId, DataType)>,
}

impl HashJoinerParam {
    pub fn validate(&self) -> ExecResult<()> {
        if self.build_keys.is_empty() {
            return Err(ExecError::invalid_argument(format!(
                "hash join {} has no join keys",
                self.plan_node_id
            )));
        }
        if self.build_keys.len() != self.probe_key_slots.len() {
            return Err(ExecError::invalid_argument(format!(
                "hash join {} key count mismatch: build={} probe={}",
                self.plan_node_id,
                self.build_keys.len(),
                self.probe_key_slots.len()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashJoinPhase {
    Build,
    Probe,
    Eos,
}

pub(crate) struct JoinBuildSide {
    table: JoinHashTable,
    build_chunk: Option<Chunk>,
    key_columns: Vec<ArrayRef>,
}

struct PendingProbe {
    chunk: ChunkPtr,
    heads: Vec<u32>,
    row: usize,
    /// Next build row to emit for `row` when its match chain was cut by the size limit.
    cursor: Option<u32>,
}

#[derive(Default)]
struct ProbeState {
    pending: Option<PendingProbe>,
    eos: bool,
}

pub struct HashJoiner {
    param: Arc<HashJoinerParam>,
    build_done: DependencyHandle,
    remaining_build_drivers: AtomicUsize,
    build_input: Mutex<Vec<ChunkPtr>>,
    build_side: OnceLock<JoinBuildSide>,
    probe: Mutex<ProbeState>,
    mem_tracker: Mutex<Option<Arc<MemTracker>>>,
}

impl HashJoiner {
    /// A joiner fed by `num_build_drivers` build operators.
    pub fn new(param: Arc<HashJoinerParam>, num_build_drivers: usize) -> Self {
        let build_done = Arc::new(Dependency::new(format!(
            "hash_join_build:{}",
            param.plan_node_id
        )));
        Self {
            param,
            build_done,
            remaining_build_drivers: AtomicUsize::new(num_build_drivers),
            build_input: Mutex::new(Vec::new()),
            build_side: OnceLock::new(),
            probe: Mutex::new(ProbeState::default()),
            mem_tracker: Mutex::new(None),
        }
    }

    pub fn param(&self) -> &Arc<HashJoinerParam> {
        &self.param
    }

    pub fn phase(&self) -> HashJoinPhase {
        if !self.is_build_done() {
            return HashJoinPhase::Build;
        }
        if self.probe_finished() {
            HashJoinPhase::Eos
        } else {
            HashJoinPhase::Probe
        }
    }

    /// Tracker the built table is charged to. The first caller wins.
    pub fn set_mem_tracker(&self, tracker: Arc<MemTracker>) {
        let mut guard = self.mem_tracker.lock().expect("hash joiner tracker lock");
        if guard.is_none() {
            *guard = Some(tracker);
        }
    }

    pub fn append_build_chunk(&self, chunk: ChunkPtr) -> ExecResult<()> {
        if self.is_build_done() {
            return Err(ExecError::internal(format!(
                "hash join {} received build input after the table was built",
                self.param.plan_node_id
            )));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.build_input
            .lock()
            .expect("hash joiner build lock")
            .push(chunk);
        Ok(())
    }

    /// Count one build driver as done. True for the last one, which must build the table.
    pub fn finish_build_driver(&self) -> bool {
        self.remaining_build_drivers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok_and(|prev| prev == 1)
    }

    pub fn build_hash_table(&self) -> ExecResult<()> {
        let chunks = std::mem::take(&mut *self.build_input.lock().expect("hash joiner build lock"));
        let key_types = self
            .param
            .build_keys
            .iter()
            .map(|(_, t)| t.clone())
            .collect::<Vec<_>>();
        let mut table = JoinHashTable::new(key_types)?;
        let tracker = self
            .mem_tracker
            .lock()
            .expect("hash joiner tracker lock")
            .clone();
        if let Some(tracker) = tracker.as_ref() {
            table.set_mem_tracker(Arc::clone(tracker));
        }

        let mut key_columns = Vec::new();
        let mut build_chunk = None;
        if let Some(all) = Chunk::concat(&chunks)? {
            key_columns = self
                .param
                .build_keys
                .iter()
                .map(|(slot, _)| all.column_by_slot_id(*slot))
                .collect::<ExecResult<Vec<_>>>()?;
            table.add_build_rows(&key_columns)?;
            if self.param.join_type.emits_build_columns() && !self.param.build_output.is_empty() {
                let slots = self
                    .param
                    .build_output
                    .iter()
                    .map(|(slot, _)| *slot)
                    .collect::<Vec<_>>();
                let mut projected = all.project(&slots)?;
                if let Some(tracker) = tracker.as_ref() {
                    projected.transfer_to(tracker);
                }
                build_chunk = Some(projected);
            }
        }
        drop(chunks);

        debug!(
            "hash join table built: node_id={} rows={} keys={} bytes={}",
            self.param.plan_node_id,
            table.num_rows(),
            table.num_keys(),
            table.memory_usage()
        );
        self.build_side
            .set(JoinBuildSide {
                table,
                build_chunk,
                key_columns,
            })
            .map_err(|_| {
                ExecError::internal(format!(
                    "hash join {} table built twice",
                    self.param.plan_node_id
                ))
            })?;
        self.build_done.set_ready();
        Ok(())
    }

    pub fn is_build_done(&self) -> bool {
        self.build_side.get().is_some()
    }

    /// Fires once the table is built.
    pub fn build_done_dependency(&self) -> DependencyHandle {
        Arc::clone(&self.build_done)
    }

    pub fn num_build_rows(&self) -> usize {
        self.build_side.get().map(|b| b.table.num_rows()).unwrap_or(0)
    }

    pub fn hash_table_memory_usage(&self) -> usize {
        self.build_side
            .get()
            .map(|b| b.table.memory_usage())
            .unwrap_or(0)
    }

    /// Build key columns, one per join key, for runtime filter construction.
    pub fn build_key_columns(&self) -> Vec<ArrayRef> {
        self.build_side
            .get()
            .map(|b| b.key_columns.clone())
            .unwrap_or_default()
    }

    fn built_side<'a>(&self, builder: &'a HashJoiner) -> ExecResult<&'a JoinBuildSide> {
        builder.build_side.get().ok_or_else(|| {
            ExecError::internal(format!(
                "hash join {} probed before the build side finished",
                self.param.plan_node_id
            ))
        })
    }

    pub fn probe_need_input(&self) -> bool {
        let probe = self.probe.lock().expect("hash joiner probe lock");
        probe.pending.is_none() && !probe.eos
    }

    pub fn has_probe_output(&self) -> bool {
        self.probe
            .lock()
            .expect("hash joiner probe lock")
            .pending
            .is_some()
    }

    /// Stage one probe chunk against `builder`'s table, which may be `self`.
    pub fn push_probe_chunk(&self, builder: &HashJoiner, chunk: ChunkPtr) -> ExecResult<()> {
        let side = self.built_side(builder)?;
        let mut probe = self.probe.lock().expect("hash joiner probe lock");
        if probe.eos {
            return Err(ExecError::internal("hash join probe input after eos"));
        }
        if probe.pending.is_some() {
            return Err(ExecError::internal(
                "hash join received probe input while output is pending",
            ));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let keys = self
            .param
            .probe_key_slots
            .iter()
            .map(|slot| chunk.column_by_slot_id(*slot))
            .collect::<ExecResult<Vec<_>>>()?;
        let heads = side.table.probe_heads(&keys)?;
        probe.pending = Some(PendingProbe {
            chunk,
            heads,
            row: 0,
            cursor: None,
        });
        Ok(())
    }

    /// Emit up to `chunk_size` joined rows of the staged probe chunk.
    pub fn pull_probe_chunk(&self, builder: &HashJoiner, chunk_size: usize) -> ExecResult<Option<Chunk>> {
        let side = self.built_side(builder)?;
        let mut probe = self.probe.lock().expect("hash joiner probe lock");
        let Some(pending) = probe.pending.as_mut() else {
            return Ok(None);
        };
        let limit = chunk_size.max(1);
        let join_type = self.param.join_type;
        let num_rows = pending.chunk.num_rows();
        let mut probe_idx: Vec<u32> = Vec::new();
        let mut build_idx: Vec<Option<u32>> = Vec::new();
        while pending.row < num_rows && probe_idx.len() < limit {
            let row = pending.row;
            let head = pending.heads[row];
            match join_type {
                JoinType::LeftSemi | JoinType::LeftAnti => {
                    let matched = head != ROW_NONE;
                    if matched == (join_type == JoinType::LeftSemi) {
                        probe_idx.push(row as u32);
                    }
                    pending.row += 1;
                }
                JoinType::LeftOuter if head == ROW_NONE => {
                    probe_idx.push(row as u32);
                    build_idx.push(None);
                    pending.row += 1;
                }
                JoinType::Inner | JoinType::LeftOuter => {
                    let mut cur = pending.cursor.unwrap_or(head);
                    while cur != ROW_NONE && probe_idx.len() < limit {
                        probe_idx.push(row as u32);
                        build_idx.push(Some(cur));
                        cur = side.table.next_row(cur);
                    }
                    if cur == ROW_NONE {
                        pending.row += 1;
                        pending.cursor = None;
                    } else {
                        pending.cursor = Some(cur);
                    }
                }
            }
        }
        let chunk = Arc::clone(&pending.chunk);
        if pending.row >= num_rows {
            probe.pending = None;
        }
        drop(probe);
        if probe_idx.is_empty() {
            return Ok(None);
        }
        self.materialize(side, &chunk, probe_idx, build_idx).map(Some)
    }

    fn materialize(
        &self,
        side: &JoinBuildSide,
        probe_chunk: &Chunk,
        probe_idx: Vec<u32>,
        build_idx: Vec<Option<u32>>,
    ) -> ExecResult<Chunk> {
        let num_out = probe_idx.len();
        let probe_indices = UInt32Array::from(probe_idx);
        let mut columns = probe_chunk
            .slot_ids()
            .into_iter()
            .zip(probe_chunk.columns().iter())
            .map(|(slot, column)| Ok((slot, take(column.as_ref(), &probe_indices, None)?)))
            .collect::<ExecResult<Vec<(SlotId, ArrayRef)>>>()?;
        if self.param.join_type.emits_build_columns() {
            let build_indices = UInt32Array::from(build_idx);
            for (slot, data_type) in &self.param.build_output {
                let column = match side.build_chunk.as_ref() {
                    Some(build) => {
                        let source = build.column_by_slot_id(*slot)?;
                        take(source.as_ref(), &build_indices, None)?
                    }
                    None => new_null_array(data_type, num_out),
                };
                columns.push((*slot, column));
            }
        }
        Chunk::from_columns(columns)
    }

    pub fn probe_eos(&self) {
        self.probe.lock().expect("hash joiner probe lock").eos = true;
    }

    pub fn probe_finished(&self) -> bool {
        let probe = self.probe.lock().expect("hash joiner probe lock");
        probe.eos && probe.pending.is_none()
    }

    /// Drop staged probe input and refuse more.
    pub fn reset_probe(&self) {
        let mut probe = self.probe.lock().expect("hash joiner probe lock");
        probe.pending = None;
        probe.eos = true;
    }
}
