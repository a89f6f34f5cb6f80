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
//! Shared state of one distinct streaming aggregation lane.
//!
//! Responsibilities:
//! - Owns the grouping-key hash set, the streaming output buffer and the rows
//!   held back by the adaptive path, behind one lock shared by sink and source.
//! - Decides whether growing the hash set is worth it from the observed reduction.
//! - Keeps the lane's memory tracker equal to the hash set's reserved bytes.
//!
//! Key exported interfaces:
//! - Types: `Aggregator`, `AggregatorParams`, `AggregatorFactory`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::{cast, take};
use arrow::datatypes::DataType;
use hashbrown::HashSet;

use crate::common::app_config::StreamingHtMinReduction;
use crate::common::config;
use crate::common::ids::{PlanNodeId, SlotId};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::{Chunk, ChunkPtr};
use crate::exec::hash_table::agg_hash_set::AggHashSet;
use crate::exec::hash_table::key_codec::KeyCodec;
use crate::novarocks_logging::debug;
use crate::runtime::mem_tracker::MemTracker;
use crate::runtime::profile::{CounterUnit, RuntimeProfile};

#[derive(Clone, Debug)]
pub struct AggregatorParams {
    pub plan_node_id: PlanNodeId,
    /// Grouping slots and the type keys are normalized to.
    pub group_by: Vec<(SlotId, DataType)>,
    pub streaming_ht_min_reduction: Vec<StreamingHtMinReduction>,
    pub two_level_threshold_bytes: i64,
}

impl AggregatorParams {
    pub fn new(plan_node_id: PlanNodeId, group_by: Vec<(SlotId, DataType)>) -> Self {
        let cfg = config::aggregate_config();
        Self {
            plan_node_id,
            group_by,
            streaming_ht_min_reduction: cfg.streaming_ht_min_reduction,
            two_level_threshold_bytes: cfg.two_level_threshold_bytes,
        }
    }

    pub fn with_streaming_ht_min_reduction(mut self, table: Vec<StreamingHtMinReduction>) -> Self {
        self.streaming_ht_min_reduction = table;
        self
    }

    pub fn with_two_level_threshold_bytes(mut self, bytes: i64) -> Self {
        self.two_level_threshold_bytes = bytes;
        self
    }

    pub fn group_by_slots(&self) -> Vec<SlotId> {
        self.group_by.iter().map(|(slot, _)| *slot).collect()
    }

    fn key_types(&self) -> Vec<DataType> {
        self.group_by.iter().map(|(_, t)| t.clone()).collect()
    }

    pub(crate) fn validate(&self) -> ExecResult<()> {
        if self.group_by.is_empty() {
            return Err(ExecError::invalid_argument(format!(
                "distinct aggregation {} has no grouping keys",
                self.plan_node_id
            )));
        }
        if self.streaming_ht_min_reduction.is_empty() {
            return Err(ExecError::invalid_argument(
                "streaming_ht_min_reduction table must not be empty",
            ));
        }
        let sorted = self
            .streaming_ht_min_reduction
            .windows(2)
            .all(|w| w[0].min_ht_mem < w[1].min_ht_mem);
        if !sorted || self.streaming_ht_min_reduction[0].min_ht_mem != 0 {
            return Err(ExecError::invalid_argument(
                "streaming_ht_min_reduction must start at 0 and be strictly increasing",
            ));
        }
        Ok(())
    }
}

struct AggregatorState {
    hash_set: AggHashSet,
    mem_tracker: Option<Arc<MemTracker>>,
    profile: Option<RuntimeProfile>,
    streaming_buffer: VecDeque<ChunkPtr>,
    /// Rows whose keys were all new, held until enough accumulate to stream.
    pending: Vec<ChunkPtr>,
    pending_rows: usize,
    output_keys: Option<Vec<Box<[u8]>>>,
    output_offset: usize,
}

impl AggregatorState {
    fn sync_mem_tracker(&self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.set(self.hash_set.reserved_memory_usage() as i64);
        }
    }

    fn release(&mut self) {
        self.hash_set.reset();
        self.streaming_buffer.clear();
        self.pending.clear();
        self.pending_rows = 0;
        self.output_keys = None;
        self.output_offset = 0;
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.set(0);
        }
    }
}

/// One lane of a distinct streaming aggregation, shared by its sink and source.
pub struct Aggregator {
    params: Arc<AggregatorParams>,
    codec: KeyCodec,
    group_by_slots: Vec<SlotId>,
    state: Mutex<AggregatorState>,
    num_input_rows: AtomicUsize,
    num_pass_through_rows: AtomicUsize,
    sink_complete: AtomicBool,
    ht_eos: AtomicBool,
    /// Set once the lane was cancelled or its consumer went away.
    stopped: AtomicBool,
}

impl Aggregator {
    pub fn try_new(params: Arc<AggregatorParams>) -> ExecResult<Self> {
        params.validate()?;
        let key_types = params.key_types();
        let hash_set = AggHashSet::try_new(key_types.clone(), params.two_level_threshold_bytes)?;
        let codec = KeyCodec::try_new(key_types)?;
        let group_by_slots = params.group_by_slots();
        Ok(Self {
            params,
            codec,
            group_by_slots,
            state: Mutex::new(AggregatorState {
                hash_set,
                mem_tracker: None,
                profile: None,
                streaming_buffer: VecDeque::new(),
                pending: Vec::new(),
                pending_rows: 0,
                output_keys: None,
                output_offset: 0,
            }),
            num_input_rows: AtomicUsize::new(0),
            num_pass_through_rows: AtomicUsize::new(0),
            sink_complete: AtomicBool::new(false),
            ht_eos: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().expect("aggregator lock")
    }

    pub fn params(&self) -> &Arc<AggregatorParams> {
        &self.params
    }

    /// Attach the lane's hash-set tracker under `parent`. Only the first call takes effect.
    pub fn prepare(&self, parent: Option<&Arc<MemTracker>>, profile: Option<RuntimeProfile>) {
        let mut state = self.lock();
        if state.mem_tracker.is_none() {
            let label = format!("AggregatorHashSet (id={})", self.params.plan_node_id);
            let tracker = match parent {
                Some(parent) => MemTracker::new_child(label, parent),
                None => MemTracker::new_root(label),
            };
            state.hash_set.set_mem_tracker(Arc::clone(&tracker));
            state.mem_tracker = Some(tracker);
        }
        if state.profile.is_none() {
            state.profile = profile;
        }
    }

    pub fn mem_tracker(&self) -> Option<Arc<MemTracker>> {
        self.lock().mem_tracker.clone()
    }

    pub fn group_by_slots(&self) -> &[SlotId] {
        &self.group_by_slots
    }

    pub fn update_num_input_rows(&self, rows: usize) {
        self.num_input_rows.fetch_add(rows, Ordering::AcqRel);
    }

    pub fn num_input_rows(&self) -> usize {
        self.num_input_rows.load(Ordering::Acquire)
    }

    pub fn num_pass_through_rows(&self) -> usize {
        self.num_pass_through_rows.load(Ordering::Acquire)
    }

    pub fn hash_set_size(&self) -> usize {
        self.lock().hash_set.size()
    }

    pub fn hash_set_capacity(&self) -> usize {
        self.lock().hash_set.capacity()
    }

    pub fn hash_set_allocated_memory_usage(&self) -> usize {
        self.lock().hash_set.allocated_memory_usage()
    }

    pub fn is_two_level(&self) -> bool {
        self.lock().hash_set.is_two_level()
    }

    pub fn needs_expansion(&self, incoming: usize) -> bool {
        self.lock().hash_set.needs_expansion(incoming)
    }

    /// Grouping columns of `chunk`, cast to the key types.
    pub fn evaluate_group_by(&self, chunk: &Chunk) -> ExecResult<Vec<ArrayRef>> {
        self.params
            .group_by
            .iter()
            .map(|(slot, data_type)| {
                let column = chunk.column_by_slot_id(*slot)?;
                if column.data_type() == data_type {
                    Ok(column)
                } else {
                    Ok(cast(&column, data_type)?)
                }
            })
            .collect()
    }

    /// Growth is worth it while rows are still being reduced by more than the
    /// factor configured for the hash set's current size.
    pub fn should_expand_preagg_hash_tables(
        &self,
        input_rows: usize,
        chunk_size: usize,
        ht_mem: usize,
        ht_rows: usize,
    ) -> bool {
        if ht_rows == 0 {
            return true;
        }
        let table = &self.params.streaming_ht_min_reduction;
        let mut level = 0;
        while level + 1 < table.len() && ht_mem as i64 >= table[level + 1].min_ht_mem {
            level += 1;
        }
        let aggregated_rows = input_rows as i64 - self.num_pass_through_rows() as i64;
        if aggregated_rows <= 0 {
            return true;
        }
        let current_reduction = aggregated_rows as f64 / ht_rows as f64;
        let min_reduction = table[level].min_reduction;
        let expand = current_reduction > min_reduction;
        debug!(
            "distinct agg {} expand check: input_rows={} chunk_size={} ht_mem={} ht_rows={} reduction={:.3} min={:.3} expand={}",
            self.params.plan_node_id,
            input_rows,
            chunk_size,
            ht_mem,
            ht_rows,
            current_reduction,
            min_reduction,
            expand
        );
        expand
    }

    /// Absorb every key of the chunk, growing the set as needed.
    pub fn build_hash_set(&self, keys: &[ArrayRef]) -> ExecResult<()> {
        let mut state = self.lock();
        if self.is_stopped() {
            return Ok(());
        }
        let timer = state.profile.as_ref().map(|p| p.scoped_timer("AggHashSetBuildTime"));
        state.hash_set.build_hash_set(keys)?;
        drop(timer);
        state.sync_mem_tracker();
        if let Some(profile) = state.profile.as_ref() {
            profile.counter_set(
                "HashTableSize",
                CounterUnit::Unit,
                state.hash_set.size() as i64,
            );
        }
        Ok(())
    }

    /// Mark rows whose key is already in the set (`1`) without growing it.
    pub fn build_hash_set_with_selection(
        &self,
        keys: &[ArrayRef],
        selection: &mut Vec<u8>,
    ) -> ExecResult<()> {
        let state = self.lock();
        if self.is_stopped() {
            selection.clear();
            return Ok(());
        }
        state.hash_set.build_hash_set_with_selection(keys, selection)
    }

    pub fn try_convert_to_two_level_set(&self) -> bool {
        let mut state = self.lock();
        if self.is_stopped() {
            return false;
        }
        let converted = state.hash_set.try_convert_to_two_level();
        if converted {
            debug!(
                "distinct agg {} hash set converted to two-level: size={} reserved={}",
                self.params.plan_node_id,
                state.hash_set.size(),
                state.hash_set.reserved_memory_usage()
            );
            state.sync_mem_tracker();
        }
        converted
    }

    /// Grouping columns of the chunk with duplicate keys collapsed, first occurrence kept.
    pub fn output_chunk_by_streaming(&self, keys: &[ArrayRef]) -> ExecResult<Chunk> {
        let num_rows = keys.first().map(|c| c.len()).unwrap_or(0);
        let rows = self.codec.encode(keys)?;
        let mut seen: HashSet<&[u8]> = HashSet::with_capacity(num_rows);
        let mut indices = Vec::with_capacity(num_rows);
        for (idx, row) in rows.iter().enumerate() {
            if seen.insert(row.data()) {
                indices.push(idx as u32);
            }
        }
        if indices.len() == num_rows {
            return self.group_by_chunk(keys.to_vec());
        }
        let indices = UInt32Array::from(indices);
        let columns = keys
            .iter()
            .map(|column| take(column.as_ref(), &indices, None))
            .collect::<Result<Vec<_>, _>>()?;
        self.group_by_chunk(columns)
    }

    /// Grouping columns of the rows whose selection byte is `1`.
    pub fn output_chunk_by_streaming_with_selection(
        &self,
        keys: &[ArrayRef],
        selection: &[u8],
    ) -> ExecResult<Chunk> {
        let mut chunk = self.group_by_chunk(keys.to_vec())?;
        chunk.filter(selection)?;
        Ok(chunk)
    }

    /// Grouping columns of the rows whose selection byte is `0`.
    pub fn unmatched_rows(&self, keys: &[ArrayRef], selection: &[u8]) -> ExecResult<Chunk> {
        let inverted = selection.iter().map(|s| u8::from(*s == 0)).collect::<Vec<_>>();
        self.output_chunk_by_streaming_with_selection(keys, &inverted)
    }

    pub fn group_by_chunk(&self, keys: Vec<ArrayRef>) -> ExecResult<Chunk> {
        Chunk::from_columns(self.group_by_slots.iter().copied().zip(keys).collect())
    }

    /// Queue streamed rows for the source.
    pub fn offer_chunk_to_buffer(&self, chunk: Chunk) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.lock();
        if self.is_stopped() {
            return;
        }
        self.num_pass_through_rows
            .fetch_add(chunk.num_rows(), Ordering::AcqRel);
        if let Some(profile) = state.profile.as_ref() {
            profile.counter_add(
                "PassThroughRowCount",
                CounterUnit::Unit,
                chunk.num_rows() as i64,
            );
        }
        state.streaming_buffer.push_back(Arc::new(chunk));
    }

    pub fn is_chunk_buffer_full(&self) -> bool {
        self.lock().streaming_buffer.len() >= config::operator_buffer_chunks()
    }

    pub fn streaming_buffer_len(&self) -> usize {
        self.lock().streaming_buffer.len()
    }

    /// Hold back rows that would have grown the set.
    pub fn add_pending(&self, chunk: Chunk) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.lock();
        if self.is_stopped() {
            return;
        }
        state.pending_rows += chunk.num_rows();
        state.pending.push(Arc::new(chunk));
    }

    pub fn pending_rows(&self) -> usize {
        self.lock().pending_rows
    }

    pub fn take_pending(&self) -> Vec<ChunkPtr> {
        let mut state = self.lock();
        state.pending_rows = 0;
        std::mem::take(&mut state.pending)
    }

    /// Stream the held-back rows with duplicates collapsed.
    pub fn flush_pending(&self) -> ExecResult<()> {
        let pending = self.take_pending();
        let Some(chunk) = Chunk::concat(&pending)? else {
            return Ok(());
        };
        let keys = self.evaluate_group_by(&chunk)?;
        let output = self.output_chunk_by_streaming(&keys)?;
        self.offer_chunk_to_buffer(output);
        Ok(())
    }

    pub fn sink_complete(&self) {
        self.sink_complete.store(true, Ordering::Release);
    }

    pub fn is_sink_complete(&self) -> bool {
        self.sink_complete.load(Ordering::Acquire)
    }

    pub fn set_ht_eos(&self) {
        self.ht_eos.store(true, Ordering::Release);
    }

    pub fn is_ht_eos(&self) -> bool {
        self.ht_eos.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn has_output(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let buffered = !self.lock().streaming_buffer.is_empty();
        buffered || (self.is_sink_complete() && !self.is_ht_eos())
    }

    pub fn is_output_finished(&self) -> bool {
        if self.is_stopped() {
            return true;
        }
        let buffered = !self.lock().streaming_buffer.is_empty();
        self.is_sink_complete() && self.is_ht_eos() && !buffered
    }

    /// Next output chunk: streamed rows first, then the hash set in batches of `chunk_size`.
    pub fn pull_output(&self, chunk_size: usize) -> ExecResult<Option<ChunkPtr>> {
        let mut state = self.lock();
        if self.is_stopped() {
            return Ok(None);
        }
        if let Some(chunk) = state.streaming_buffer.pop_front() {
            return Ok(Some(chunk));
        }
        if !self.is_sink_complete() || self.is_ht_eos() {
            return Ok(None);
        }
        if state.output_keys.is_none() {
            let keys = state.hash_set.take_keys();
            state.output_keys = Some(keys);
            state.output_offset = 0;
        }
        let state = &mut *state;
        let keys = state.output_keys.as_deref().unwrap_or_default();
        let start = state.output_offset;
        let end = (start + chunk_size.max(1)).min(keys.len());
        let chunk = if start < end {
            Some(state.hash_set.output_chunk(&keys[start..end], &self.group_by_slots)?)
        } else {
            None
        };
        state.output_offset = end;
        if end >= keys.len() {
            state.output_keys = None;
            state.output_offset = 0;
            if let Some(tracker) = state.mem_tracker.as_ref() {
                tracker.set(0);
            }
            self.set_ht_eos();
        }
        Ok(chunk.map(Arc::new))
    }

    /// Stop the lane and free everything it holds. Safe against a concurrent push.
    pub fn set_cancelled(&self) {
        let mut state = self.lock();
        self.stopped.store(true, Ordering::Release);
        self.set_ht_eos();
        state.release();
    }

    /// The consumer no longer needs output.
    pub fn set_finished(&self) {
        self.set_cancelled();
    }

    /// Back to the state right after `prepare`, keeping tracker and profile.
    pub fn reset_state(&self) {
        let mut state = self.lock();
        state.release();
        self.num_input_rows.store(0, Ordering::Release);
        self.num_pass_through_rows.store(0, Ordering::Release);
        self.sink_complete.store(false, Ordering::Release);
        self.ht_eos.store(false, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
    }
}

impl Drop for Aggregator {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            state.release();
        }
    }
}

/// Hands out one `Aggregator` per driver sequence, shared by the sink and source pipelines.
pub struct AggregatorFactory {
    params: Arc<AggregatorParams>,
    aggregators: Mutex<HashMap<i32, Arc<Aggregator>>>,
}

impl AggregatorFactory {
    pub fn new(params: AggregatorParams) -> Arc<Self> {
        Arc::new(Self {
            params: Arc::new(params),
            aggregators: Mutex::new(HashMap::new()),
        })
    }

    pub fn params(&self) -> &Arc<AggregatorParams> {
        &self.params
    }

    pub fn validate(&self) -> ExecResult<()> {
        self.params.validate()?;
        KeyCodec::try_new(self.params.key_types()).map(|_| ())
    }

    pub fn get_or_create(&self, driver_sequence: i32) -> ExecResult<Arc<Aggregator>> {
        let mut guard = self.aggregators.lock().expect("aggregator factory lock");
        if let Some(aggregator) = guard.get(&driver_sequence) {
            return Ok(Arc::clone(aggregator));
        }
        let aggregator = Arc::new(Aggregator::try_new(Arc::clone(&self.params))?);
        guard.insert(driver_sequence, Arc::clone(&aggregator));
        Ok(aggregator)
    }

    pub fn close(&self) {
        self.aggregators
            .lock()
            .expect("aggregator factory lock")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int32Array, Int64Array};

    fn params() -> AggregatorParams {
        AggregatorParams::new(1, vec![(SlotId::new(1), DataType::Int64)])
    }

    fn keys(values: Vec<i64>) -> Vec<ArrayRef> {
        vec![Arc::new(Int64Array::from(values)) as ArrayRef]
    }

    fn int64_values(chunk: &Chunk) -> Vec<i64> {
        let column = chunk.column_by_slot_id(SlotId::new(1)).expect("column");
        let array = column
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        array.values().to_vec()
    }

    #[test]
    fn streaming_dedup_keeps_first_occurrence_order() {
        let agg = Aggregator::try_new(Arc::new(params())).expect("aggregator");
        let chunk = agg
            .output_chunk_by_streaming(&keys(vec![3, 1, 3, 2, 1]))
            .expect("stream");
        assert_eq!(int64_values(&chunk), vec![3, 1, 2]);
    }

    #[test]
    fn evaluate_group_by_casts_to_key_type() {
        let agg = Aggregator::try_new(Arc::new(params())).expect("aggregator");
        let chunk = Chunk::from_columns(vec![(
            SlotId::new(1),
            Arc::new(Int32Array::from(vec![1, 2])) as ArrayRef,
        )])
        .expect("chunk");
        let columns = agg.evaluate_group_by(&chunk).expect("eval");
        assert_eq!(columns[0].data_type(), &DataType::Int64);
    }

    #[test]
    fn expansion_follows_reduction_table() {
        let table = vec![
            StreamingHtMinReduction { min_ht_mem: 0, min_reduction: 0.0 },
            StreamingHtMinReduction { min_ht_mem: 1024, min_reduction: 2.0 },
        ];
        let agg = Aggregator::try_new(Arc::new(params().with_streaming_ht_min_reduction(table)))
            .expect("aggregator");
        assert!(agg.should_expand_preagg_hash_tables(100, 4096, 0, 0));
        assert!(agg.should_expand_preagg_hash_tables(100, 4096, 512, 50));
        // 100 input rows over 60 keys is a 1.67x reduction, under the 2.0 required at 1KiB.
        assert!(!agg.should_expand_preagg_hash_tables(100, 4096, 2048, 60));
        assert!(agg.should_expand_preagg_hash_tables(100, 4096, 2048, 40));
    }

    #[test]
    fn invalid_reduction_table_is_rejected() {
        let table = vec![StreamingHtMinReduction { min_ht_mem: 10, min_reduction: 1.0 }];
        let err = Aggregator::try_new(Arc::new(params().with_streaming_ht_min_reduction(table)))
            .err()
            .expect("must fail");
        assert_eq!(err.kind_name(), "INVALID_ARGUMENT");
    }

    #[test]
    fn hash_set_output_drains_and_releases_tracker() {
        let agg = Aggregator::try_new(Arc::new(params())).expect("aggregator");
        let root = MemTracker::new_root("test");
        agg.prepare(Some(&root), None);
        agg.build_hash_set(&keys(vec![1, 2, 3, 2])).expect("build");
        assert_eq!(agg.hash_set_size(), 3);
        assert!(root.current() > 0);

        agg.sink_complete();
        assert!(agg.has_output());
        let mut values = Vec::new();
        while let Some(chunk) = agg.pull_output(2).expect("pull") {
            assert!(chunk.num_rows() <= 2);
            values.extend(int64_values(&chunk));
        }
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(agg.is_output_finished());
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn cancel_frees_state_and_ignores_later_input() {
        let agg = Aggregator::try_new(Arc::new(params())).expect("aggregator");
        let root = MemTracker::new_root("test");
        agg.prepare(Some(&root), None);
        agg.build_hash_set(&keys(vec![1, 2])).expect("build");
        agg.offer_chunk_to_buffer(agg.group_by_chunk(keys(vec![9])).expect("chunk"));
        agg.set_cancelled();
        assert_eq!(root.current(), 0);
        assert_eq!(agg.hash_set_size(), 0);
        agg.build_hash_set(&keys(vec![4])).expect("build after cancel");
        assert_eq!(agg.hash_set_size(), 0);
        assert!(!agg.has_output());
        assert!(agg.is_output_finished());
    }

    #[test]
    fn two_level_threshold_comes_from_params() {
        let agg = Aggregator::try_new(Arc::new(params().with_two_level_threshold_bytes(i64::MAX)))
            .expect("aggregator");
        agg.build_hash_set(&keys((0..64).collect())).expect("build");
        assert!(!agg.try_convert_to_two_level_set());

        let agg = Aggregator::try_new(Arc::new(params().with_two_level_threshold_bytes(0)))
            .expect("aggregator");
        agg.build_hash_set(&keys((0..64).collect())).expect("build");
        assert!(agg.try_convert_to_two_level_set());
        assert!(agg.is_two_level());
        assert_eq!(agg.hash_set_size(), 64);
    }
}
