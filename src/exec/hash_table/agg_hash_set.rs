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
//! Adaptive hash set of grouping keys.
//!
//! Responsibilities:
//! - Stores distinct grouping keys in a single-level set, switching to a
//!   16-way sharded layout once reserved memory crosses a threshold.
//! - Tracks a logical bucket capacity with an 87.5% load factor so callers can
//!   decide whether the next chunk fits without growing.
//! - Reports reserved and allocated bytes separately.
//!
//! Key exported interfaces:
//! - Types: `AggHashSet`.
//!
//! Current limitations:
//! - Capacity is a logical figure; the physical `hashbrown` tables may hold spare
//!   room of their own that is not reported.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use hashbrown::HashSet;

use crate::common::ids::SlotId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::hash::hash_key;
use crate::exec::hash_table::key_codec::KeyCodec;
use crate::runtime::mem_tracker::MemTracker;

pub const TWO_LEVEL_NUM_SHARDS: usize = 16;
const SHARD_SHIFT: u32 = 60;
const SLOT_BYTES: usize = std::mem::size_of::<Box<[u8]>>();

type KeyTable = HashSet<Box<[u8]>>;

#[derive(Debug)]
enum SetLayout {
    SingleLevel(KeyTable),
    TwoLevel(Vec<KeyTable>),
}

/// Usable slots of a table with `capacity` buckets.
pub fn real_capacity(capacity: usize) -> usize {
    capacity - capacity / 8
}

/// Smallest power-of-two capacity whose real capacity holds `required` keys.
fn capacity_for(required: usize) -> usize {
    if required == 0 {
        return 0;
    }
    (required.saturating_mul(8).saturating_add(6) / 7).next_power_of_two()
}

#[derive(Debug)]
pub struct AggHashSet {
    codec: KeyCodec,
    layout: SetLayout,
    capacity: usize,
    key_bytes: usize,
    two_level_threshold_bytes: i64,
    mem_tracker: Option<Arc<MemTracker>>,
}

impl AggHashSet {
    pub fn try_new(key_types: Vec<DataType>, two_level_threshold_bytes: i64) -> ExecResult<Self> {
        Ok(Self {
            codec: KeyCodec::try_new(key_types)?,
            layout: SetLayout::SingleLevel(KeyTable::new()),
            capacity: 0,
            key_bytes: 0,
            two_level_threshold_bytes,
            mem_tracker: None,
        })
    }

    /// Growth is refused with `MemAllocFailed` when it would push this tracker
    /// or an ancestor past its limit.
    pub fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        self.mem_tracker = Some(tracker);
    }

    pub fn size(&self) -> usize {
        match &self.layout {
            SetLayout::SingleLevel(set) => set.len(),
            SetLayout::TwoLevel(shards) => shards.iter().map(|s| s.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_two_level(&self) -> bool {
        matches!(self.layout, SetLayout::TwoLevel(_))
    }

    pub fn reserved_memory_usage(&self) -> usize {
        self.capacity * SLOT_BYTES + self.key_bytes
    }

    pub fn allocated_memory_usage(&self) -> usize {
        self.size() * SLOT_BYTES + self.key_bytes
    }

    /// True when `incoming` more keys may not fit without growing.
    pub fn needs_expansion(&self, incoming: usize) -> bool {
        let real = real_capacity(self.capacity);
        let size = self.size();
        real <= size || real - size < incoming
    }

    fn reserve_for(&mut self, incoming: usize, incoming_key_bytes: usize) -> ExecResult<()> {
        let required = self.size().saturating_add(incoming);
        if required <= real_capacity(self.capacity) {
            return Ok(());
        }
        let new_capacity = capacity_for(required);
        let growth = (new_capacity - self.capacity) * SLOT_BYTES + incoming_key_bytes;
        if let Some(tracker) = self.mem_tracker.as_ref()
            && let Some(label) = tracker.limit_exceeded_by(i64::try_from(growth).unwrap_or(i64::MAX))
        {
            return Err(ExecError::mem_alloc_failed(format!(
                "agg hash set growth to {} buckets ({} bytes) exceeds memory limit of {}",
                new_capacity, growth, label
            )));
        }
        let additional = required - self.size();
        let result = match &mut self.layout {
            SetLayout::SingleLevel(set) => set.try_reserve(additional),
            SetLayout::TwoLevel(shards) => {
                let per_shard = additional / TWO_LEVEL_NUM_SHARDS + 1;
                shards
                    .iter_mut()
                    .try_for_each(|shard| shard.try_reserve(per_shard))
            }
        };
        result.map_err(|e| {
            ExecError::mem_alloc_failed(format!(
                "agg hash set reserve of {} keys failed: {:?}",
                additional, e
            ))
        })?;
        self.capacity = new_capacity;
        Ok(())
    }

    fn insert_key(&mut self, key: &[u8]) -> bool {
        let table = match &mut self.layout {
            SetLayout::SingleLevel(set) => set,
            SetLayout::TwoLevel(shards) => &mut shards[shard_of(key)],
        };
        if table.contains(key) {
            return false;
        }
        table.insert(Box::from(key));
        self.key_bytes += key.len();
        true
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        match &self.layout {
            SetLayout::SingleLevel(set) => set.contains(key),
            SetLayout::TwoLevel(shards) => shards[shard_of(key)].contains(key),
        }
    }

    /// Insert every row's key, growing as needed. Returns the number of new keys.
    pub fn build_hash_set(&mut self, keys: &[ArrayRef]) -> ExecResult<usize> {
        let rows = self.codec.encode(keys)?;
        let incoming_key_bytes = rows.iter().map(|r| r.as_ref().len()).sum::<usize>();
        self.reserve_for(rows.num_rows(), incoming_key_bytes)?;
        let mut inserted = 0;
        for row in rows.iter() {
            if self.insert_key(row.as_ref()) {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Mark each row `1` if its key is already present, `0` otherwise. Never grows the set.
    pub fn build_hash_set_with_selection(
        &self,
        keys: &[ArrayRef],
        selection: &mut Vec<u8>,
    ) -> ExecResult<()> {
        let rows = self.codec.encode(keys)?;
        selection.clear();
        selection.extend(rows.iter().map(|row| u8::from(self.contains_key(row.as_ref()))));
        Ok(())
    }

    /// Switch to the sharded layout once reserved memory reaches the threshold.
    pub fn try_convert_to_two_level(&mut self) -> bool {
        if self.is_two_level() {
            return false;
        }
        let threshold = usize::try_from(self.two_level_threshold_bytes.max(0)).unwrap_or(usize::MAX);
        if self.reserved_memory_usage() < threshold {
            return false;
        }
        let SetLayout::SingleLevel(set) =
            std::mem::replace(&mut self.layout, SetLayout::TwoLevel(Vec::new()))
        else {
            return false;
        };
        let per_shard = self.capacity / TWO_LEVEL_NUM_SHARDS + 1;
        let mut shards = (0..TWO_LEVEL_NUM_SHARDS)
            .map(|_| KeyTable::with_capacity(per_shard))
            .collect::<Vec<_>>();
        for key in set {
            shards[shard_of(&key)].insert(key);
        }
        self.layout = SetLayout::TwoLevel(shards);
        true
    }

    /// Move all keys out, leaving an empty single-level set with zero capacity.
    pub fn take_keys(&mut self) -> Vec<Box<[u8]>> {
        let layout = std::mem::replace(&mut self.layout, SetLayout::SingleLevel(KeyTable::new()));
        self.capacity = 0;
        self.key_bytes = 0;
        match layout {
            SetLayout::SingleLevel(set) => set.into_iter().collect(),
            SetLayout::TwoLevel(shards) => shards.into_iter().flatten().collect(),
        }
    }

    /// Decode `keys` into a chunk whose columns carry `slots`.
    pub fn output_chunk(&self, keys: &[Box<[u8]>], slots: &[SlotId]) -> ExecResult<Chunk> {
        let columns = self.codec.decode(keys.iter().map(|k| k.as_ref()))?;
        if columns.len() != slots.len() {
            return Err(ExecError::internal(format!(
                "agg hash set output expects {} slots, got {}",
                columns.len(),
                slots.len()
            )));
        }
        Chunk::from_columns(slots.iter().copied().zip(columns).collect())
    }

    pub fn reset(&mut self) {
        let _ = self.take_keys();
    }
}

fn shard_of(key: &[u8]) -> usize {
    (hash_key(key) >> SHARD_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    fn strings(values: &[&str]) -> Vec<ArrayRef> {
        vec![Arc::new(StringArray::from(values.to_vec())) as ArrayRef]
    }

    #[test]
    fn capacity_keeps_load_factor() {
        assert_eq!(capacity_for(1), 2);
        assert_eq!(capacity_for(7), 8);
        assert_eq!(capacity_for(8), 16);
        for required in 1..2000usize {
            assert!(real_capacity(capacity_for(required)) >= required);
        }
    }

    #[test]
    fn expansion_boundary_at_real_capacity() {
        let mut set = AggHashSet::try_new(vec![DataType::Int64], i64::MAX).expect("set");
        let keys: Vec<ArrayRef> = vec![Arc::new(Int64Array::from((0..7).collect::<Vec<i64>>()))];
        set.build_hash_set(&keys).expect("build");
        assert_eq!(set.capacity(), 8);
        assert_eq!(real_capacity(set.capacity()), set.size());
        assert!(set.needs_expansion(0));
        assert!(set.needs_expansion(1));
    }

    #[test]
    fn selection_marks_existing_keys_without_growth() {
        let mut set = AggHashSet::try_new(vec![DataType::Utf8], i64::MAX).expect("set");
        set.build_hash_set(&strings(&["a", "b"])).expect("build");
        let capacity = set.capacity();
        let mut selection = Vec::new();
        set.build_hash_set_with_selection(&strings(&["b", "c", "a"]), &mut selection)
            .expect("selection");
        assert_eq!(selection, vec![1, 0, 1]);
        assert_eq!(set.size(), 2);
        assert_eq!(set.capacity(), capacity);
    }

    #[test]
    fn converts_to_two_level_and_keeps_keys() {
        let mut set = AggHashSet::try_new(vec![DataType::Int64], 1).expect("set");
        let keys: Vec<ArrayRef> = vec![Arc::new(Int64Array::from((0..100).collect::<Vec<i64>>()))];
        set.build_hash_set(&keys).expect("build");
        assert!(set.try_convert_to_two_level());
        assert!(set.is_two_level());
        assert_eq!(set.size(), 100);
        assert_eq!(set.build_hash_set(&keys).expect("rebuild"), 0);
        assert_eq!(set.size(), 100);
        assert!(set.allocated_memory_usage() <= set.reserved_memory_usage());
    }

    #[test]
    fn memory_limit_surfaces_alloc_failure() {
        let tracker = MemTracker::new_root_with_limit("agg", 64);
        let mut set = AggHashSet::try_new(vec![DataType::Int64], i64::MAX).expect("set");
        set.set_mem_tracker(tracker);
        let keys: Vec<ArrayRef> = vec![Arc::new(Int64Array::from((0..1000).collect::<Vec<i64>>()))];
        let err = set.build_hash_set(&keys).expect_err("limit");
        assert!(err.is_mem_alloc_failed(), "err={err}");
        assert_eq!(set.size(), 0);
    }

    #[test]
    fn output_chunk_decodes_keys() {
        let mut set = AggHashSet::try_new(vec![DataType::Utf8], i64::MAX).expect("set");
        set.build_hash_set(&strings(&["x", "y", "x"])).expect("build");
        let keys = set.take_keys();
        assert_eq!(set.size(), 0);
        assert_eq!(set.reserved_memory_usage(), 0);
        let chunk = set.output_chunk(&keys, &[SlotId::new(1)]).expect("output");
        assert_eq!(chunk.num_rows(), 2);
    }
}
