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
//! Hash-table primitives for join key indexing.
//!
//! Responsibilities:
//! - Maps each encoded build key to the head of a chain of build row ids.
//! - Skips build rows with a null key; they can never match under `=`.
//! - Accounts its footprint on a memory tracker and releases it on drop.
//!
//! Key exported interfaces:
//! - Types: `JoinHashTable`.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use hashbrown::HashMap;

use crate::common::status::{ExecError, ExecResult};
use crate::exec::hash_table::key_codec::{KeyCodec, key_null_mask};
use crate::runtime::mem_tracker::MemTracker;

pub(crate) const ROW_NONE: u32 = u32::MAX;

const BUCKET_BYTES: usize = std::mem::size_of::<(Box<[u8]>, u32)>();

/// Key index over the concatenated build rows. Row ids are positions in that concatenation.
pub(crate) struct JoinHashTable {
    codec: KeyCodec,
    buckets: HashMap<Box<[u8]>, u32>,
    row_next: Vec<u32>,
    key_bytes: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl JoinHashTable {
    pub(crate) fn new(key_types: Vec<DataType>) -> ExecResult<Self> {
        if key_types.is_empty() {
            return Err(ExecError::invalid_argument("join hash table requires join keys"));
        }
        Ok(Self {
            codec: KeyCodec::try_new(key_types)?,
            buckets: HashMap::new(),
            row_next: Vec::new(),
            key_bytes: 0,
            mem_tracker: None,
            accounted_bytes: 0,
        })
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            if Arc::ptr_eq(current, &tracker) {
                return;
            }
            current.release(self.accounted_bytes);
            self.accounted_bytes = 0;
        }
        self.mem_tracker = Some(tracker);
        self.update_accounting();
    }

    pub(crate) fn num_rows(&self) -> usize {
        self.row_next.len()
    }

    pub(crate) fn num_keys(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub(crate) fn memory_usage(&self) -> usize {
        self.buckets.capacity() * BUCKET_BYTES
            + self.row_next.capacity() * std::mem::size_of::<u32>()
            + self.key_bytes
    }

    /// Index the next `keys[0].len()` build rows.
    pub(crate) fn add_build_rows(&mut self, keys: &[ArrayRef]) -> ExecResult<()> {
        let keys = self.cast_keys(keys)?;
        let num_rows = keys.first().map(|k| k.len()).unwrap_or(0);
        if num_rows == 0 {
            return Ok(());
        }
        let base = self.row_next.len();
        if base + num_rows > ROW_NONE as usize {
            return Err(ExecError::mem_alloc_failed(format!(
                "join build row count overflow: {} + {}",
                base, num_rows
            )));
        }
        self.row_next
            .try_reserve(num_rows)
            .map_err(|e| ExecError::mem_alloc_failed(format!("join row chain reserve failed: {e}")))?;
        self.buckets
            .try_reserve(num_rows)
            .map_err(|e| ExecError::mem_alloc_failed(format!("join bucket reserve failed: {e:?}")))?;

        let rows = self.codec.encode(&keys)?;
        let nulls = key_null_mask(&keys, num_rows);
        for (row, key) in rows.iter().enumerate() {
            let row_id = (base + row) as u32;
            if nulls[row] {
                self.row_next.push(ROW_NONE);
                continue;
            }
            let bytes: &[u8] = key.as_ref();
            match self.buckets.get_mut(bytes) {
                Some(head) => {
                    self.row_next.push(*head);
                    *head = row_id;
                }
                None => {
                    self.row_next.push(ROW_NONE);
                    self.key_bytes += bytes.len();
                    self.buckets.insert(Box::from(bytes), row_id);
                }
            }
        }
        self.update_accounting();
        Ok(())
    }

    /// First matching build row per probe row, `ROW_NONE` for misses and null keys.
    pub(crate) fn probe_heads(&self, keys: &[ArrayRef]) -> ExecResult<Vec<u32>> {
        let keys = self.cast_keys(keys)?;
        let num_rows = keys.first().map(|k| k.len()).unwrap_or(0);
        if num_rows == 0 {
            return Ok(Vec::new());
        }
        if self.buckets.is_empty() {
            return Ok(vec![ROW_NONE; num_rows]);
        }
        let rows = self.codec.encode(&keys)?;
        let nulls = key_null_mask(&keys, num_rows);
        Ok(rows
            .iter()
            .enumerate()
            .map(|(row, key)| {
                if nulls[row] {
                    ROW_NONE
                } else {
                    self.buckets.get(key.as_ref()).copied().unwrap_or(ROW_NONE)
                }
            })
            .collect())
    }

    /// Next build row sharing the key of `row_id`.
    pub(crate) fn next_row(&self, row_id: u32) -> u32 {
        self.row_next.get(row_id as usize).copied().unwrap_or(ROW_NONE)
    }

    fn cast_keys(&self, keys: &[ArrayRef]) -> ExecResult<Vec<ArrayRef>> {
        let types = self.codec.data_types();
        if keys.len() != types.len() {
            return Err(ExecError::internal(format!(
                "join hash table expects {} key columns, got {}",
                types.len(),
                keys.len()
            )));
        }
        keys.iter()
            .zip(types)
            .map(|(key, data_type)| {
                if key.data_type() == data_type {
                    Ok(Arc::clone(key))
                } else {
                    Ok(cast(key, data_type)?)
                }
            })
            .collect()
    }

    fn update_accounting(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = i64::try_from(self.memory_usage()).unwrap_or(i64::MAX);
        let delta = bytes - self.accounted_bytes;
        if delta > 0 {
            tracker.consume(delta);
        } else if delta < 0 {
            tracker.release(-delta);
        }
        self.accounted_bytes = bytes;
    }
}

impl Drop for JoinHashTable {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.take() {
            tracker.release(self.accounted_bytes);
        }
    }
}
