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
//! Split-block bloom runtime filters.
//!
//! Responsibilities:
//! - Builds a blocked bloom filter over the hashed build keys of one join key column.
//! - Tests probe rows; false positives pass, false negatives never occur.
//!
//! Key exported interfaces:
//! - Types: `RuntimeBloomFilter`.
//!
//! Current limitations:
//! - Null probe keys are rejected, so filters are only published for joins where a
//!   null key can never produce output.

use arrow::array::{Array, ArrayRef};
use arrow::compute::cast;
use arrow::datatypes::DataType;

use crate::common::ids::{PlanNodeId, SlotId};
use crate::common::status::ExecResult;
use crate::exec::hash_table::hash::hash_key;
use crate::exec::hash_table::key_codec::{KeyCodec, key_null_mask};

const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];

/// 256-bit blocks, one word per salt.
#[derive(Clone, Debug)]
struct SimdBlockFilter {
    log_num_buckets: u32,
    directory_mask: u32,
    directory: Vec<u32>,
}

impl SimdBlockFilter {
    fn with_bits(num_bits: u64) -> Self {
        let log_heap_space = (num_bits.max(256) as f64).log2().ceil() as u32;
        // Each bucket holds 256 bits.
        let log_num_buckets = log_heap_space.saturating_sub(8).clamp(1, 31);
        let directory_mask = ((1u64 << log_num_buckets) - 1) as u32;
        Self {
            log_num_buckets,
            directory_mask,
            directory: vec![0u32; (1usize << log_num_buckets) * 8],
        }
    }

    fn insert_hash(&mut self, hash: u64) {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let masks = make_mask((hash >> 32) as u32);
        let base = bucket_idx as usize * 8;
        for (i, mask) in masks.iter().enumerate() {
            self.directory[base + i] |= *mask;
        }
    }

    fn test_hash(&self, hash: u64) -> bool {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let masks = make_mask((hash >> 32) as u32);
        let base = bucket_idx as usize * 8;
        masks
            .iter()
            .enumerate()
            .all(|(i, mask)| self.directory[base + i] & *mask != 0)
    }

    fn memory_usage(&self) -> usize {
        self.directory.len() * std::mem::size_of::<u32>()
    }
}

fn make_mask(key: u32) -> [u32; 8] {
    let mut masks = [0u32; 8];
    for (i, salt) in SALT.iter().enumerate() {
        masks[i] = 1u32 << (key.wrapping_mul(*salt) >> 27);
    }
    masks
}

#[derive(Debug)]
pub struct RuntimeBloomFilter {
    build_plan_node_id: PlanNodeId,
    probe_slot: SlotId,
    key_type: DataType,
    codec: KeyCodec,
    bf: SimdBlockFilter,
    num_keys: usize,
}

impl RuntimeBloomFilter {
    pub fn build(
        build_plan_node_id: PlanNodeId,
        probe_slot: SlotId,
        build_columns: &[ArrayRef],
        bits_per_key: usize,
    ) -> ExecResult<Option<Self>> {
        let Some(first) = build_columns.first() else {
            return Ok(None);
        };
        let key_type = first.data_type().clone();
        let codec = KeyCodec::try_new(vec![key_type.clone()])?;
        let num_rows = build_columns.iter().map(|c| c.len()).sum::<usize>();
        let mut bf = SimdBlockFilter::with_bits((num_rows.max(1) * bits_per_key.max(1)) as u64);
        let mut num_keys = 0;
        for column in build_columns {
            let columns = std::slice::from_ref(column);
            let rows = codec.encode(columns)?;
            let nulls = key_null_mask(columns, column.len());
            for (row, key) in rows.iter().enumerate() {
                if nulls[row] {
                    continue;
                }
                bf.insert_hash(hash_key(key.as_ref()));
                num_keys += 1;
            }
        }
        Ok(Some(Self {
            build_plan_node_id,
            probe_slot,
            key_type,
            codec,
            bf,
            num_keys,
        }))
    }

    pub fn build_plan_node_id(&self) -> PlanNodeId {
        self.build_plan_node_id
    }

    pub fn probe_slot(&self) -> SlotId {
        self.probe_slot
    }

    pub fn num_keys(&self) -> usize {
        self.num_keys
    }

    pub fn memory_usage(&self) -> usize {
        self.bf.memory_usage()
    }

    /// Per-row "may contain" result for a probe column.
    pub fn test_column(&self, column: &ArrayRef) -> ExecResult<Vec<bool>> {
        let column = if column.data_type() == &self.key_type {
            std::sync::Arc::clone(column)
        } else {
            cast(column, &self.key_type)?
        };
        let columns = std::slice::from_ref(&column);
        let rows = self.codec.encode(columns)?;
        let nulls = key_null_mask(columns, column.len());
        Ok(rows
            .iter()
            .enumerate()
            .map(|(row, key)| !nulls[row] && self.bf.test_hash(hash_key(key.as_ref())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array};
    use std::sync::Arc;

    #[test]
    fn no_false_negatives() {
        let build: ArrayRef = Arc::new(Int64Array::from((0..5000).map(|v| v * 3).collect::<Vec<i64>>()));
        let bf = RuntimeBloomFilter::build(7, SlotId::new(1), &[Arc::clone(&build)], 10)
            .expect("build")
            .expect("filter");
        assert_eq!(bf.num_keys(), 5000);
        let hits = bf.test_column(&build).expect("test");
        assert!(hits.iter().all(|v| *v));
    }

    #[test]
    fn mostly_rejects_absent_keys_and_casts_probe() {
        let build: ArrayRef = Arc::new(Int64Array::from((0..1000).collect::<Vec<i64>>()));
        let bf = RuntimeBloomFilter::build(7, SlotId::new(1), &[build], 10)
            .expect("build")
            .expect("filter");
        let probe: ArrayRef = Arc::new(Int32Array::from((100_000..110_000).collect::<Vec<i32>>()));
        let hits = bf.test_column(&probe).expect("test");
        let passed = hits.iter().filter(|v| **v).count();
        assert!(passed < 1000, "false positive count too high: {passed}");
        let probe: ArrayRef = Arc::new(Int32Array::from(vec![Some(5), None]));
        assert_eq!(bf.test_column(&probe).expect("test"), vec![true, false]);
    }
}
