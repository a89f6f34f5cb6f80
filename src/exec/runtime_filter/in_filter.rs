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
//! Exact-value IN runtime filters.
//!
//! Responsibilities:
//! - Collects the distinct non-null build keys of one join key column.
//! - Turns them into an `IN` predicate over the probe slot.
//!
//! Key exported interfaces:
//! - Types: `RuntimeInFilter`.
//!
//! Current limitations:
//! - Built only when the distinct key count stays under the configured maximum.

use std::sync::Arc;

use arrow::array::ArrayRef;

use crate::common::ids::{PlanNodeId, SlotId};
use crate::common::status::ExecResult;
use crate::exec::expr::{ExprContext, InPredicate};
use crate::exec::hash_table::key_codec::{KeyCodec, KeySet};

#[derive(Clone, Debug)]
/// IN runtime filter storing exact candidate values for one probe slot.
pub struct RuntimeInFilter {
    build_plan_node_id: PlanNodeId,
    probe_slot: SlotId,
    values: Arc<KeySet>,
}

impl RuntimeInFilter {
    /// Returns `None` when the build side has more than `max_values` distinct keys.
    pub fn try_build(
        build_plan_node_id: PlanNodeId,
        probe_slot: SlotId,
        build_columns: &[ArrayRef],
        max_values: usize,
    ) -> ExecResult<Option<Self>> {
        let Some(first) = build_columns.first() else {
            return Ok(None);
        };
        let codec = KeyCodec::try_new(vec![first.data_type().clone()])?;
        let mut values = KeySet::new(codec);
        for column in build_columns {
            values.insert_non_null(std::slice::from_ref(column))?;
            if values.len() > max_values {
                return Ok(None);
            }
        }
        Ok(Some(Self {
            build_plan_node_id,
            probe_slot,
            values: Arc::new(values),
        }))
    }

    pub fn build_plan_node_id(&self) -> PlanNodeId {
        self.build_plan_node_id
    }

    pub fn probe_slot(&self) -> SlotId {
        self.probe_slot
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn to_predicate(&self) -> ExprContext {
        Arc::new(InPredicate::from_key_set(
            self.probe_slot,
            Arc::clone(&self.values),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::chunk::Chunk;
    use arrow::array::Int32Array;

    #[test]
    fn too_many_values_yields_no_filter() {
        let build: ArrayRef = Arc::new(Int32Array::from((0..10).collect::<Vec<i32>>()));
        let filter = RuntimeInFilter::try_build(1, SlotId::new(2), &[Arc::clone(&build)], 4)
            .expect("build");
        assert!(filter.is_none());
        let filter = RuntimeInFilter::try_build(1, SlotId::new(2), &[build], 10)
            .expect("build")
            .expect("filter");
        assert_eq!(filter.num_values(), 10);
    }

    #[test]
    fn predicate_filters_probe_slot() {
        let build: ArrayRef = Arc::new(Int32Array::from(vec![Some(3), None, Some(5)]));
        let filter = RuntimeInFilter::try_build(1, SlotId::new(2), &[build], 16)
            .expect("build")
            .expect("filter");
        let probe = Chunk::from_columns(vec![(
            SlotId::new(2),
            Arc::new(Int32Array::from(vec![Some(5), Some(4), None])) as ArrayRef,
        )])
        .expect("chunk");
        let mask = filter.to_predicate().evaluate(&probe).expect("eval");
        assert_eq!(mask.true_count(), 1);
        assert!(mask.value(0));
    }
}
