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
//! Probe-side application of bloom runtime filters.
//!
//! Bloom filters are not waited for: a filter is applied from the first chunk
//! after its build side publishes. Each operator instance keeps its own
//! evaluation context and stops applying a filter that keeps passing almost
//! every row.

use crate::common::ids::{PlanNodeId, SlotId, TupleSlotMapping};
use crate::common::status::ExecResult;
use crate::exec::chunk::Chunk;
use crate::novarocks_logging::debug;

use super::hub::RuntimeFilterHub;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RuntimeFilterProbeDescriptor {
    pub build_plan_node_id: PlanNodeId,
    /// Probe slot the filter was built for.
    pub probe_slot: SlotId,
    /// Column the filter is tested against in this operator's chunks.
    pub target_slot: SlotId,
}

impl RuntimeFilterProbeDescriptor {
    pub fn new(build_plan_node_id: PlanNodeId, probe_slot: SlotId) -> Self {
        Self {
            build_plan_node_id,
            probe_slot,
            target_slot: probe_slot,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuntimeFilterProbeCollector {
    descriptors: Vec<RuntimeFilterProbeDescriptor>,
}

#[derive(Clone, Debug, Default)]
struct FilterStats {
    input_rows: usize,
    output_rows: usize,
    disabled: bool,
}

/// Per-operator selectivity bookkeeping for one collector.
#[derive(Clone, Debug)]
pub struct RuntimeBloomFilterEvalContext {
    stats: Vec<FilterStats>,
    min_selectivity_rows: usize,
    skip_pass_ratio: f64,
    input_rows: usize,
    output_rows: usize,
}

impl RuntimeBloomFilterEvalContext {
    pub fn new(num_filters: usize, min_selectivity_rows: usize, skip_pass_ratio: f64) -> Self {
        Self {
            stats: vec![FilterStats::default(); num_filters],
            min_selectivity_rows,
            skip_pass_ratio,
            input_rows: 0,
            output_rows: 0,
        }
    }

    pub fn input_rows(&self) -> usize {
        self.input_rows
    }

    pub fn output_rows(&self) -> usize {
        self.output_rows
    }

    pub fn num_disabled(&self) -> usize {
        self.stats.iter().filter(|s| s.disabled).count()
    }
}

impl RuntimeFilterProbeCollector {
    pub fn new(descriptors: Vec<RuntimeFilterProbeDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn descriptors(&self) -> &[RuntimeFilterProbeDescriptor] {
        &self.descriptors
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn with_column_mapping(&self, mappings: &[TupleSlotMapping]) -> Self {
        let descriptors = self
            .descriptors
            .iter()
            .map(|d| {
                let target_slot = mappings
                    .iter()
                    .find(|m| m.from_slot == d.target_slot)
                    .map(|m| m.to_slot)
                    .unwrap_or(d.target_slot);
                RuntimeFilterProbeDescriptor { target_slot, ..*d }
            })
            .collect();
        Self { descriptors }
    }

    /// Drop rows rejected by any published, still-enabled bloom filter.
    pub fn evaluate(
        &self,
        hub: &RuntimeFilterHub,
        chunk: &mut Chunk,
        ctx: &mut RuntimeBloomFilterEvalContext,
    ) -> ExecResult<()> {
        let num_rows = chunk.num_rows();
        if num_rows == 0 || self.descriptors.is_empty() {
            return Ok(());
        }
        if ctx.stats.len() < self.descriptors.len() {
            ctx.stats.resize(self.descriptors.len(), FilterStats::default());
        }
        let mut selection = vec![1u8; num_rows];
        let mut applied = false;
        for (idx, desc) in self.descriptors.iter().enumerate() {
            if ctx.stats[idx].disabled {
                continue;
            }
            let Some(bf) = hub
                .bloom_filters(desc.build_plan_node_id)
                .into_iter()
                .find(|bf| bf.probe_slot() == desc.probe_slot)
            else {
                continue;
            };
            let column = chunk.column_by_slot_id(desc.target_slot)?;
            let hits = bf.test_column(&column)?;
            let passed = hits.iter().filter(|v| **v).count();
            for (sel, hit) in selection.iter_mut().zip(hits) {
                if !hit {
                    *sel = 0;
                }
            }
            applied = true;

            let stats = &mut ctx.stats[idx];
            stats.input_rows += num_rows;
            stats.output_rows += passed;
            if stats.input_rows >= ctx.min_selectivity_rows
                && stats.output_rows as f64 > stats.input_rows as f64 * ctx.skip_pass_ratio
            {
                stats.disabled = true;
                debug!(
                    "bloom runtime filter disabled: build_node={} slot={} input_rows={} output_rows={}",
                    desc.build_plan_node_id, desc.target_slot, stats.input_rows, stats.output_rows
                );
            }
        }
        if !applied {
            return Ok(());
        }
        ctx.input_rows += num_rows;
        chunk.filter(&selection)?;
        ctx.output_rows += chunk.num_rows();
        Ok(())
    }
}
