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
//! Operator factory contract and runtime-filter wiring.
//!
//! Responsibilities:
//! - Separates plan-time operator configuration from the per-driver operator instances.
//! - Owns the runtime-filter state shared by every instance of one factory, including
//!   the one-shot binding of published in-filters.
//!
//! Key exported interfaces:
//! - Types: `OperatorFactory`, `OperatorFactoryBase`, `FactoryRuntimeFilters`, `RowDescriptor`.
//!
//! Current limitations:
//! - In-filters are bound once per factory; filters published after binding are ignored.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::common::ids::{PlanNodeId, SlotId, TupleSlotMapping};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::expr::ExprContext;
use crate::exec::runtime_filter::{
    LocalRFWaitingSet, RuntimeBloomFilter, RuntimeFilterHub, RuntimeFilterProbeCollector,
    RuntimeInFilter,
};
use crate::novarocks_logging::debug;
use crate::runtime::runtime_state::RuntimeState;

use super::dependency::DependencyHandle;
use super::operator::{Operator, OperatorBase};

/// Slots visible in the chunks an operator consumes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowDescriptor {
    pub slots: Vec<SlotId>,
}

impl RowDescriptor {
    pub fn new(slots: Vec<SlotId>) -> Self {
        Self { slots }
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.slots.contains(&slot)
    }
}

struct RuntimeFilterWiring {
    hub: Arc<RuntimeFilterHub>,
    wait_set: LocalRFWaitingSet,
    row_desc: RowDescriptor,
    probe_collector: RuntimeFilterProbeCollector,
    filter_null_value_columns: Vec<SlotId>,
    tuple_slot_mappings: Vec<TupleSlotMapping>,
}

/// Runtime-filter state shared by all operator instances of one factory.
#[derive(Default)]
pub struct FactoryRuntimeFilters {
    wiring: OnceLock<RuntimeFilterWiring>,
    in_filters: OnceLock<Arc<Vec<ExprContext>>>,
    in_filter_builds: AtomicUsize,
}

impl FactoryRuntimeFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the factory to the fragment's hub. May be called once.
    pub fn init_runtime_filter(
        &self,
        hub: Arc<RuntimeFilterHub>,
        wait_set: LocalRFWaitingSet,
        row_desc: RowDescriptor,
        probe_collector: RuntimeFilterProbeCollector,
        filter_null_value_columns: Vec<SlotId>,
        tuple_slot_mappings: Vec<TupleSlotMapping>,
    ) -> ExecResult<()> {
        let probe_collector = probe_collector.with_column_mapping(&tuple_slot_mappings);
        let wiring = RuntimeFilterWiring {
            hub,
            wait_set,
            row_desc,
            probe_collector,
            filter_null_value_columns,
            tuple_slot_mappings,
        };
        self.wiring
            .set(wiring)
            .map_err(|_| ExecError::internal("runtime filters already initialized"))
    }

    pub fn is_initialized(&self) -> bool {
        self.wiring.get().is_some()
    }

    pub fn has_runtime_filters(&self) -> ExecResult<bool> {
        let wiring = self
            .wiring
            .get()
            .ok_or_else(|| ExecError::internal("runtime filters are not initialized"))?;
        Ok(!wiring.wait_set.is_empty()
            || !wiring.probe_collector.is_empty()
            || !wiring.filter_null_value_columns.is_empty())
    }

    pub fn rf_waiting_set(&self) -> LocalRFWaitingSet {
        self.wiring
            .get()
            .map(|w| w.wait_set.clone())
            .unwrap_or_default()
    }

    pub fn hub(&self) -> Option<&Arc<RuntimeFilterHub>> {
        self.wiring.get().map(|w| &w.hub)
    }

    pub fn probe_collector(&self) -> Option<&RuntimeFilterProbeCollector> {
        self.wiring.get().map(|w| &w.probe_collector)
    }

    pub fn filter_null_value_columns(&self) -> &[SlotId] {
        self.wiring
            .get()
            .map(|w| w.filter_null_value_columns.as_slice())
            .unwrap_or(&[])
    }

    /// Dependency of the first plan node in the wait set that has not published.
    pub fn pending_dependency(&self) -> Option<DependencyHandle> {
        let wiring = self.wiring.get()?;
        wiring.hub.first_pending_dependency(&wiring.wait_set)
    }

    pub fn runtime_in_filters(&self) -> Vec<Arc<RuntimeInFilter>> {
        let Some(wiring) = self.wiring.get() else {
            return Vec::new();
        };
        wiring
            .wait_set
            .iter()
            .flat_map(|id| wiring.hub.in_filters(*id))
            .collect()
    }

    pub fn runtime_bloom_filters(&self) -> Vec<Arc<RuntimeBloomFilter>> {
        let Some(wiring) = self.wiring.get() else {
            return Vec::new();
        };
        wiring
            .wait_set
            .iter()
            .flat_map(|id| wiring.hub.bloom_filters(*id))
            .collect()
    }

    /// Number of times the in-filter predicates were constructed; at most one.
    pub fn in_filter_build_count(&self) -> usize {
        self.in_filter_builds.load(Ordering::Relaxed)
    }

    /// Turn the published in-filters into predicates over this factory's row layout.
    ///
    /// Computed once per factory; every instance shares the result. Fails when
    /// called before all filters of the wait set have arrived.
    pub fn prepare_runtime_in_filters(&self) -> ExecResult<Arc<Vec<ExprContext>>> {
        if let Some(filters) = self.in_filters.get() {
            return Ok(Arc::clone(filters));
        }
        let Some(wiring) = self.wiring.get() else {
            return Ok(Arc::clone(self.in_filters.get_or_init(|| Arc::new(Vec::new()))));
        };
        if !wiring.hub.all_ready(&wiring.wait_set) {
            return Err(ExecError::internal(
                "runtime in-filters bound before the wait set is ready",
            ));
        }
        // Concurrent first callers block here until the single build completes.
        let filters = self.in_filters.get_or_init(|| {
            self.in_filter_builds.fetch_add(1, Ordering::Relaxed);
            let exprs = self
                .runtime_in_filters()
                .into_iter()
                .map(|filter| {
                    filter
                        .to_predicate()
                        .with_column_mapping(&wiring.tuple_slot_mappings)
                })
                .filter(|expr| expr.slot_ids().iter().all(|slot| wiring.row_desc.contains(*slot)))
                .collect::<Vec<_>>();
            debug!("runtime in-filters bound: count={}", exprs.len());
            Arc::new(exprs)
        });
        Ok(Arc::clone(filters))
    }
}

/// Plan-time state common to every factory.
pub struct OperatorFactoryBase {
    id: i32,
    plan_node_id: PlanNodeId,
    name: String,
    conjuncts: Vec<ExprContext>,
    runtime_filters: Arc<FactoryRuntimeFilters>,
}

impl OperatorFactoryBase {
    pub fn new(id: i32, plan_node_id: PlanNodeId, name: impl Into<String>) -> Self {
        Self {
            id,
            plan_node_id,
            name: name.into(),
            conjuncts: Vec::new(),
            runtime_filters: Arc::new(FactoryRuntimeFilters::new()),
        }
    }

    pub fn with_conjuncts(mut self, conjuncts: Vec<ExprContext>) -> Self {
        self.conjuncts = conjuncts;
        self
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn plan_node_id(&self) -> PlanNodeId {
        self.plan_node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn conjuncts(&self) -> &[ExprContext] {
        &self.conjuncts
    }

    pub fn runtime_filters(&self) -> &Arc<FactoryRuntimeFilters> {
        &self.runtime_filters
    }

    pub fn new_operator_base(&self, driver_sequence: i32) -> OperatorBase {
        OperatorBase::new(
            self.id,
            self.plan_node_id,
            self.name.clone(),
            driver_sequence,
            self.conjuncts.clone(),
            Arc::clone(&self.runtime_filters),
        )
    }
}

/// Factory contract for constructing one operator per driver.
pub trait OperatorFactory: Send + Sync {
    fn base(&self) -> &OperatorFactoryBase;

    fn id(&self) -> i32 {
        self.base().id()
    }

    fn plan_node_id(&self) -> PlanNodeId {
        self.base().plan_node_id()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn create(&self, dop: i32, driver_sequence: i32) -> Box<dyn Operator>;

    fn is_source(&self) -> bool {
        false
    }

    fn prepare(&self, state: &RuntimeState) -> ExecResult<()> {
        let _ = state;
        Ok(())
    }

    fn close(&self, state: &RuntimeState) {
        let _ = state;
    }

    fn runtime_filters(&self) -> &Arc<FactoryRuntimeFilters> {
        self.base().runtime_filters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::runtime_filter::RuntimeFilterSet;
    use arrow::array::{ArrayRef, Int32Array};

    fn in_filter(node: PlanNodeId, slot: u32, values: Vec<i32>) -> Arc<RuntimeInFilter> {
        let build: ArrayRef = Arc::new(Int32Array::from(values));
        Arc::new(
            RuntimeInFilter::try_build(node, SlotId::new(slot), &[build], 16)
                .expect("build")
                .expect("filter"),
        )
    }

    #[test]
    fn has_runtime_filters_requires_init() {
        let rf = FactoryRuntimeFilters::new();
        assert!(!rf.is_initialized());
        assert!(rf.has_runtime_filters().is_err());
        let hub = Arc::new(RuntimeFilterHub::new());
        rf.init_runtime_filter(
            Arc::clone(&hub),
            LocalRFWaitingSet::new(),
            RowDescriptor::default(),
            RuntimeFilterProbeCollector::default(),
            Vec::new(),
            Vec::new(),
        )
        .expect("init");
        assert!(rf.is_initialized());
        assert!(!rf.has_runtime_filters().expect("initialized"));
        let err = rf
            .init_runtime_filter(
                hub,
                LocalRFWaitingSet::new(),
                RowDescriptor::default(),
                RuntimeFilterProbeCollector::default(),
                Vec::new(),
                Vec::new(),
            )
            .expect_err("second init");
        assert_eq!(err.kind_name(), "INTERNAL_ERROR");
    }

    #[test]
    fn in_filters_bound_once_with_mapping_and_row_desc() {
        let hub = Arc::new(RuntimeFilterHub::new());
        let rf = FactoryRuntimeFilters::new();
        rf.init_runtime_filter(
            Arc::clone(&hub),
            [7, 8].into_iter().collect(),
            RowDescriptor::new(vec![SlotId::new(20)]),
            RuntimeFilterProbeCollector::default(),
            Vec::new(),
            vec![TupleSlotMapping {
                from_slot: SlotId::new(2),
                to_slot: SlotId::new(20),
            }],
        )
        .expect("init");

        assert!(rf.prepare_runtime_in_filters().is_err());
        assert_eq!(rf.rf_waiting_set().into_iter().collect::<Vec<_>>(), vec![7, 8]);
        assert!(rf.runtime_bloom_filters().is_empty());
        assert_eq!(
            rf.pending_dependency().map(|d| d.name().to_string()),
            Some("local_rf:7".to_string())
        );

        hub.publish(
            7,
            RuntimeFilterSet {
                in_filters: vec![in_filter(7, 2, vec![1, 2])],
                bloom_filters: Vec::new(),
            },
        )
        .expect("publish");
        hub.publish(
            8,
            RuntimeFilterSet {
                in_filters: vec![in_filter(8, 3, vec![5])],
                bloom_filters: Vec::new(),
            },
        )
        .expect("publish");
        assert!(rf.pending_dependency().is_none());

        let first = rf.prepare_runtime_in_filters().expect("bind");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].slot_ids(), vec![SlotId::new(20)]);
        let second = rf.prepare_runtime_in_filters().expect("bind");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn concurrent_first_binders_share_one_build() {
        let hub = Arc::new(RuntimeFilterHub::new());
        let rf = Arc::new(FactoryRuntimeFilters::new());
        rf.init_runtime_filter(
            Arc::clone(&hub),
            [7].into_iter().collect(),
            RowDescriptor::new(vec![SlotId::new(2)]),
            RuntimeFilterProbeCollector::default(),
            Vec::new(),
            Vec::new(),
        )
        .expect("init");
        hub.publish(
            7,
            RuntimeFilterSet {
                in_filters: vec![in_filter(7, 2, vec![1, 2, 3])],
                bloom_filters: Vec::new(),
            },
        )
        .expect("publish");

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles = (0..8)
            .map(|_| {
                let rf = Arc::clone(&rf);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    rf.prepare_runtime_in_filters().expect("bind")
                })
            })
            .collect::<Vec<_>>();
        let bound = handles
            .into_iter()
            .map(|h| h.join().expect("binder thread"))
            .collect::<Vec<_>>();
        assert_eq!(rf.in_filter_build_count(), 1);
        assert!(bound.iter().all(|f| Arc::ptr_eq(f, &bound[0])));
        assert_eq!(bound[0].len(), 1);
    }
}
