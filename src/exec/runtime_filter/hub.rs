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
//! Fragment-local runtime filter hub.
//!
//! Responsibilities:
//! - Stores the filters published by each build-side plan node, at most once per node.
//! - Exposes one edge-triggered dependency per node so gated drivers are woken on publish.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterHub`, `RuntimeFilterSet`.
//!
//! Current limitations:
//! - Filters never leave the fragment; there is no merge of partial filters from remote instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::ids::PlanNodeId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::dependency::{DependencyHandle, DependencyManager};
use crate::novarocks_logging::debug;

use super::bloom::RuntimeBloomFilter;
use super::in_filter::RuntimeInFilter;
use super::LocalRFWaitingSet;

/// Filters produced by one build-side plan node. Immutable once published.
#[derive(Debug, Default)]
pub struct RuntimeFilterSet {
    pub in_filters: Vec<Arc<RuntimeInFilter>>,
    pub bloom_filters: Vec<Arc<RuntimeBloomFilter>>,
}

impl RuntimeFilterSet {
    pub fn is_empty(&self) -> bool {
        self.in_filters.is_empty() && self.bloom_filters.is_empty()
    }
}

pub struct RuntimeFilterHub {
    dependencies: DependencyManager,
    filters: Mutex<HashMap<PlanNodeId, Arc<RuntimeFilterSet>>>,
}

fn dependency_name(node_id: PlanNodeId) -> String {
    format!("local_rf:{}", node_id)
}

impl RuntimeFilterHub {
    pub fn new() -> Self {
        Self {
            dependencies: DependencyManager::new(),
            filters: Mutex::new(HashMap::new()),
        }
    }

    /// Dependency that becomes ready when `node_id` publishes.
    pub fn dependency(&self, node_id: PlanNodeId) -> DependencyHandle {
        self.dependencies.get_or_create(dependency_name(node_id))
    }

    pub fn publish(&self, node_id: PlanNodeId, filters: RuntimeFilterSet) -> ExecResult<()> {
        {
            let mut guard = self.filters.lock().expect("runtime filter hub lock");
            if guard.contains_key(&node_id) {
                return Err(ExecError::internal(format!(
                    "runtime filters of plan node {} already published",
                    node_id
                )));
            }
            debug!(
                "runtime filter published: node_id={} in_filters={} bloom_filters={}",
                node_id,
                filters.in_filters.len(),
                filters.bloom_filters.len()
            );
            guard.insert(node_id, Arc::new(filters));
        }
        // Notify outside the map lock; waiters may read the hub from their callbacks.
        self.dependency(node_id).set_ready();
        Ok(())
    }

    /// Forget every dependency at fragment end. Waiters of filters that never
    /// arrived are dropped without running.
    pub fn close(&self) {
        let unpublished = self.dependencies.pending();
        let dropped = self.dependencies.clear();
        if !unpublished.is_empty() {
            debug!(
                "runtime filter hub closed: unpublished={:?} dropped_waiters={}",
                unpublished, dropped
            );
        }
    }

    pub fn is_ready(&self, node_id: PlanNodeId) -> bool {
        self.filters
            .lock()
            .expect("runtime filter hub lock")
            .contains_key(&node_id)
    }

    pub fn all_ready(&self, wait_set: &LocalRFWaitingSet) -> bool {
        let guard = self.filters.lock().expect("runtime filter hub lock");
        wait_set.iter().all(|id| guard.contains_key(id))
    }

    /// First node of `wait_set` that has not published yet.
    pub fn first_pending_dependency(&self, wait_set: &LocalRFWaitingSet) -> Option<DependencyHandle> {
        let pending = {
            let guard = self.filters.lock().expect("runtime filter hub lock");
            wait_set.iter().copied().find(|id| !guard.contains_key(id))
        };
        pending.map(|id| self.dependency(id))
    }

    pub fn get(&self, node_id: PlanNodeId) -> Option<Arc<RuntimeFilterSet>> {
        self.filters
            .lock()
            .expect("runtime filter hub lock")
            .get(&node_id)
            .cloned()
    }

    pub fn in_filters(&self, node_id: PlanNodeId) -> Vec<Arc<RuntimeInFilter>> {
        self.get(node_id)
            .map(|set| set.in_filters.clone())
            .unwrap_or_default()
    }

    pub fn bloom_filters(&self, node_id: PlanNodeId) -> Vec<Arc<RuntimeBloomFilter>> {
        self.get(node_id)
            .map(|set| set.bloom_filters.clone())
            .unwrap_or_default()
    }
}

impl Default for RuntimeFilterHub {
    fn default() -> Self {
        Self::new()
    }
}
