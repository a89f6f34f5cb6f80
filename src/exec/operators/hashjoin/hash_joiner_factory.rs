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
//! Creation of builders and probers for one hash join node.
//!
//! Responsibilities:
//! - Partitioned joins get one joiner per partition, used as both builder and prober.
//! - Broadcast joins get one shared builder and a fresh prober per probe driver; each
//!   prober keeps the builder alive until it is closed.
//! - Publishes the node's runtime filters once every builder has finished.
//!
//! Key exported interfaces:
//! - Types: `HashJoinerFactory`, `JoinDistributionMode`.

use std::sync::{Arc, Mutex};

use arrow::array::ArrayRef;

use crate::common::config;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::runtime_filter::{
    RuntimeBloomFilter, RuntimeFilterHub, RuntimeFilterSet, RuntimeInFilter,
};
use crate::novarocks_logging::info;

use super::hash_joiner::{HashJoiner, HashJoinerParam};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinDistributionMode {
    Broadcast,
    Partitioned,
}

struct PublishState {
    remaining: usize,
    key_columns: Vec<Vec<ArrayRef>>,
}

/// Merges the build keys of every builder of a node into one runtime filter set.
pub(crate) struct JoinRuntimeFilterPublisher {
    param: Arc<HashJoinerParam>,
    hub: Option<Arc<RuntimeFilterHub>>,
    state: Mutex<PublishState>,
}

impl JoinRuntimeFilterPublisher {
    fn new(param: Arc<HashJoinerParam>, hub: Option<Arc<RuntimeFilterHub>>, num_builders: usize) -> Self {
        let num_keys = param.build_keys.len();
        Self {
            param,
            hub,
            state: Mutex::new(PublishState {
                remaining: num_builders,
                key_columns: vec![Vec::new(); num_keys],
            }),
        }
    }

    /// Record one finished builder; the last one publishes.
    pub(crate) fn add_builder(&self, builder: &HashJoiner) -> ExecResult<()> {
        let Some(hub) = self.hub.as_ref() else {
            return Ok(());
        };
        let key_columns = {
            let mut state = self.state.lock().expect("join runtime filter lock");
            if state.remaining == 0 {
                return Err(ExecError::internal(format!(
                    "hash join {} reported more builders than expected",
                    self.param.plan_node_id
                )));
            }
            for (idx, column) in builder.build_key_columns().into_iter().enumerate() {
                if let Some(columns) = state.key_columns.get_mut(idx) {
                    columns.push(column);
                }
            }
            state.remaining -= 1;
            if state.remaining > 0 {
                return Ok(());
            }
            std::mem::take(&mut state.key_columns)
        };
        let filters = self.build_filters(&key_columns)?;
        info!(
            "hash join runtime filters: node_id={} in_filters={} bloom_filters={}",
            self.param.plan_node_id,
            filters.in_filters.len(),
            filters.bloom_filters.len()
        );
        hub.publish(self.param.plan_node_id, filters)
    }

    fn build_filters(&self, key_columns: &[Vec<ArrayRef>]) -> ExecResult<RuntimeFilterSet> {
        let mut filters = RuntimeFilterSet::default();
        // Unsupported joins still publish an empty set so gated probe drivers wake up.
        if !self.param.join_type.supports_runtime_filters() {
            return Ok(filters);
        }
        let cfg = config::runtime_filter_config();
        let node_id = self.param.plan_node_id;
        for (columns, probe_slot) in key_columns.iter().zip(&self.param.probe_key_slots) {
            if let Some(in_filter) =
                RuntimeInFilter::try_build(node_id, *probe_slot, columns, cfg.in_filter_max_values)?
            {
                filters.in_filters.push(Arc::new(in_filter));
            }
            if let Some(bloom) =
                RuntimeBloomFilter::build(node_id, *probe_slot, columns, cfg.bloom_filter_bits_per_key)?
            {
                filters.bloom_filters.push(Arc::new(bloom));
            }
        }
        Ok(filters)
    }
}

pub struct HashJoinerFactory {
    param: Arc<HashJoinerParam>,
    mode: JoinDistributionMode,
    builders: Mutex<Vec<Arc<HashJoiner>>>,
    rf_publisher: Arc<JoinRuntimeFilterPublisher>,
}

impl HashJoinerFactory {
    /// `build_dop` build drivers feed the join; for partitioned joins it is also the
    /// number of partitions and must match the probe dop.
    pub fn try_new(
        param: HashJoinerParam,
        mode: JoinDistributionMode,
        build_dop: usize,
        runtime_filter_hub: Option<Arc<RuntimeFilterHub>>,
    ) -> ExecResult<Arc<Self>> {
        param.validate()?;
        let build_dop = build_dop.max(1);
        let param = Arc::new(param);
        let (builders, num_publishers) = match mode {
            JoinDistributionMode::Broadcast => {
                (vec![Arc::new(HashJoiner::new(Arc::clone(&param), build_dop))], 1)
            }
            JoinDistributionMode::Partitioned => (
                (0..build_dop)
                    .map(|_| Arc::new(HashJoiner::new(Arc::clone(&param), 1)))
                    .collect(),
                build_dop,
            ),
        };
        let rf_publisher = Arc::new(JoinRuntimeFilterPublisher::new(
            Arc::clone(&param),
            runtime_filter_hub,
            num_publishers,
        ));
        Ok(Arc::new(Self {
            param,
            mode,
            builders: Mutex::new(builders),
            rf_publisher,
        }))
    }

    pub fn param(&self) -> &Arc<HashJoinerParam> {
        &self.param
    }

    pub fn mode(&self) -> JoinDistributionMode {
        self.mode
    }

    /// Builder fed by build driver `driver_sequence`.
    pub fn get_builder(&self, driver_sequence: i32) -> ExecResult<Arc<HashJoiner>> {
        let builders = self.builders.lock().expect("hash joiner factory lock");
        let idx = match self.mode {
            JoinDistributionMode::Broadcast => 0,
            JoinDistributionMode::Partitioned => driver_sequence.max(0) as usize,
        };
        builders.get(idx).cloned().ok_or_else(|| {
            ExecError::internal(format!(
                "hash join {} has no builder for driver {} (builders={})",
                self.param.plan_node_id,
                driver_sequence,
                builders.len()
            ))
        })
    }

    /// Prober driven by probe driver `driver_sequence`.
    pub fn create_prober(&self, driver_sequence: i32) -> ExecResult<Arc<HashJoiner>> {
        match self.mode {
            JoinDistributionMode::Broadcast => {
                // Probers never build; their own build-driver count stays zero.
                Ok(Arc::new(HashJoiner::new(Arc::clone(&self.param), 0)))
            }
            JoinDistributionMode::Partitioned => self.get_builder(driver_sequence),
        }
    }

    pub(crate) fn rf_publisher(&self) -> &Arc<JoinRuntimeFilterPublisher> {
        &self.rf_publisher
    }

    /// Release the factory's builder references. Operators still holding one keep it alive.
    pub fn close(&self) {
        self.builders
            .lock()
            .expect("hash joiner factory lock")
            .clear();
    }
}
