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
//! Runtime filters exchanged between the build and probe side of a fragment.
//!
//! Responsibilities:
//! - Builds IN and bloom filters from join build keys.
//! - Routes published filters to probe-side operators through the fragment hub.
//!
//! Key exported interfaces:
//! - Types: `RuntimeFilterHub`, `RuntimeFilterSet`, `RuntimeInFilter`, `RuntimeBloomFilter`,
//!   `RuntimeFilterProbeCollector`, `LocalRFWaitingSet`.

use std::collections::BTreeSet;

use crate::common::ids::PlanNodeId;

mod bloom;
mod hub;
mod in_filter;
mod probe_collector;

pub use bloom::RuntimeBloomFilter;
pub use hub::{RuntimeFilterHub, RuntimeFilterSet};
pub use in_filter::RuntimeInFilter;
pub use probe_collector::{
    RuntimeBloomFilterEvalContext, RuntimeFilterProbeCollector, RuntimeFilterProbeDescriptor,
};

/// Build-side plan nodes whose IN filters an operator must wait for before it runs.
pub type LocalRFWaitingSet = BTreeSet<PlanNodeId>;
