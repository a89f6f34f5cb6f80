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
//! Hash join operators.
//!
//! Responsibilities:
//! - `HashJoinBuildOperatorFactory` sinks the build side into a `HashJoiner`.
//! - `HashJoinProbeOperatorFactory` probes that joiner once its table is built.
//! - `HashJoinerFactory` decides which joiner each driver uses, per distribution mode.

mod hash_join_build;
mod hash_join_probe;
pub(crate) mod hash_joiner;
pub(crate) mod hash_joiner_factory;
mod join_hash_table;

pub use hash_join_build::HashJoinBuildOperatorFactory;
pub use hash_join_probe::HashJoinProbeOperatorFactory;
pub use hash_joiner::{HashJoinPhase, HashJoiner, HashJoinerParam, JoinType};
pub use hash_joiner_factory::{HashJoinerFactory, JoinDistributionMode};
