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
//! Execution operators.
//!
//! Responsibilities:
//! - Source, transform and sink operator factories that pipelines are assembled from.
//! - Shared build/probe and sink/source state for the hash join and the
//!   distinct streaming aggregation.

pub mod aggregate;
mod async_source;
mod chunk_queue_source;
mod filter_operator;
pub mod hashjoin;
mod result_sink;
mod values_source;

pub use aggregate::{
    AggregateDistinctStreamingSinkOperatorFactory, AggregateDistinctStreamingSourceOperatorFactory,
    Aggregator, AggregatorFactory, AggregatorParams,
};
pub use async_source::{AsyncChunkSourceFactory, ChunkProducer, ChunkProducerBuilder};
pub use chunk_queue_source::{ChunkQueue, ChunkQueueSourceFactory};
pub use filter_operator::FilterOperatorFactory;
pub use hashjoin::{
    HashJoinBuildOperatorFactory, HashJoinPhase, HashJoinProbeOperatorFactory, HashJoiner,
    HashJoinerFactory, HashJoinerParam, JoinDistributionMode, JoinType,
};
pub use result_sink::ResultSinkFactory;
pub use values_source::ValuesSourceFactory;
