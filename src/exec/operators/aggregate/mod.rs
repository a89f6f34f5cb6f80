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
//! Distinct streaming pre-aggregation.
//!
//! A sink pipeline feeds grouping keys into a per-lane `Aggregator`; a source
//! pipeline emits whatever the sink streamed plus, once the sink completes,
//! the contents of the lane's hash set.

mod aggregator;
mod distinct_streaming_sink;
mod distinct_streaming_source;

pub use aggregator::{Aggregator, AggregatorFactory, AggregatorParams};
pub use distinct_streaming_sink::AggregateDistinctStreamingSinkOperatorFactory;
pub use distinct_streaming_source::AggregateDistinctStreamingSourceOperatorFactory;
