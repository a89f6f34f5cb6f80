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
use std::time::Duration;

use crate::common::app_config::{
    AggregateConfig, RuntimeFilterConfig, StreamingPreaggregationMode,
};
use crate::novarocks_config::config as novarocks_app_config;

pub(crate) fn pipeline_exec_threads() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime.actual_exec_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn io_threads() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime.io_threads)
        .unwrap_or(4)
}

pub(crate) fn driver_time_slice() -> Duration {
    let ms = novarocks_app_config()
        .ok()
        .map(|c| c.runtime.driver_time_slice_ms)
        .unwrap_or(100);
    Duration::from_millis(ms.max(1))
}

pub(crate) fn driver_yield_max_chunks_moved() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime.driver_yield_max_chunks_moved)
        .unwrap_or(100)
        .max(1)
}

pub(crate) fn blocked_driver_poll_interval() -> Duration {
    let ms = novarocks_app_config()
        .ok()
        .map(|c| c.runtime.blocked_driver_poll_interval_ms)
        .unwrap_or(10);
    Duration::from_millis(ms.max(1))
}

pub(crate) fn chunk_size() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime.chunk_size)
        .unwrap_or(4096)
        .max(1)
}

pub(crate) fn operator_buffer_chunks() -> usize {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime.operator_buffer_chunks)
        .unwrap_or(8)
        .max(1)
}

pub(crate) fn streaming_preaggregation_mode() -> StreamingPreaggregationMode {
    novarocks_app_config()
        .ok()
        .map(|c| c.aggregate.streaming_preaggregation_mode)
        .unwrap_or_default()
}

pub(crate) fn aggregate_config() -> AggregateConfig {
    novarocks_app_config()
        .ok()
        .map(|c| c.aggregate.clone())
        .unwrap_or_default()
}

pub(crate) fn runtime_filter_config() -> RuntimeFilterConfig {
    novarocks_app_config()
        .ok()
        .map(|c| c.runtime_filter.clone())
        .unwrap_or_default()
}
