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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::{Array, ArrayRef, Int64Array};
use tempfile::TempDir;

use novarocks_exec::common::ids::SlotId;
use novarocks_exec::common::types::UniqueId;
use novarocks_exec::exec::chunk::{Chunk, ChunkPtr};
use novarocks_exec::novarocks_config;
use novarocks_exec::novarocks_logging;

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with default settings.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_content(
            r#"
log_level = "debug"

[runtime]
pipeline_exec_thread_pool_thread_num = 4
io_threads = 2
driver_time_slice_ms = 50
blocked_driver_poll_interval_ms = 5
chunk_size = 4096
operator_buffer_chunks = 8

[aggregate]
streaming_preaggregation_mode = "auto"
two_level_threshold_bytes = 33554432

[runtime_filter]
in_filter_max_values = 1024
bloom_filter_bits_per_key = 10
"#,
        )
    }

    pub fn with_content(content: &str) -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_novarocks.toml");
        std::fs::write(&config_path, content)?;
        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging from the loaded config.
    pub fn init_logging(&self) {
        novarocks_logging::init_from_config();
    }

    /// Load the test configuration. The first load in a test binary wins.
    pub fn load_config(&self) -> anyhow::Result<&'static novarocks_config::NovaRocksConfig> {
        novarocks_config::init_from_path(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// Load the shared test config and logging once per test binary.
pub fn setup() {
    let config = TestConfig::default();
    config.load_config().expect("load test config");
    config.init_logging();
}

/// Generate a unique fragment instance ID based on test name.
pub fn unique_id(test_name: &str) -> UniqueId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    test_name.hash(&mut hasher);
    let hash = hasher.finish();

    UniqueId::new(hash as i64, (hash >> 32) as i64)
}

pub fn int64_chunk(slot: u32, values: Vec<i64>) -> ChunkPtr {
    Arc::new(
        Chunk::from_columns(vec![(
            SlotId::new(slot),
            Arc::new(Int64Array::from(values)) as ArrayRef,
        )])
        .expect("chunk"),
    )
}

pub fn nullable_int64_chunk(slot: u32, values: Vec<Option<i64>>) -> ChunkPtr {
    Arc::new(
        Chunk::from_columns(vec![(
            SlotId::new(slot),
            Arc::new(Int64Array::from(values)) as ArrayRef,
        )])
        .expect("chunk"),
    )
}

/// Chunk of two int64 columns.
pub fn pair_chunk(slots: (u32, u32), rows: Vec<(i64, i64)>) -> ChunkPtr {
    let (a, b): (Vec<i64>, Vec<i64>) = rows.into_iter().unzip();
    Arc::new(
        Chunk::from_columns(vec![
            (SlotId::new(slots.0), Arc::new(Int64Array::from(a)) as ArrayRef),
            (SlotId::new(slots.1), Arc::new(Int64Array::from(b)) as ArrayRef),
        ])
        .expect("chunk"),
    )
}

/// Values of an int64 slot across `chunks`, nulls as `None`.
pub fn column_values(chunks: &[ChunkPtr], slot: u32) -> Vec<Option<i64>> {
    let mut out = Vec::new();
    for chunk in chunks {
        let column = chunk
            .column_by_slot_id(SlotId::new(slot))
            .expect("slot in chunk");
        let array = column
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        out.extend(array.iter());
    }
    out
}

/// Non-null values of an int64 slot across `chunks`.
pub fn non_null_values(chunks: &[ChunkPtr], slot: u32) -> Vec<i64> {
    column_values(chunks, slot).into_iter().flatten().collect()
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}
