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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaRocksConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = NovaRocksConfig::load_from_file(path.as_ref())?;
    Ok(CONFIG.get_or_init(|| cfg))
}

pub fn init_from_env_or_default() -> Result<&'static NovaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static NovaRocksConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAROCKS_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }
    let local = PathBuf::from("novarocks.toml");
    if local.exists() {
        return Ok(local);
    }
    Err(anyhow!(
        "missing config file: set $NOVAROCKS_CONFIG or create ./novarocks.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaRocksConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression, e.g. "novarocks_exec=debug".
    /// Takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub aggregate: AggregateConfig,

    #[serde(default)]
    pub runtime_filter: RuntimeFilterConfig,
}

impl NovaRocksConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let cfg: NovaRocksConfig = toml::from_str(s)?;
        cfg.aggregate.validate()?;
        Ok(cfg)
    }
}

impl Default for NovaRocksConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
            aggregate: AggregateConfig::default(),
            runtime_filter: RuntimeFilterConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_pipeline_exec_thread_pool_thread_num")]
    pub pipeline_exec_thread_pool_thread_num: usize,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    #[serde(default = "default_driver_time_slice_ms")]
    pub driver_time_slice_ms: u64,
    #[serde(default = "default_driver_yield_max_chunks_moved")]
    pub driver_yield_max_chunks_moved: usize,
    #[serde(default = "default_blocked_driver_poll_interval_ms")]
    pub blocked_driver_poll_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_operator_buffer_chunks")]
    pub operator_buffer_chunks: usize,
}

fn default_pipeline_exec_thread_pool_thread_num() -> usize {
    0 // 0 means use CPU cores
}

fn default_io_threads() -> usize {
    4
}

fn default_driver_time_slice_ms() -> u64 {
    100
}

fn default_driver_yield_max_chunks_moved() -> usize {
    100
}

fn default_blocked_driver_poll_interval_ms() -> u64 {
    10
}

fn default_chunk_size() -> usize {
    4096
}

fn default_operator_buffer_chunks() -> usize {
    8
}

impl RuntimeConfig {
    pub fn actual_exec_threads(&self) -> usize {
        if self.pipeline_exec_thread_pool_thread_num > 0 {
            return self.pipeline_exec_thread_pool_thread_num;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pipeline_exec_thread_pool_thread_num: default_pipeline_exec_thread_pool_thread_num(),
            io_threads: default_io_threads(),
            driver_time_slice_ms: default_driver_time_slice_ms(),
            driver_yield_max_chunks_moved: default_driver_yield_max_chunks_moved(),
            blocked_driver_poll_interval_ms: default_blocked_driver_poll_interval_ms(),
            chunk_size: default_chunk_size(),
            operator_buffer_chunks: default_operator_buffer_chunks(),
        }
    }
}

/// How the distinct streaming pre-aggregation decides between streaming and absorbing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingPreaggregationMode {
    #[default]
    Auto,
    ForceStreaming,
    ForcePreaggregation,
}

/// One row of the reduction table: once the hash set holds at least `min_ht_mem` bytes,
/// growth is only worth it if rows are being reduced by more than `min_reduction`.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct StreamingHtMinReduction {
    pub min_ht_mem: i64,
    pub min_reduction: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AggregateConfig {
    #[serde(default)]
    pub streaming_preaggregation_mode: StreamingPreaggregationMode,
    #[serde(default = "default_two_level_threshold_bytes")]
    pub two_level_threshold_bytes: i64,
    #[serde(default = "default_streaming_ht_min_reduction")]
    pub streaming_ht_min_reduction: Vec<StreamingHtMinReduction>,
}

fn default_two_level_threshold_bytes() -> i64 {
    32 * 1024 * 1024
}

pub fn default_streaming_ht_min_reduction() -> Vec<StreamingHtMinReduction> {
    vec![
        // Always expand while the table fits in L2.
        StreamingHtMinReduction {
            min_ht_mem: 0,
            min_reduction: 0.0,
        },
        // Expand into L3 only with some reduction.
        StreamingHtMinReduction {
            min_ht_mem: 256 * 1024,
            min_reduction: 1.1,
        },
        // Expand into main memory only with significant reduction.
        StreamingHtMinReduction {
            min_ht_mem: 2 * 1024 * 1024,
            min_reduction: 2.0,
        },
    ]
}

impl AggregateConfig {
    fn validate(&self) -> Result<()> {
        let table = &self.streaming_ht_min_reduction;
        if table.is_empty() {
            return Err(anyhow!("aggregate.streaming_ht_min_reduction must not be empty"));
        }
        if table[0].min_ht_mem != 0 {
            return Err(anyhow!(
                "aggregate.streaming_ht_min_reduction must start at min_ht_mem = 0"
            ));
        }
        if table.windows(2).any(|w| w[0].min_ht_mem >= w[1].min_ht_mem) {
            return Err(anyhow!(
                "aggregate.streaming_ht_min_reduction must be sorted by min_ht_mem"
            ));
        }
        Ok(())
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            streaming_preaggregation_mode: StreamingPreaggregationMode::default(),
            two_level_threshold_bytes: default_two_level_threshold_bytes(),
            streaming_ht_min_reduction: default_streaming_ht_min_reduction(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeFilterConfig {
    #[serde(default = "default_in_filter_max_values")]
    pub in_filter_max_values: usize,
    #[serde(default = "default_bloom_filter_bits_per_key")]
    pub bloom_filter_bits_per_key: usize,
    #[serde(default = "default_bloom_filter_min_selectivity_rows")]
    pub bloom_filter_min_selectivity_rows: usize,
    #[serde(default = "default_bloom_filter_skip_pass_ratio")]
    pub bloom_filter_skip_pass_ratio: f64,
}

fn default_in_filter_max_values() -> usize {
    1024
}

fn default_bloom_filter_bits_per_key() -> usize {
    10
}

fn default_bloom_filter_min_selectivity_rows() -> usize {
    65_536
}

fn default_bloom_filter_skip_pass_ratio() -> f64 {
    0.95
}

impl Default for RuntimeFilterConfig {
    fn default() -> Self {
        Self {
            in_filter_max_values: default_in_filter_max_values(),
            bloom_filter_bits_per_key: default_bloom_filter_bits_per_key(),
            bloom_filter_min_selectivity_rows: default_bloom_filter_min_selectivity_rows(),
            bloom_filter_skip_pass_ratio: default_bloom_filter_skip_pass_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = NovaRocksConfig::parse("").expect("parse");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.runtime.chunk_size, 4096);
        assert_eq!(
            cfg.aggregate.streaming_preaggregation_mode,
            StreamingPreaggregationMode::Auto
        );
        assert_eq!(cfg.aggregate.streaming_ht_min_reduction.len(), 3);
    }

    #[test]
    fn parses_mode_and_reduction_table() {
        let cfg = NovaRocksConfig::parse(
            r#"
[aggregate]
streaming_preaggregation_mode = "force_streaming"

[[aggregate.streaming_ht_min_reduction]]
min_ht_mem = 0
min_reduction = 1.5
"#,
        )
        .expect("parse");
        assert_eq!(
            cfg.aggregate.streaming_preaggregation_mode,
            StreamingPreaggregationMode::ForceStreaming
        );
        assert_eq!(cfg.aggregate.streaming_ht_min_reduction[0].min_reduction, 1.5);
    }

    #[test]
    fn rejects_unsorted_reduction_table() {
        let err = NovaRocksConfig::parse(
            r#"
[[aggregate.streaming_ht_min_reduction]]
min_ht_mem = 0
min_reduction = 0.0

[[aggregate.streaming_ht_min_reduction]]
min_ht_mem = 0
min_reduction = 1.0
"#,
        )
        .expect_err("unsorted table");
        assert!(err.to_string().contains("sorted"), "err={err}");
    }
}
