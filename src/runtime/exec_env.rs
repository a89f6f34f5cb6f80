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
//! Process-wide execution environment.
//!
//! Holds the shutdown guard read by every request entry point and the helpers that
//! derive execution parameters from request values.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::config;
use crate::common::status::{ExecError, ExecResult};
use crate::novarocks_logging::info;

static PROCESS_EXITING: AtomicBool = AtomicBool::new(false);

/// Clear the exit flag at process start.
pub fn init() {
    PROCESS_EXITING.store(false, Ordering::Release);
}

/// Mark the worker as shutting down. New requests fail fast from now on.
pub fn set_process_exiting() {
    if !PROCESS_EXITING.swap(true, Ordering::AcqRel) {
        info!("worker is shutting down, rejecting new requests");
    }
}

pub fn is_process_exiting() -> bool {
    PROCESS_EXITING.load(Ordering::Acquire)
}

pub fn check_process_not_exiting() -> ExecResult<()> {
    if is_process_exiting() {
        return Err(ExecError::ServiceUnavailable(
            "worker is shutting down".to_string(),
        ));
    }
    Ok(())
}

/// Pipeline degree of parallelism for a fragment instance.
///
/// A positive request value is used as-is; otherwise half of the executor threads.
pub fn calc_pipeline_dop(pipeline_dop: i32) -> i32 {
    if pipeline_dop > 0 {
        return pipeline_dop;
    }
    ((config::pipeline_exec_threads() / 2).max(1)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dop_is_kept() {
        assert_eq!(calc_pipeline_dop(3), 3);
        assert!(calc_pipeline_dop(0) >= 1);
    }
}
