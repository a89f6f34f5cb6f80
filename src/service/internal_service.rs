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
//! Fragment execution requests.
//!
//! Responsibilities:
//! - Prepares and submits fragment instances to the process-wide driver executor.
//! - Cancels running instances by fragment instance id.
//! - Rejects every request once the worker is shutting down.
//!
//! Key exported interfaces:
//! - Functions: `exec_plan_fragment`, `cancel_plan_fragment`.

use std::sync::Arc;

use crate::common::status::{ExecError, ExecResult, ignore_duplicate_invocation};
use crate::common::types::UniqueId;
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::exec::pipeline::fragment_executor::{FragmentExecParams, FragmentExecutor, fragment_mgr};
use crate::exec::pipeline::global_driver_executor::global_driver_executor;
use crate::novarocks_logging::{info, warn};
use crate::runtime::exec_env::check_process_not_exiting;

/// Prepare and start one fragment instance.
///
/// A repeated request for an instance that is already running succeeds without
/// starting anything and returns `None`.
pub fn exec_plan_fragment(params: FragmentExecParams) -> ExecResult<Option<Arc<FragmentContext>>> {
    check_process_not_exiting()?;
    let finst = params.fragment_instance_id;
    let mut started = None;
    let result = FragmentExecutor::prepare(fragment_mgr(), params)
        .and_then(|executor| executor.execute(global_driver_executor()))
        .map(|ctx| started = Some(ctx));
    if let Err(err) = result.as_ref() {
        if err.is_duplicate_invocation() {
            info!("duplicate exec_plan_fragment ignored: finst={}", finst);
        } else {
            warn!("exec_plan_fragment failed: finst={} error={}", finst, err);
        }
    }
    ignore_duplicate_invocation(result)?;
    Ok(started)
}

/// Cancel a running fragment instance. Returns false when it is unknown or already done.
pub fn cancel_plan_fragment(finst: UniqueId, reason: Option<ExecError>) -> ExecResult<bool> {
    check_process_not_exiting()?;
    let reason = reason.unwrap_or_else(|| ExecError::cancelled("cancelled by request"));
    info!("cancel_plan_fragment: finst={} reason={}", finst, reason);
    Ok(fragment_mgr().cancel(finst, reason))
}
