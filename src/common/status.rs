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
//! Typed execution status.
//!
//! Responsibilities:
//! - Defines the error taxonomy returned by every fallible operator, driver and fragment call.
//! - Separates cancellation from real failures so teardown paths can suppress error logging.
//!
//! Key exported interfaces:
//! - Types: `ExecError`, `ExecResult`.
//!
//! Current limitations:
//! - Errors carry a rendered message only; structured source chains are flattened at creation.

use arrow::error::ArrowError;
use thiserror::Error;

/// Result alias used across the execution layer.
pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Cooperative cancellation. Not a failure of the fragment itself.
    #[error("Cancelled: {0}")]
    Cancelled(String),
    /// Allocation or memory-limit failure. The owning fragment fails, the process survives.
    #[error("Memory allocation failed: {0}")]
    MemAllocFailed(String),
    /// Contract violation inside the engine (wrong lifecycle order, unsupported call).
    #[error("Internal error: {0}")]
    InternalError(String),
    /// Re-delivery of an idempotent setup request.
    #[error("Duplicate RPC invocation: {0}")]
    DuplicateRpcInvocation(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ExecError {
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn mem_alloc_failed(msg: impl Into<String>) -> Self {
        Self::MemAllocFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_mem_alloc_failed(&self) -> bool {
        matches!(self, Self::MemAllocFailed(_))
    }

    pub fn is_duplicate_invocation(&self) -> bool {
        matches!(self, Self::DuplicateRpcInvocation(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "CANCELLED",
            Self::MemAllocFailed(_) => "MEM_ALLOC_FAILED",
            Self::InternalError(_) => "INTERNAL_ERROR",
            Self::DuplicateRpcInvocation(_) => "DUPLICATE_RPC_INVOCATION",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::NotSupported(_) => "NOT_SUPPORTED",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }
}

impl From<ArrowError> for ExecError {
    fn from(err: ArrowError) -> Self {
        match err {
            ArrowError::MemoryError(msg) => Self::MemAllocFailed(msg),
            other => Self::InternalError(format!("arrow error: {other}")),
        }
    }
}

/// Convert a tolerated duplicate invocation into success.
pub fn ignore_duplicate_invocation(result: ExecResult<()>) -> ExecResult<()> {
    match result {
        Err(err) if err.is_duplicate_invocation() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrow_memory_error_maps_to_alloc_failure() {
        let err = ExecError::from(ArrowError::MemoryError("oom".to_string()));
        assert!(err.is_mem_alloc_failed());
        let err = ExecError::from(ArrowError::ComputeError("bad".to_string()));
        assert_eq!(err.kind_name(), "INTERNAL_ERROR");
    }

    #[test]
    fn duplicate_invocation_is_success() {
        let dup = Err(ExecError::DuplicateRpcInvocation("finst 1".to_string()));
        assert!(ignore_duplicate_invocation(dup).is_ok());
        let failed = Err(ExecError::internal("boom"));
        assert!(ignore_duplicate_invocation(failed).is_err());
    }
}
