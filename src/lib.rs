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
//! Pipeline execution core of a vectorized query worker.
//!
//! Fragment instances are split into pipelines of operators; each pipeline is
//! instantiated as one driver per degree of parallelism and run cooperatively
//! on a shared driver executor.

pub mod common;
pub mod exec;
pub mod runtime;
pub mod service;

pub use common::app_config as novarocks_config;
pub use common::logging as novarocks_logging;

pub use common::status::{ExecError, ExecResult};
pub use common::types::UniqueId;
pub use service::internal_service::{cancel_plan_fragment, exec_plan_fragment};
