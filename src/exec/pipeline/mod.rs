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
//! Pipeline runtime module exports.
//!
//! Responsibilities:
//! - Exposes the operator contracts, drivers, schedulers and the executor that run
//!   pipelines of one fragment instance.
//!
//! Current limitations:
//! - Pipelines are assembled by the caller; there is no plan lowering in this crate.

pub mod blocked_driver_poller;
pub mod dependency;
pub mod driver;
pub mod event_scheduler;
pub mod fragment_context;
pub mod fragment_executor;
pub mod global_driver_executor;
pub mod operator;
pub mod operator_factory;
pub mod pipeline;
