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
//! Pipeline structure metadata.
//!
//! Responsibilities:
//! - Represents one pipeline as an ordered list of operator factories, source first.
//! - Prepares and closes its factories and instantiates one driver per degree of parallelism.
//!
//! Key exported interfaces:
//! - Types: `Pipeline`.
//!
//! Current limitations:
//! - Every driver of a pipeline runs the same operator chain; there is no per-driver specialization.

use std::sync::Arc;

use super::driver::PipelineDriver;
use super::fragment_context::FragmentContext;
use super::operator::Operator;
use super::operator_factory::OperatorFactory;
use crate::common::status::{ExecError, ExecResult};
use crate::novarocks_logging::{debug, warn};
use crate::runtime::exec_env::calc_pipeline_dop;
use crate::runtime::runtime_state::RuntimeState;

/// One pipeline definition containing ordered operator factories.
pub struct Pipeline {
    id: i32,
    op_factories: Vec<Box<dyn OperatorFactory>>,
    dop: i32,
}

impl Pipeline {
    /// The first factory must produce sources; a pipeline has at least a source and a sink.
    /// A non-positive `dop` picks the default degree of parallelism.
    pub fn new(id: i32, op_factories: Vec<Box<dyn OperatorFactory>>, dop: i32) -> ExecResult<Self> {
        let Some(first) = op_factories.first() else {
            return Err(ExecError::internal(format!("pipeline {} has no operators", id)));
        };
        if !first.is_source() {
            return Err(ExecError::internal(format!(
                "pipeline {} must start with a source factory, got {}",
                id,
                first.name()
            )));
        }
        if op_factories.len() < 2 {
            return Err(ExecError::internal(format!(
                "pipeline {} needs a sink after its source",
                id
            )));
        }
        if let Some(extra) = op_factories.iter().skip(1).find(|f| f.is_source()) {
            return Err(ExecError::internal(format!(
                "pipeline {} has a source factory {} after the first position",
                id,
                extra.name()
            )));
        }
        Ok(Self {
            id,
            op_factories,
            dop: calc_pipeline_dop(dop),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn dop(&self) -> i32 {
        self.dop
    }

    pub fn op_factories(&self) -> &[Box<dyn OperatorFactory>] {
        &self.op_factories
    }

    pub fn source_factory(&self) -> &dyn OperatorFactory {
        self.op_factories[0].as_ref()
    }

    pub fn create_operators(&self, dop: i32, driver_sequence: i32) -> Vec<Box<dyn Operator>> {
        self.op_factories
            .iter()
            .map(|factory| factory.create(dop, driver_sequence))
            .collect()
    }

    /// Prepare every factory. The caller closes the pipeline on failure.
    pub fn prepare(&self, state: &RuntimeState) -> ExecResult<()> {
        for factory in &self.op_factories {
            if let Err(err) = factory.prepare(state) {
                warn!(
                    "pipeline factory prepare failed: pipeline_id={} factory={} error={}",
                    self.id,
                    factory.name(),
                    err
                );
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn close(&self, state: &RuntimeState) {
        for factory in self.op_factories.iter().rev() {
            factory.close(state);
        }
    }

    pub(crate) fn instantiate_drivers(&self, ctx: &Arc<FragmentContext>) -> Vec<PipelineDriver> {
        let pipeline_profiler = ctx
            .profiler()
            .map(|p| p.child(format!("Pipeline (id={})", self.id)));
        (0..self.dop)
            .map(|i| {
                let driver_id = ctx.next_driver_id();
                debug!(
                    "pipeline driver created: pipeline_id={} driver_id={} local_index={} dop={} operators={}",
                    self.id,
                    driver_id,
                    i,
                    self.dop,
                    self.to_readable_string()
                );
                let driver_profiler = pipeline_profiler
                    .as_ref()
                    .map(|p| p.child(format!("PipelineDriver (id={})", driver_id)));
                PipelineDriver::new(
                    driver_id,
                    self.create_operators(self.dop, i),
                    driver_profiler,
                    Arc::clone(ctx.runtime_state()),
                )
            })
            .collect()
    }

    pub fn to_readable_string(&self) -> String {
        self.op_factories
            .iter()
            .map(|factory| format!("{}(id={})", factory.name(), factory.id()))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}
