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
//! Row predicates evaluated by operators.
//!
//! Responsibilities:
//! - Defines the `Predicate` contract used for conjuncts and runtime in-filters.
//! - Provides the comparison, `IS NOT NULL` and `IN` predicates the operators need.
//!
//! Key exported interfaces:
//! - Types: `Predicate`, `ExprContext`, `CompareOp`, `ComparePredicate`,
//!   `IsNotNullPredicate`, `InPredicate`.
//!
//! Current limitations:
//! - Predicates read one slot each; compound expressions are expressed as conjunct lists.

use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Scalar};
use arrow::compute::cast;
use arrow::compute::is_not_null;
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};

use crate::common::ids::{SlotId, TupleSlotMapping};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::hash_table::key_codec::{KeyCodec, KeySet};

/// A boolean row predicate. A null result drops the row.
pub trait Predicate: Send + Sync + fmt::Debug {
    fn evaluate(&self, chunk: &Chunk) -> ExecResult<BooleanArray>;

    fn slot_ids(&self) -> Vec<SlotId>;

    /// Rebuild the predicate with `from_slot` references rewritten to `to_slot`.
    fn with_column_mapping(&self, mappings: &[TupleSlotMapping]) -> ExprContext;
}

pub type ExprContext = Arc<dyn Predicate>;

fn map_slot(slot: SlotId, mappings: &[TupleSlotMapping]) -> SlotId {
    mappings
        .iter()
        .find(|m| m.from_slot == slot)
        .map(|m| m.to_slot)
        .unwrap_or(slot)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug)]
pub struct ComparePredicate {
    slot: SlotId,
    op: CompareOp,
    literal: ArrayRef,
}

impl ComparePredicate {
    /// `literal` must hold exactly one value.
    pub fn try_new(slot: SlotId, op: CompareOp, literal: ArrayRef) -> ExecResult<Self> {
        if literal.len() != 1 {
            return Err(ExecError::invalid_argument(format!(
                "comparison literal must hold one value, got {}",
                literal.len()
            )));
        }
        Ok(Self { slot, op, literal })
    }
}

impl Predicate for ComparePredicate {
    fn evaluate(&self, chunk: &Chunk) -> ExecResult<BooleanArray> {
        let column = chunk.column_by_slot_id(self.slot)?;
        let literal = if self.literal.data_type() == column.data_type() {
            Arc::clone(&self.literal)
        } else {
            cast(&self.literal, column.data_type())?
        };
        let rhs = Scalar::new(literal);
        let out = match self.op {
            CompareOp::Eq => eq(&column, &rhs)?,
            CompareOp::Ne => neq(&column, &rhs)?,
            CompareOp::Lt => lt(&column, &rhs)?,
            CompareOp::Le => lt_eq(&column, &rhs)?,
            CompareOp::Gt => gt(&column, &rhs)?,
            CompareOp::Ge => gt_eq(&column, &rhs)?,
        };
        Ok(out)
    }

    fn slot_ids(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn with_column_mapping(&self, mappings: &[TupleSlotMapping]) -> ExprContext {
        Arc::new(Self {
            slot: map_slot(self.slot, mappings),
            op: self.op,
            literal: Arc::clone(&self.literal),
        })
    }
}

#[derive(Clone, Debug)]
pub struct IsNotNullPredicate {
    slot: SlotId,
}

impl IsNotNullPredicate {
    pub fn new(slot: SlotId) -> Self {
        Self { slot }
    }
}

impl Predicate for IsNotNullPredicate {
    fn evaluate(&self, chunk: &Chunk) -> ExecResult<BooleanArray> {
        let column = chunk.column_by_slot_id(self.slot)?;
        Ok(is_not_null(column.as_ref())?)
    }

    fn slot_ids(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn with_column_mapping(&self, mappings: &[TupleSlotMapping]) -> ExprContext {
        Arc::new(Self::new(map_slot(self.slot, mappings)))
    }
}

/// `slot IN (values)`. Null inputs never pass.
#[derive(Clone, Debug)]
pub struct InPredicate {
    slot: SlotId,
    values: Arc<KeySet>,
}

impl InPredicate {
    pub fn try_new(slot: SlotId, values: &ArrayRef) -> ExecResult<Self> {
        let codec = KeyCodec::try_new(vec![values.data_type().clone()])?;
        let mut set = KeySet::new(codec);
        set.insert_non_null(std::slice::from_ref(values))?;
        Ok(Self::from_key_set(slot, Arc::new(set)))
    }

    pub(crate) fn from_key_set(slot: SlotId, values: Arc<KeySet>) -> Self {
        Self { slot, values }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }
}

impl Predicate for InPredicate {
    fn evaluate(&self, chunk: &Chunk) -> ExecResult<BooleanArray> {
        let column = chunk.column_by_slot_id(self.slot)?;
        let hits = self.values.contains_rows(std::slice::from_ref(&column))?;
        Ok(BooleanArray::from(hits))
    }

    fn slot_ids(&self) -> Vec<SlotId> {
        vec![self.slot]
    }

    fn with_column_mapping(&self, mappings: &[TupleSlotMapping]) -> ExprContext {
        Arc::new(Self {
            slot: map_slot(self.slot, mappings),
            values: Arc::clone(&self.values),
        })
    }
}
