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
//! Byte encoding of multi-column keys.
//!
//! Keys are encoded with the Arrow row format so that any combination of
//! supported column types hashes and compares as one byte string, and can be
//! decoded back into columns for output.

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::DataType;
use arrow::row::{RowConverter, Rows, SortField};
use hashbrown::HashSet;

use crate::common::status::{ExecError, ExecResult};

#[derive(Debug)]
pub struct KeyCodec {
    converter: RowConverter,
    data_types: Vec<DataType>,
}

impl KeyCodec {
    pub fn try_new(data_types: Vec<DataType>) -> ExecResult<Self> {
        if data_types.is_empty() {
            return Err(ExecError::invalid_argument("key codec needs at least one column"));
        }
        let fields = data_types
            .iter()
            .map(|t| SortField::new(t.clone()))
            .collect::<Vec<_>>();
        let converter = RowConverter::new(fields)?;
        Ok(Self {
            converter,
            data_types,
        })
    }

    pub fn data_types(&self) -> &[DataType] {
        &self.data_types
    }

    pub fn encode(&self, columns: &[ArrayRef]) -> ExecResult<Rows> {
        if columns.len() != self.data_types.len() {
            return Err(ExecError::internal(format!(
                "key codec expects {} columns, got {}",
                self.data_types.len(),
                columns.len()
            )));
        }
        Ok(self.converter.convert_columns(columns)?)
    }

    pub fn decode<'a, I>(&self, keys: I) -> ExecResult<Vec<ArrayRef>>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let parser = self.converter.parser();
        let rows = keys.into_iter().map(|k| parser.parse(k));
        Ok(self.converter.convert_rows(rows)?)
    }
}

/// Rows where any key column is null.
pub fn key_null_mask(columns: &[ArrayRef], num_rows: usize) -> Vec<bool> {
    let mut mask = vec![false; num_rows];
    for column in columns {
        if column.null_count() == 0 {
            continue;
        }
        for (row, slot) in mask.iter_mut().enumerate() {
            if column.is_null(row) {
                *slot = true;
            }
        }
    }
    mask
}

/// Exact set of non-null keys. Backs `IN` predicates and runtime in-filters.
#[derive(Debug)]
pub struct KeySet {
    codec: KeyCodec,
    keys: HashSet<Box<[u8]>>,
    key_bytes: usize,
}

impl KeySet {
    pub fn new(codec: KeyCodec) -> Self {
        Self {
            codec,
            keys: HashSet::new(),
            key_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn memory_usage(&self) -> usize {
        self.keys.capacity() * std::mem::size_of::<Box<[u8]>>() + self.key_bytes
    }

    pub fn insert_non_null(&mut self, columns: &[ArrayRef]) -> ExecResult<()> {
        let Some(first) = columns.first() else {
            return Ok(());
        };
        let num_rows = first.len();
        let rows = self.codec.encode(columns)?;
        let nulls = key_null_mask(columns, num_rows);
        for (row, is_null) in nulls.into_iter().enumerate() {
            if is_null {
                continue;
            }
            let key = rows.row(row);
            let bytes: &[u8] = key.as_ref();
            if !self.keys.contains(bytes) {
                self.key_bytes += bytes.len();
                self.keys.insert(Box::from(bytes));
            }
        }
        Ok(())
    }

    pub fn contains_rows(&self, columns: &[ArrayRef]) -> ExecResult<Vec<bool>> {
        let Some(first) = columns.first() else {
            return Ok(Vec::new());
        };
        let num_rows = first.len();
        let rows = self.codec.encode(columns)?;
        let nulls = key_null_mask(columns, num_rows);
        Ok((0..num_rows)
            .map(|row| !nulls[row] && self.keys.contains(rows.row(row).as_ref()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};
    use std::sync::Arc;

    #[test]
    fn encode_decode_multi_column() {
        let codec = KeyCodec::try_new(vec![DataType::Int32, DataType::Utf8]).expect("codec");
        let cols: Vec<ArrayRef> = vec![
            Arc::new(Int32Array::from(vec![1, 2])),
            Arc::new(StringArray::from(vec![Some("a"), None])),
        ];
        let rows = codec.encode(&cols).expect("encode");
        let keys = rows
            .iter()
            .map(|r| r.as_ref().to_vec())
            .collect::<Vec<_>>();
        let back = codec
            .decode(keys.iter().map(|k| k.as_slice()))
            .expect("decode");
        assert_eq!(back[0].as_ref(), cols[0].as_ref());
        assert_eq!(back[1].as_ref(), cols[1].as_ref());
    }

    #[test]
    fn key_set_skips_nulls() {
        let codec = KeyCodec::try_new(vec![DataType::Int32]).expect("codec");
        let mut set = KeySet::new(codec);
        let build: ArrayRef = Arc::new(Int32Array::from(vec![Some(1), None, Some(1), Some(2)]));
        set.insert_non_null(&[build]).expect("insert");
        assert_eq!(set.len(), 2);
        let probe: ArrayRef = Arc::new(Int32Array::from(vec![Some(2), None, Some(3)]));
        assert_eq!(
            set.contains_rows(&[probe]).expect("probe"),
            vec![true, false, false]
        );
    }
}
