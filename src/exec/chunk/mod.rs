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
//! Columnar batch container passed between operators.
//!
//! Responsibilities:
//! - Wraps an Arrow `RecordBatch` with a slot-id index over its columns.
//! - Provides in-place filter/append/append-selective and IPC serialization.
//! - Charges its bytes to whichever memory tracker currently holds it.
//!
//! Key exported interfaces:
//! - Types: `Chunk`, `ChunkPtr`.
//! - Functions: `field_with_slot_id`, `field_slot_id`, `record_batch_bytes`.
//!
//! Current limitations:
//! - Buffers shared across batches are counted once per batch, so slices of one
//!   parent batch are double-counted by memory accounting.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, UInt32Array};
use arrow::buffer::Buffer;
use arrow::compute::{concat_batches, filter_record_batch, take_record_batch};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;

use crate::common::ids::SlotId;
use crate::common::status::{ExecError, ExecResult};
use crate::runtime::mem_tracker::MemTracker;

/// Chunks are published behind `Arc`. A holder that wants to mutate goes through
/// `Arc::make_mut`, which copies when another holder still references the batch.
pub type ChunkPtr = Arc<Chunk>;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub batch: RecordBatch,
    slot_id_to_index: Arc<HashMap<SlotId, usize>>,
    accounting: Option<Arc<ChunkAccounting>>,
}

pub const FIELD_META_SLOT_ID: &str = "novarocks.slot_id";

impl Chunk {
    pub fn try_new(batch: RecordBatch) -> ExecResult<Self> {
        let slot_id_to_index = slot_id_to_index_from_schema(batch.schema().as_ref())?;
        Ok(Self {
            batch,
            slot_id_to_index: Arc::new(slot_id_to_index),
            accounting: None,
        })
    }

    /// Build a chunk from `(slot, column)` pairs; column names are derived from the slot.
    pub fn from_columns(columns: Vec<(SlotId, ArrayRef)>) -> ExecResult<Self> {
        let fields = columns
            .iter()
            .map(|(slot, array)| {
                field_with_slot_id(
                    Field::new(format!("slot_{}", slot), array.data_type().clone(), true),
                    *slot,
                )
            })
            .collect::<Vec<_>>();
        let arrays = columns.into_iter().map(|(_, a)| a).collect::<Vec<_>>();
        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
        Self::try_new(batch)
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn slot_ids(&self) -> Vec<SlotId> {
        let mut slots = self
            .slot_id_to_index
            .iter()
            .map(|(slot, idx)| (*idx, *slot))
            .collect::<Vec<_>>();
        slots.sort_unstable();
        slots.into_iter().map(|(_, slot)| slot).collect()
    }

    pub fn column_index(&self, slot_id: SlotId) -> ExecResult<usize> {
        self.slot_id_to_index.get(&slot_id).copied().ok_or_else(|| {
            ExecError::internal(format!(
                "slot id {} not found in chunk (num_columns={})",
                slot_id,
                self.batch.num_columns()
            ))
        })
    }

    pub fn column_by_slot_id(&self, slot_id: SlotId) -> ExecResult<ArrayRef> {
        let idx = self.column_index(slot_id)?;
        Ok(Arc::clone(self.batch.column(idx)))
    }

    pub fn slice(&self, offset: usize, length: usize) -> Self {
        let mut out = Self {
            batch: self.batch.slice(offset, length),
            slot_id_to_index: Arc::clone(&self.slot_id_to_index),
            accounting: None,
        };
        if let Some(tracker) = self.tracker() {
            out.transfer_to(&tracker);
        }
        out
    }

    /// Keep only the given slots, in the given order.
    pub fn project(&self, slots: &[SlotId]) -> ExecResult<Self> {
        let indices = slots
            .iter()
            .map(|slot| self.column_index(*slot))
            .collect::<ExecResult<Vec<_>>>()?;
        let batch = self.batch.project(&indices)?;
        Self::try_new(batch)
    }

    /// Drop rows whose selection byte is zero.
    pub fn filter(&mut self, selection: &[u8]) -> ExecResult<()> {
        if selection.len() != self.num_rows() {
            return Err(ExecError::internal(format!(
                "selection size {} does not match chunk rows {}",
                selection.len(),
                self.num_rows()
            )));
        }
        if selection.iter().all(|v| *v != 0) {
            return Ok(());
        }
        let mask = BooleanArray::from(selection.iter().map(|v| *v != 0).collect::<Vec<_>>());
        self.filter_by_mask(&mask)
    }

    /// Null mask entries drop the row, as in SQL `WHERE`.
    pub fn filter_by_mask(&mut self, mask: &BooleanArray) -> ExecResult<()> {
        if mask.len() != self.num_rows() {
            return Err(ExecError::internal(format!(
                "filter mask size {} does not match chunk rows {}",
                mask.len(),
                self.num_rows()
            )));
        }
        self.batch = filter_record_batch(&self.batch, mask)?;
        self.refresh_accounting();
        Ok(())
    }

    /// Append `count` rows of `src` starting at `offset`.
    pub fn append(&mut self, src: &Chunk, offset: usize, count: usize) -> ExecResult<()> {
        if offset + count > src.num_rows() {
            return Err(ExecError::internal(format!(
                "append range {}..{} out of bounds for {} rows",
                offset,
                offset + count,
                src.num_rows()
            )));
        }
        let tail = src.batch.slice(offset, count);
        self.append_batch(&tail)
    }

    /// Append the rows `indexes[from..from + size]` of `src`.
    pub fn append_selective(
        &mut self,
        src: &Chunk,
        indexes: &[u32],
        from: usize,
        size: usize,
    ) -> ExecResult<()> {
        let picked = indexes.get(from..from + size).ok_or_else(|| {
            ExecError::internal(format!(
                "append_selective range {}..{} out of bounds for {} indexes",
                from,
                from + size,
                indexes.len()
            ))
        })?;
        if let Some(bad) = picked.iter().find(|idx| **idx as usize >= src.num_rows()) {
            return Err(ExecError::internal(format!(
                "append_selective index {} out of bounds for {} rows",
                bad,
                src.num_rows()
            )));
        }
        let taken = take_record_batch(&src.batch, &UInt32Array::from(picked.to_vec()))?;
        self.append_batch(&taken)
    }

    fn append_batch(&mut self, tail: &RecordBatch) -> ExecResult<()> {
        if tail.num_columns() != self.batch.num_columns() {
            return Err(ExecError::internal(format!(
                "append column count mismatch: {} vs {}",
                self.batch.num_columns(),
                tail.num_columns()
            )));
        }
        let schema = self.batch.schema();
        // Source batches may differ in nullability metadata only; rebuild under our schema.
        let tail = RecordBatch::try_new(Arc::clone(&schema), tail.columns().to_vec())?;
        self.batch = concat_batches(&schema, [&self.batch, &tail])?;
        self.refresh_accounting();
        Ok(())
    }

    /// Concatenate chunks sharing one schema.
    pub fn concat(chunks: &[ChunkPtr]) -> ExecResult<Option<Chunk>> {
        let Some(first) = chunks.first() else {
            return Ok(None);
        };
        let schema = first.schema();
        let batch = concat_batches(&schema, chunks.iter().map(|c| &c.batch))?;
        Ok(Some(Self::try_new(batch)?))
    }

    pub fn serialize(&self) -> ExecResult<Vec<u8>> {
        let mut writer = StreamWriter::try_new(Vec::new(), self.batch.schema().as_ref())?;
        writer.write(&self.batch)?;
        writer.finish()?;
        Ok(writer.into_inner()?)
    }

    pub fn deserialize(buffer: &[u8]) -> ExecResult<Chunk> {
        let reader = StreamReader::try_new(Cursor::new(buffer), None)?;
        let schema = reader.schema();
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        let batch = match batches.len() {
            0 => RecordBatch::new_empty(schema),
            1 => batches.remove(0),
            _ => concat_batches(&schema, batches.iter())?,
        };
        Self::try_new(batch)
    }

    pub fn memory_usage(&self) -> usize {
        record_batch_bytes(&self.batch)
    }

    pub fn tracker(&self) -> Option<Arc<MemTracker>> {
        self.accounting.as_ref().map(|a| a.tracker())
    }

    /// Move the chunk's bytes onto `tracker`.
    pub fn transfer_to(&mut self, tracker: &Arc<MemTracker>) {
        if let Some(accounting) = self.accounting.as_ref() {
            accounting.transfer_to(tracker);
            return;
        }
        let bytes = chunk_bytes_i64(&self.batch);
        if bytes <= 0 {
            return;
        }
        self.accounting = Some(Arc::new(ChunkAccounting::new(bytes, tracker)));
    }

    fn refresh_accounting(&mut self) {
        if let Some(tracker) = self.accounting.take().map(|a| a.tracker()) {
            self.transfer_to(&tracker);
        }
    }
}

pub fn field_with_slot_id(field: Field, slot_id: SlotId) -> Field {
    let mut meta = field.metadata().clone();
    meta.insert(FIELD_META_SLOT_ID.to_string(), slot_id.to_string());
    field.with_metadata(meta)
}

pub fn field_slot_id(field: &Field) -> ExecResult<Option<SlotId>> {
    let Some(v) = field.metadata().get(FIELD_META_SLOT_ID) else {
        return Ok(None);
    };
    v.parse::<SlotId>()
        .map(Some)
        .map_err(ExecError::InternalError)
}

fn slot_id_to_index_from_schema(schema: &Schema) -> ExecResult<HashMap<SlotId, usize>> {
    let mut map = HashMap::new();
    for (idx, f) in schema.fields().iter().enumerate() {
        let slot_id = field_slot_id(f.as_ref())?.ok_or_else(|| {
            ExecError::internal(format!(
                "missing {} in chunk schema field at index {} (name={})",
                FIELD_META_SLOT_ID,
                idx,
                f.name()
            ))
        })?;
        if map.insert(slot_id, idx).is_some() {
            return Err(ExecError::internal(format!(
                "duplicate slot id {} in chunk schema",
                slot_id
            )));
        }
    }
    Ok(map)
}

/// Estimate RecordBatch size by summing unique buffers inside the batch.
pub fn record_batch_bytes(batch: &RecordBatch) -> usize {
    let mut seen = HashSet::new();
    batch.columns().iter().fold(0usize, |total, column| {
        total.saturating_add(array_data_bytes(&column.to_data(), &mut seen))
    })
}

fn array_data_bytes(data: &arrow::array::ArrayData, seen: &mut HashSet<usize>) -> usize {
    let mut total = 0usize;
    for buffer in data.buffers() {
        total = total.saturating_add(buffer_bytes(buffer, seen));
    }
    if let Some(nulls) = data.nulls() {
        total = total.saturating_add(buffer_bytes(nulls.buffer(), seen));
    }
    for child in data.child_data() {
        total = total.saturating_add(array_data_bytes(child, seen));
    }
    total
}

fn buffer_bytes(buffer: &Buffer, seen: &mut HashSet<usize>) -> usize {
    let ptr = buffer.data_ptr().as_ptr() as usize;
    if !seen.insert(ptr) {
        return 0;
    }
    buffer.capacity().max(buffer.len())
}

#[derive(Debug)]
struct ChunkAccounting {
    bytes: i64,
    tracker: Mutex<Arc<MemTracker>>,
}

impl ChunkAccounting {
    fn new(bytes: i64, tracker: &Arc<MemTracker>) -> Self {
        tracker.consume(bytes);
        Self {
            bytes,
            tracker: Mutex::new(Arc::clone(tracker)),
        }
    }

    fn transfer_to(&self, tracker: &Arc<MemTracker>) {
        let mut guard = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::ptr_eq(&guard, tracker) {
            return;
        }
        guard.release(self.bytes);
        tracker.consume(self.bytes);
        *guard = Arc::clone(tracker);
    }

    fn tracker(&self) -> Arc<MemTracker> {
        Arc::clone(&self.tracker.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Drop for ChunkAccounting {
    fn drop(&mut self) {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .release(self.bytes);
    }
}

fn chunk_bytes_i64(batch: &RecordBatch) -> i64 {
    i64::try_from(record_batch_bytes(batch)).unwrap_or(i64::MAX)
}
