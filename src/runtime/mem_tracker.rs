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
//! Logical memory accounting.
//!
//! Responsibilities:
//! - Records bytes reported by operators, edges and hash tables into a tracker tree.
//! - Exposes per-tracker limits so growth paths can fail with an allocation error
//!   instead of exhausting the process.
//!
//! Key exported interfaces:
//! - Types: `MemTracker`, `TrackedBytes`.
//! - Functions: `process_mem_tracker`.
//!
//! Current limitations:
//! - Counts only what callers report; it does not reflect allocator statistics or RSS.
//! - Enforcement (throttling, spilling, killing) belongs to the caller.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::common::status::{ExecError, ExecResult};

/// Byte count charged to one tracker for as long as the value lives.
///
/// Used for buffers that are not Arrow arrays but still follow the
/// "current holder pays" model, such as serialized chunks.
#[derive(Debug)]
pub struct TrackedBytes {
    bytes: i64,
    tracker: Arc<MemTracker>,
}

impl TrackedBytes {
    pub fn new(bytes: usize, tracker: Arc<MemTracker>) -> Self {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        tracker.consume(bytes);
        Self { bytes, tracker }
    }

    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn transfer_to(&mut self, tracker: Arc<MemTracker>) {
        if Arc::ptr_eq(&self.tracker, &tracker) {
            return;
        }
        self.tracker.release(self.bytes);
        tracker.consume(self.bytes);
        self.tracker = tracker;
    }
}

impl Drop for TrackedBytes {
    fn drop(&mut self) {
        self.tracker.release(self.bytes);
    }
}

#[derive(Debug)]
pub struct MemTracker {
    label: String,
    /// Negative means unlimited.
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    fn build(label: String, limit: i64, parent: Option<Arc<MemTracker>>) -> Self {
        Self {
            label,
            limit,
            parent,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(label.into(), -1, None))
    }

    pub fn new_root_with_limit(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self::build(label.into(), limit, None))
    }

    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        Self::new_child_with_limit(label, -1, parent)
    }

    pub fn new_child_with_limit(
        label: impl Into<String>,
        limit: i64,
        parent: &Arc<MemTracker>,
    ) -> Arc<Self> {
        let child = Arc::new(Self::build(label.into(), limit, Some(Arc::clone(parent))));
        let mut children = parent.children.lock().unwrap_or_else(|e| e.into_inner());
        children.retain(|w| w.strong_count() > 0);
        children.push(Arc::downgrade(&child));
        child
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn parent(&self) -> Option<&Arc<MemTracker>> {
        self.parent.as_ref()
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    /// Replace this tracker's own figure with `bytes`, propagating the delta upwards.
    ///
    /// Used for structures that report a reserved size rather than individual allocations.
    pub fn set(&self, bytes: i64) {
        let bytes = bytes.max(0);
        let delta = bytes - self.current();
        if delta > 0 {
            self.consume(delta);
        } else if delta < 0 {
            self.release(-delta);
        }
    }

    /// Name of the first tracker on the ancestor path that would exceed its limit.
    pub fn limit_exceeded_by(&self, bytes: i64) -> Option<&str> {
        if bytes <= 0 {
            return None;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            if current.limit >= 0 && current.current() + bytes > current.limit {
                return Some(current.label.as_str());
            }
            tracker = current.parent.as_deref();
        }
        None
    }

    pub fn would_exceed_limit(&self, bytes: i64) -> bool {
        self.limit_exceeded_by(bytes).is_some()
    }

    /// Consume `bytes` unless a limit on the ancestor path would be exceeded.
    pub fn try_consume(&self, bytes: i64) -> ExecResult<()> {
        if let Some(label) = self.limit_exceeded_by(bytes) {
            return Err(ExecError::mem_alloc_failed(format!(
                "memory limit exceeded: tracker={} request={} bytes",
                label, bytes
            )));
        }
        self.consume(bytes);
        Ok(())
    }

    fn update_peak(&self, value: i64) {
        self.peak.fetch_max(value, Ordering::AcqRel);
    }
}

static PROCESS_TRACKER: OnceLock<Arc<MemTracker>> = OnceLock::new();

/// Global process-level logical memory tracker.
pub fn process_mem_tracker() -> Arc<MemTracker> {
    Arc::clone(PROCESS_TRACKER.get_or_init(|| MemTracker::new_root("process")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_and_release_walk_ancestors() {
        let root = MemTracker::new_root("root");
        let child = MemTracker::new_child("child", &root);
        child.consume(100);
        assert_eq!(root.current(), 100);
        child.release(40);
        assert_eq!(root.current(), 60);
        assert_eq!(child.peak(), 100);
    }

    #[test]
    fn set_moves_by_delta() {
        let root = MemTracker::new_root("root");
        let child = MemTracker::new_child("hash set", &root);
        child.set(1024);
        child.set(256);
        assert_eq!(child.current(), 256);
        assert_eq!(root.current(), 256);
        child.set(0);
        assert_eq!(root.current(), 0);
    }

    #[test]
    fn try_consume_respects_ancestor_limit() {
        let root = MemTracker::new_root_with_limit("query", 1000);
        let child = MemTracker::new_child("op", &root);
        child.try_consume(800).expect("within limit");
        assert!(!child.would_exceed_limit(200));
        assert!(child.would_exceed_limit(201));
        assert_eq!(child.limit_exceeded_by(300), Some("query"));
        let err = child.try_consume(300).expect_err("over limit");
        assert!(err.is_mem_alloc_failed());
        assert_eq!(root.current(), 800);
    }
}
