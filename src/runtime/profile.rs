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
//! Runtime profile tree.
//!
//! Responsibilities:
//! - Holds named counters, timers and info strings for fragments, drivers and operators.
//! - Renders a readable tree for logs and tests.
//!
//! Key exported interfaces:
//! - Types: `RuntimeProfile`, `Counter`, `CounterRef`, `CounterUnit`, `ScopedTimer`, `OperatorProfiles`.
//!
//! Current limitations:
//! - No wire encoding; shipping profiles to a coordinator is left to the service layer.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeNs,
}

#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

pub type Profiler = RuntimeProfile;

#[derive(Debug)]
struct RuntimeProfileInner {
    name: String,
    counters: Mutex<HashMap<String, CounterRef>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: name.into(),
                counters: Mutex::new(HashMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn get_child(&self, name: &str) -> Option<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn add_child(&self, child: RuntimeProfile) {
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if children.iter().any(|c| c.name() == child.name()) {
            return;
        }
        children.push(child);
    }

    /// Return the named child, creating it on first use.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = children.iter().find(|c| c.name() == name) {
            return existing.clone();
        }
        let child = RuntimeProfile::new(name);
        children.push(child.clone());
        child
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let name = name.into();
        let mut guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            guard
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Counter::new(name, unit))),
        )
    }

    pub fn get_counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn counter_add(&self, name: &str, unit: CounterUnit, delta: i64) {
        self.add_counter(name, unit).add(delta);
    }

    pub fn counter_set(&self, name: &str, unit: CounterUnit, value: i64) {
        self.add_counter(name, unit).set(value);
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeNs)
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        ScopedTimer::new(self.add_timer(name))
    }

    pub fn to_readable_string(&self) -> String {
        let mut out = String::new();
        self.render(&mut out, 0);
        out
    }

    fn render(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = writeln!(out, "{}{}:", indent, self.name());
        for (k, v) in self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            let _ = writeln!(out, "{}   - {}: {}", indent, k, v);
        }
        let mut counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect::<Vec<_>>();
        counters.sort_by(|a, b| a.name.cmp(&b.name));
        for c in counters {
            let _ = writeln!(out, "{}   - {}: {}", indent, c.name, c.display_value());
        }
        for child in self.children() {
            child.render(out, depth + 1);
        }
    }
}

pub type CounterRef = Arc<Counter>;

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: CounterUnit,
    value: AtomicI64,
}

impl Counter {
    pub fn new(name: impl Into<String>, unit: CounterUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn display_value(&self) -> String {
        let v = self.value();
        match self.unit {
            CounterUnit::Unit => v.to_string(),
            CounterUnit::Bytes => format!("{} B", v),
            CounterUnit::TimeNs => format!("{:.3}ms", v as f64 / 1_000_000.0),
        }
    }
}

/// Adds the elapsed wall time to the counter on drop.
pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.counter
            .add(clamp_u128_to_i64(self.start.elapsed().as_nanos()));
    }
}

pub fn clamp_u128_to_i64(v: u128) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Profile nodes of one operator instance: the operator node plus its
/// `CommonMetrics` and `UniqueMetrics` children.
#[derive(Clone, Debug)]
pub struct OperatorProfiles {
    pub operator: RuntimeProfile,
    pub common: RuntimeProfile,
    pub unique: RuntimeProfile,
}

impl OperatorProfiles {
    pub fn new(name: impl Into<String>) -> Self {
        let operator = RuntimeProfile::new(name);
        let common = operator.child("CommonMetrics");
        let unique = operator.child("UniqueMetrics");
        Self {
            operator,
            common,
            unique,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_counter_is_get_or_create() {
        let profile = RuntimeProfile::new("op");
        let a = profile.add_counter("Rows", CounterUnit::Unit);
        let b = profile.add_counter("Rows", CounterUnit::Unit);
        a.add(3);
        assert_eq!(b.value(), 3);
    }

    #[test]
    fn readable_string_contains_children_and_counters() {
        let profiles = OperatorProfiles::new("AGGREGATE_DISTINCT_STREAMING_SINK (id=1)");
        profiles.common.counter_set("PushRowNum", CounterUnit::Unit, 7);
        profiles.unique.add_info_string("Mode", "AUTO");
        let text = profiles.operator.to_readable_string();
        assert!(text.contains("CommonMetrics"), "{text}");
        assert!(text.contains("PushRowNum: 7"), "{text}");
        assert!(text.contains("Mode: AUTO"), "{text}");
        let common = profiles.operator.get_child("CommonMetrics").expect("common");
        assert_eq!(common.get_counter("PushRowNum").map(|c| c.value()), Some(7));
        assert!(common.get_counter("PullRowNum").is_none());
        assert_eq!(profiles.unique.get_info_string("Mode").as_deref(), Some("AUTO"));
    }
}
