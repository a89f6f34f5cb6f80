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
//! Readiness flags that gate drivers.
//!
//! A `Dependency` starts not-ready and flips to ready exactly once. Callbacks
//! registered with `add_waiter` run on that edge, outside the dependency's lock;
//! a callback added after the edge runs immediately on the caller's thread.
//!
//! Key exported interfaces:
//! - Types: `Dependency`, `DependencyHandle`, `DependencyManager`.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::novarocks_logging::debug;

static NEXT_DEPENDENCY_ID: AtomicUsize = AtomicUsize::new(1);

pub type DependencyHandle = Arc<Dependency>;

type Waiter = Box<dyn FnOnce() + Send>;

pub struct Dependency {
    id: usize,
    name: String,
    /// Mirrors the locked flag so readiness checks on the hot path stay lock-free.
    ready: AtomicBool,
    waiters: Mutex<Option<Vec<Waiter>>>,
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dependency({}#{}, ready={})", self.name, self.id, self.is_ready())
    }
}

/// Identity: two handles are equal when they name the same dependency object.
impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Dependency {}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_DEPENDENCY_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            ready: AtomicBool::new(false),
            waiters: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Flip to ready and run the registered waiters. Only the first call has an effect.
    pub fn set_ready(&self) {
        let waiters = {
            let mut guard = self.waiters.lock().expect("dependency lock");
            // `None` marks the edge as taken.
            let Some(waiters) = guard.take() else {
                return;
            };
            self.ready.store(true, Ordering::Release);
            waiters
        };
        debug!(
            "dependency {}#{} ready, waking {} waiter(s)",
            self.name,
            self.id,
            waiters.len()
        );
        for waiter in waiters {
            waiter();
        }
    }

    /// Run `waiter` once the dependency is ready.
    pub fn add_waiter(&self, waiter: impl FnOnce() + Send + 'static) {
        let mut guard = self.waiters.lock().expect("dependency lock");
        match guard.as_mut() {
            Some(waiters) => waiters.push(Box::new(waiter)),
            None => {
                drop(guard);
                waiter();
            }
        }
    }

    fn num_waiters(&self) -> usize {
        self.waiters
            .lock()
            .expect("dependency lock")
            .as_ref()
            .map_or(0, Vec::len)
    }
}

/// Dependencies of one fragment, keyed by name so that the side that signals and
/// the side that waits resolve to the same object.
#[derive(Default)]
pub struct DependencyManager {
    by_name: Mutex<HashMap<String, DependencyHandle>>,
}

impl DependencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: impl Into<String>) -> DependencyHandle {
        let name = name.into();
        let mut by_name = self.by_name.lock().expect("dependency manager lock");
        if let Some(dep) = by_name.get(&name) {
            return Arc::clone(dep);
        }
        let dep = Arc::new(Dependency::new(name.clone()));
        by_name.insert(name, Arc::clone(&dep));
        dep
    }

    pub fn mark_ready(&self, name: &str) {
        self.get_or_create(name).set_ready();
    }

    /// Names of the dependencies that have not fired yet, sorted.
    pub fn pending(&self) -> Vec<String> {
        let by_name = self.by_name.lock().expect("dependency manager lock");
        let mut names = by_name
            .values()
            .filter(|dep| !dep.is_ready())
            .map(|dep| dep.name().to_string())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Drop every registered dependency; waiters that never fired are dropped with them.
    pub fn clear(&self) -> usize {
        let by_name = mem::take(&mut *self.by_name.lock().expect("dependency manager lock"));
        by_name.values().map(|dep| dep.num_waiters()).sum()
    }
}
