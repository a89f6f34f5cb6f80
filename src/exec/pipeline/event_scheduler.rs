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
//! Parking set for drivers gated on a `Dependency`.
//!
//! A parked driver is held here and costs nothing until its dependency fires;
//! the dependency's waiter then hands it straight to the re-admission callback.
//! There is no scheduler thread and no polling. Cancellation re-admits every
//! parked driver so each runs its own abort path.
//!
//! Current limitations:
//! - A driver gated on several dependencies is woken once per dependency and
//!   re-parks on the next one that is still pending.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::novarocks_logging::debug;

use super::dependency::Dependency;

/// Receives a parked item back once it may run again.
pub(crate) type Readmit<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Parked<T> {
    next_token: u64,
    items: HashMap<u64, (T, Readmit<T>)>,
    closed: bool,
}

/// One per fragment.
pub(crate) struct EventScheduler<T> {
    parked: Mutex<Parked<T>>,
}

impl<T: Send + 'static> EventScheduler<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            parked: Mutex::new(Parked {
                next_token: 0,
                items: HashMap::new(),
                closed: false,
            }),
        })
    }

    #[cfg(test)]
    fn num_parked(&self) -> usize {
        self.parked.lock().expect("event scheduler lock").items.len()
    }

    /// Hold `item` until `dep` is ready. A ready dependency, or a closed
    /// scheduler, re-admits it before this returns.
    pub(crate) fn park(self: &Arc<Self>, item: T, dep: &Dependency, readmit: Readmit<T>) {
        let token = {
            let mut parked = self.parked.lock().expect("event scheduler lock");
            if parked.closed {
                drop(parked);
                readmit(item);
                return;
            }
            let token = parked.next_token;
            parked.next_token += 1;
            parked.items.insert(token, (item, readmit));
            token
        };
        let scheduler = Arc::downgrade(self);
        dep.add_waiter(move || {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.wake(token);
            }
        });
    }

    fn wake(&self, token: u64) {
        let entry = self
            .parked
            .lock()
            .expect("event scheduler lock")
            .items
            .remove(&token);
        // Already re-admitted by `wake_all`.
        if let Some((item, readmit)) = entry {
            readmit(item);
        }
    }

    /// Re-admit everything that is parked.
    pub(crate) fn wake_all(&self) {
        let entries = std::mem::take(&mut self.parked.lock().expect("event scheduler lock").items);
        if !entries.is_empty() {
            debug!("event scheduler waking {} parked driver(s)", entries.len());
        }
        for (item, readmit) in entries.into_values() {
            readmit(item);
        }
    }

    /// Refuse further parking and re-admit whatever is still parked.
    pub(crate) fn close(&self) {
        self.parked.lock().expect("event scheduler lock").closed = true;
        self.wake_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (Arc<Mutex<Vec<u32>>>, Readmit<u32>) {
        let woken = Arc::new(Mutex::new(Vec::<u32>::new()));
        let sink = Arc::clone(&woken);
        let readmit: Readmit<u32> = Arc::new(move |item: u32| sink.lock().expect("woken").push(item));
        (woken, readmit)
    }

    #[test]
    fn parked_items_return_when_their_dependency_fires() {
        let scheduler = EventScheduler::new();
        let (woken, readmit) = collector();
        let build = Dependency::new("join_build:1");
        let filter = Dependency::new("local_rf:2");
        scheduler.park(1, &build, Arc::clone(&readmit));
        scheduler.park(2, &filter, Arc::clone(&readmit));
        assert_eq!(scheduler.num_parked(), 2);
        assert!(woken.lock().expect("woken").is_empty());

        filter.set_ready();
        assert_eq!(*woken.lock().expect("woken"), vec![2]);
        assert_eq!(scheduler.num_parked(), 1);

        let ready = Dependency::new("done");
        ready.set_ready();
        scheduler.park(3, &ready, readmit);
        assert_eq!(*woken.lock().expect("woken"), vec![2, 3]);
        assert_eq!(scheduler.num_parked(), 1);
    }

    #[test]
    fn wake_all_readmits_once_and_close_refuses_parking() {
        let scheduler = EventScheduler::new();
        let (woken, readmit) = collector();
        let dep = Dependency::new("local_rf:4");
        scheduler.park(7, &dep, Arc::clone(&readmit));
        scheduler.wake_all();
        dep.set_ready();
        assert_eq!(*woken.lock().expect("woken"), vec![7]);

        scheduler.close();
        scheduler.park(8, &Dependency::new("never"), readmit);
        assert_eq!(*woken.lock().expect("woken"), vec![7, 8]);
        assert_eq!(scheduler.num_parked(), 0);
    }
}
