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
//! Periodic re-check of drivers that cannot make progress right now.
//!
//! Drivers land here when their source has nothing to read, their sink is
//! full, or an operator still has asynchronous work in flight. None of these
//! conditions signals an edge, so a single thread re-evaluates every held
//! driver once per interval and returns the runnable ones to the executor.
//! Drivers of an aborted fragment count as runnable so they reach their
//! cancellation path.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use super::global_driver_executor::{DriverTask, ExecutorShared};
use crate::novarocks_logging::{debug, error};

struct Held {
    tasks: Vec<DriverTask>,
    stopped: bool,
}

struct PollerInner {
    shared: Arc<ExecutorShared>,
    interval: Duration,
    held: Mutex<Held>,
    wakeup: Condvar,
}

impl PollerInner {
    fn run(&self) {
        debug!("blocked driver poller running, interval={:?}", self.interval);
        let mut held = self.held.lock().expect("blocked poller lock");
        while !held.stopped {
            let candidates = std::mem::take(&mut held.tasks);
            drop(held);

            let (runnable, waiting): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|task| task.should_abort() || task.check_is_ready());
            for mut task in runnable {
                task.set_ready();
                self.shared.push(task);
            }

            held = self.held.lock().expect("blocked poller lock");
            // Keep drivers that arrived while the lock was released.
            held.tasks.extend(waiting);
            if held.stopped {
                break;
            }
            held = self
                .wakeup
                .wait_timeout(held, self.interval)
                .expect("blocked poller wait")
                .0;
        }
    }
}

#[derive(Clone)]
pub(crate) struct BlockedDriverPoller {
    inner: Arc<PollerInner>,
    thread: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl BlockedDriverPoller {
    pub(crate) fn new(shared: Arc<ExecutorShared>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                shared,
                interval,
                held: Mutex::new(Held {
                    tasks: Vec::new(),
                    stopped: false,
                }),
                wakeup: Condvar::new(),
            }),
            thread: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn start(&self) {
        let mut thread = self.thread.lock().expect("blocked poller thread lock");
        if thread.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("blocked_driver_poller".to_string())
            .spawn(move || inner.run())
        {
            Ok(handle) => *thread = Some(handle),
            Err(err) => error!("failed to spawn blocked driver poller: {}", err),
        }
    }

    pub(crate) fn add_blocked(&self, task: DriverTask) {
        let mut held = self.inner.held.lock().expect("blocked poller lock");
        if held.stopped {
            drop(held);
            task.abandon();
            return;
        }
        held.tasks.push(task);
    }

    /// Stop polling; drivers still held are abandoned.
    pub(crate) fn shutdown(&self) {
        {
            let mut held = self.inner.held.lock().expect("blocked poller lock");
            if held.stopped {
                return;
            }
            held.stopped = true;
        }
        self.inner.wakeup.notify_all();
        if let Some(handle) = self.thread.lock().expect("blocked poller thread lock").take() {
            let _ = handle.join();
        }
        let leftover = std::mem::take(&mut self.inner.held.lock().expect("blocked poller lock").tasks);
        if !leftover.is_empty() {
            debug!("blocked driver poller stopped with {} held driver(s)", leftover.len());
        }
        for task in leftover {
            task.abandon();
        }
    }
}
