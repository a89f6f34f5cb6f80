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
//! Bounded pool for blocking work issued by operators.
//!
//! Drivers never block inside a quantum. An operator that needs disk or network I/O
//! submits a task here, reports not-ready, and flips its state from the completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use threadpool::ThreadPool;

use crate::common::config;

pub struct IoTaskContext {
    cancelled: Arc<AtomicBool>,
}

impl IoTaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct IoTaskCompletion {
    done: Mutex<bool>,
    cv: Condvar,
}

impl IoTaskCompletion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn mark_done(&self) {
        *self.done.lock().expect("io task completion lock") = true;
        self.cv.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.done.lock().expect("io task completion lock")
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().expect("io task completion lock");
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |done| !*done)
            .expect("io task completion wait");
        *guard
    }

    fn wait(&self) {
        let guard = self.done.lock().expect("io task completion lock");
        let _guard = self
            .cv
            .wait_while(guard, |done| !*done)
            .expect("io task completion wait");
    }
}

/// Handle returned by `IoExecutor::submit`.
#[derive(Clone)]
pub struct IoTaskHandle {
    cancelled: Arc<AtomicBool>,
    completion: Arc<IoTaskCompletion>,
}

impl IoTaskHandle {
    /// Ask the task to stop. The task observes this through `IoTaskContext::is_cancelled`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }

    pub fn wait(&self) {
        self.completion.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }
}

pub struct IoExecutor {
    pool: Mutex<ThreadPool>,
}

impl IoExecutor {
    pub fn new(num_threads: usize) -> Self {
        let pool = ThreadPool::with_name("io_task".to_string(), num_threads.max(1));
        Self {
            pool: Mutex::new(pool),
        }
    }

    pub fn submit<F>(&self, task: F) -> IoTaskHandle
    where
        F: FnOnce(IoTaskContext) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let completion = Arc::new(IoTaskCompletion::new());
        let ctx = IoTaskContext {
            cancelled: Arc::clone(&cancelled),
        };
        let done = Arc::clone(&completion);
        self.pool
            .lock()
            .expect("io executor lock")
            .execute(move || {
                // Mark done even if the task panics so pending_finish cannot hang forever.
                let _guard = CompletionGuard(done);
                task(ctx);
            });
        IoTaskHandle {
            cancelled,
            completion,
        }
    }

    pub fn queued_count(&self) -> usize {
        self.pool.lock().expect("io executor lock").queued_count()
    }
}

struct CompletionGuard(Arc<IoTaskCompletion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

static IO_EXECUTOR: OnceLock<IoExecutor> = OnceLock::new();

pub fn io_executor() -> &'static IoExecutor {
    IO_EXECUTOR.get_or_init(|| IoExecutor::new(config::io_threads()))
}
