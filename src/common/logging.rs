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
//! glog-style logging for the execution engine.
//!
//! Lines look like `I20261016 10:11:12.123456 7 driver.rs:88] message`, so engine
//! logs can be grepped with the same tooling as the rest of the worker.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

static INIT: OnceLock<()> = OnceLock::new();
static NEXT_THREAD_NO: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_NO: u64 = NEXT_THREAD_NO.fetch_add(1, Ordering::Relaxed);
}

struct GlogFormatter;

#[derive(Clone)]
struct LogFileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl io::Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?
            .flush()
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `$NOVAROCKS_LOG_FILE` wins, then `$NOVAROCKS_LOG_DIR/novarocks.log`. Without either, log to stderr.
fn resolve_log_file_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("NOVAROCKS_LOG_FILE") {
        return Some(PathBuf::from(path));
    }
    non_empty_env("NOVAROCKS_LOG_DIR").map(|dir| PathBuf::from(dir).join("novarocks.log"))
}

fn open_log_writer(path: PathBuf) -> Option<LogFileWriter> {
    if let Some(parent) = path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        eprintln!(
            "failed to create log directory {}: {}, fallback to stderr",
            parent.display(),
            err
        );
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(LogFileWriter {
            file: Arc::new(Mutex::new(file)),
        }),
        Err(err) => {
            eprintln!(
                "failed to open log file {}: {}, fallback to stderr",
                path.display(),
                err
            );
            None
        }
    }
}

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let level = match *metadata.level() {
            tracing::Level::ERROR => 'E',
            tracing::Level::WARN => 'W',
            tracing::Level::INFO => 'I',
            tracing::Level::DEBUG => 'D',
            tracing::Level::TRACE => 'T',
        };
        let file = metadata
            .file()
            .and_then(|f| f.rsplit('/').next())
            .unwrap_or("unknown");
        let thread_no = THREAD_NO.with(|n| *n);
        write!(
            writer,
            "{}{} {} {}:{}] ",
            level,
            Local::now().format("%Y%m%d %H:%M:%S%.6f"),
            thread_no,
            file,
            metadata.line().unwrap_or(0)
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        let env_filter = EnvFilter::new(level);
        if let Some(writer) = resolve_log_file_path().and_then(open_log_writer) {
            let _ = tracing_fmt()
                .with_env_filter(env_filter)
                .with_writer(writer)
                .with_ansi(false)
                .event_format(GlogFormatter)
                .try_init();
            return;
        }
        let _ = tracing_fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .event_format(GlogFormatter)
            .try_init();
    });
}

/// Initialize from the loaded config; `log_filter` takes precedence over `log_level`.
pub fn init_from_config() {
    let level = crate::common::app_config::config()
        .ok()
        .map(|c| c.log_filter.clone().unwrap_or_else(|| c.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    init_with_level(&level);
}

pub use tracing::{debug, error, info, trace, warn};
