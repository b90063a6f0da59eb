/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core building blocks shared by the store and the daemon: errors,
//! logging, runtime options and the clock.

use crate::config::types::LogConfig;
use crate::core::log::DomainStoreLogFormatter;
use crate::core::runtime::{Options, Runtime};
use clap::Parser;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub mod clock;
pub mod error;
pub mod log;
pub mod runtime;

/// Parse command-line options into a fresh runtime container
pub fn init() -> Runtime {
    Runtime {
        options: Options::parse(),
        log_guard: None,
    }
}

/// Initialise the global tracing subscriber
///
/// Console output is always enabled; a non-blocking file layer is added when
/// `log.file` is set. The returned guard must be held until shutdown.
pub fn init_log(log: LogConfig) -> WorkerGuard {
    let (file_writer, guard) = match log.file.as_deref().map(Path::new) {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "domain-store.log".into());
            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(non_blocking), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = fmt::layer()
        .event_format(DomainStoreLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(DomainStoreLogFormatter)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| EnvFilter::new("info"));

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard.unwrap_or_else(|| tracing_appender::non_blocking(std::io::sink()).1)
}
