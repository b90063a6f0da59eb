/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Domain Store daemon
//!
//! Loads the configuration, starts the domain info store and the IP set
//! driver, and saves the cache on Ctrl+C.

use domain_store::config;
use domain_store::core;
use domain_store::core::error::{Result, StoreError};
use domain_store::dataplane::{DataplaneDriver, IpFamily, IpSetsHandler, TracingIpSetBackend};
use domain_store::store::DomainInfoStore;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::{runtime, signal};
use tracing::{error, info};

/// Application entry point
fn main() -> Result<()> {
    init_runtime()
}

/// Build the multi-threaded Tokio runtime and run the daemon on it
fn init_runtime() -> Result<()> {
    let mut tokio_runtime = runtime::Builder::new_multi_thread();
    tokio_runtime.enable_all().thread_name("domain-store-worker");
    let tokio_runtime = tokio_runtime
        .build()
        .map_err(|err| StoreError::runtime(format!("Failed to initialize Tokio runtime: {err}")))?;
    tokio_runtime.block_on(run_async_main())
}

async fn run_async_main() -> Result<()> {
    let mut runtime = core::init();
    let options = runtime.options.clone();

    let config = match config::init(&options.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration initialization failed: {e}");
            std::process::exit(1);
        }
    };

    // Override log level from command line if provided
    let mut log_config = config.log.clone();
    if let Some(level) = options.log_level {
        log_config.level = level;
    }
    runtime.log_guard = Some(core::init_log(log_config));
    info!("Loaded configuration from: {:?}", options.config);

    let store = DomainInfoStore::new(&config.store, None)?;
    let ready = store
        .updates_ready()
        .ok_or_else(|| StoreError::runtime("updates ready channel already taken"))?;

    let families = [
        (config.dataplane.set_name4.as_deref(), IpFamily::V4),
        (config.dataplane.set_name6.as_deref(), IpFamily::V6),
    ];
    let mut handlers = Vec::new();
    for (set_name, family) in families {
        let Some(set_name) = set_name else {
            continue;
        };
        let handler = Arc::new(IpSetsHandler::new(
            set_name,
            family,
            store.lookup(),
            &config.dataplane.domains,
        ));
        store.register_handler(handler.clone());
        handlers.push(handler);
    }

    if let Err(e) = store.start() {
        error!("Domain info store failed to start: {}", e);
        std::process::exit(1);
    }

    let driver = DataplaneDriver::new(store.clone(), handlers, Arc::new(TracingIpSetBackend));
    driver.prime().await;
    let (driver_shutdown_tx, driver_shutdown_rx) = oneshot::channel();
    let driver_task = tokio::spawn(driver.run(ready, driver_shutdown_rx));
    info!("Domain store started successfully");

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    let _ = driver_shutdown_tx.send(());
    let _ = driver_task.await;
    store.stop().await;
    info!("Graceful shutdown complete");
    Ok(())
}
