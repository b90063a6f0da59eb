/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CACHE_FILE: &str = "/var/run/domain-store/dnsinfo.txt";
const DEFAULT_SAVE_INTERVAL: u64 = 60;
const DEFAULT_GC_INTERVAL: u64 = 13;
const DEFAULT_MAX_TOP_LEVEL_DOMAINS: usize = 5;
const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Cache file path cannot be empty")]
    EmptyCacheFile,

    #[error("store.extra_ttl of {0}s exceeds one year")]
    ExtraTtlTooLarge(u64),
}

/// Upper bound for `store.extra_ttl`: one year.
pub const MAX_EXTRA_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// Domain info store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// IP set programming settings
    #[serde(default)]
    pub dataplane: DataplaneConfig,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }
        self.store.validate()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Domain info store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// File the cache is persisted to
    pub cache_file: PathBuf,

    /// Seconds between cache saves
    pub save_interval: u64,

    /// Seconds between garbage collection passes
    pub gc_interval: u64,

    /// Cache epoch; a different value invalidates every cached mapping
    pub epoch: i64,

    /// Seconds added to every observed TTL
    pub extra_ttl: u64,

    /// Pair requests and responses to log DNS latency
    pub logs_latency: bool,

    /// Keep DNS information per client IP instead of one shared bucket
    pub dest_domains_by_client: bool,

    /// Cap on top-level domains remembered per name or IP
    pub max_top_level_domains: usize,

    /// Capacity of the packet ingestion channel
    pub channel_capacity: usize,

    /// Debug only: delay before signalling that updates are ready
    pub response_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_file: PathBuf::from(DEFAULT_CACHE_FILE),
            save_interval: DEFAULT_SAVE_INTERVAL,
            gc_interval: DEFAULT_GC_INTERVAL,
            epoch: 0,
            extra_ttl: 0,
            logs_latency: true,
            dest_domains_by_client: true,
            max_top_level_domains: DEFAULT_MAX_TOP_LEVEL_DOMAINS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            response_delay_ms: 0,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_file.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCacheFile);
        }
        if self.save_interval == 0 {
            return Err(ConfigError::Zero("store.save_interval"));
        }
        if self.gc_interval == 0 {
            return Err(ConfigError::Zero("store.gc_interval"));
        }
        if self.max_top_level_domains == 0 {
            return Err(ConfigError::Zero("store.max_top_level_domains"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Zero("store.channel_capacity"));
        }
        if self.extra_ttl > MAX_EXTRA_TTL_SECS {
            return Err(ConfigError::ExtraTtlTooLarge(self.extra_ttl));
        }
        Ok(())
    }

    #[inline]
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval)
    }

    #[inline]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval)
    }

    #[inline]
    pub fn extra_ttl(&self) -> Duration {
        Duration::from_secs(self.extra_ttl)
    }

    #[inline]
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }
}

/// Dataplane IP set configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DataplaneConfig {
    /// IPv4 set receiving resolved addresses
    pub set_name4: Option<String>,

    /// IPv6 set receiving resolved addresses
    pub set_name6: Option<String>,

    /// Domains (exact or wildcard) whose addresses belong in the sets
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Hot-reloadable subset of the store configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub epoch: i64,
    pub extra_ttl: Duration,
}
