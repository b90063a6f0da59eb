/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Unified error handling for the domain store
//!
//! Only I/O, configuration and persistence problems surface as errors.
//! Malformed DNS traffic is counted and dropped, never returned to callers.

use crate::config::types::ConfigError;
use thiserror::Error;

/// Main error type for the domain store
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// JSON encoding or decoding of a persisted mapping failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mappings file could not be interpreted
    #[error("Persistence error: {0}")]
    Persist(String),

    /// Packet decode error
    #[error("Decode error: {0}")]
    Decode(String),

    /// Tokio runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Generic error with custom message
    #[error("{0}")]
    Generic(String),
}

#[allow(unused)]
impl StoreError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        StoreError::Config(msg.into())
    }

    /// Create a persistence error
    pub fn persist<S: Into<String>>(msg: S) -> Self {
        StoreError::Persist(msg.into())
    }

    /// Create a decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        StoreError::Decode(msg.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        StoreError::Runtime(msg.into())
    }
}

impl From<String> for StoreError {
    fn from(s: String) -> Self {
        StoreError::Generic(s)
    }
}

impl From<&str> for StoreError {
    fn from(s: &str) -> Self {
        StoreError::Generic(s.to_string())
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        StoreError::Config(e.to_string())
    }
}

/// Convenient type alias for Results using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;
