// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for Scribe.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Scribe configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable overrides.
/// All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScribeConfig {
    /// Writer process endpoint settings.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Application-side connection settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the writer process listens and how large a frame may get.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WriterConfig {
    /// Loopback address the writer binds to.
    #[serde(default = "default_writer_host")]
    pub host: String,

    /// TCP port of the writer endpoint.
    #[serde(default = "default_writer_port")]
    pub port: u16,

    /// Largest accepted request or reply frame, in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            host: default_writer_host(),
            port: default_writer_port(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl WriterConfig {
    /// `host:port` string suitable for binding or connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_writer_host() -> String {
    "127.0.0.1".to_string()
}

fn default_writer_port() -> u16 {
    5555
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

/// Connection behaviour on the application side and engine pragmas.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Number of engine VM instructions between progress callbacks.
    #[serde(default = "default_sql_vm_instructions_cb")]
    pub sql_vm_instructions_cb: i32,

    /// Recheck delay while waiting for another unit's write or savepoints.
    #[serde(default = "default_context_switch_wait_ms")]
    pub context_switch_wait_ms: u64,

    /// Engine busy timeout applied to every connection.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Enable WAL journal mode when a database is initialized.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sql_vm_instructions_cb: default_sql_vm_instructions_cb(),
            context_switch_wait_ms: default_context_switch_wait_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    pub fn context_switch_wait(&self) -> Duration {
        Duration::from_millis(self.context_switch_wait_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_sql_vm_instructions_cb() -> i32 {
    5000
}

fn default_context_switch_wait_ms() -> u64 {
    50
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
