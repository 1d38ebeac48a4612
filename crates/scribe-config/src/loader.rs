// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./scribe.toml` > `~/.config/scribe/scribe.toml` > `/etc/scribe/scribe.toml`
//! with environment variable overrides via `SCRIBE_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::ScribeConfig;

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/scribe/scribe.toml` (system-wide)
/// 3. `~/.config/scribe/scribe.toml` (user XDG config)
/// 4. `./scribe.toml` (local directory)
/// 5. `SCRIBE_*` environment variables
pub fn load_config() -> Result<ScribeConfig, figment::Error> {
    build_figment().extract()
}

/// Load configuration from a TOML string only (no XDG lookup, no env).
///
/// Used for testing and explicit configuration.
pub fn load_config_from_str(toml_content: &str) -> Result<ScribeConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ScribeConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<ScribeConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(ScribeConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Build the Figment used internally for config loading (exposed for diagnostic use).
pub fn build_figment() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(ScribeConfig::default()))
        .merge(Toml::file("/etc/scribe/scribe.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("scribe/scribe.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("scribe.toml"))
        .merge(env_provider())
}

/// Environment provider mapping `SCRIBE_<SECTION>_<KEY>` to `section.key`.
///
/// Uses `Env::map()` rather than `Env::split("_")`: keys such as
/// `SCRIBE_STORAGE_BUSY_TIMEOUT_MS` must land on `storage.busy_timeout_ms`.
fn env_provider() -> Env {
    Env::prefixed("SCRIBE_").map(|key| {
        let key_str = key.as_str();
        let mapped = key_str
            .replacen("writer_", "writer.", 1)
            .replacen("storage_", "storage.", 1)
            .replacen("logging_", "logging.", 1);
        mapped.into()
    })
}
