// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Semantic checks run after deserialization.
//!
//! Every rule is evaluated; the caller receives the full list of problems.

use std::net::IpAddr;

use crate::diagnostic::ConfigError;
use crate::model::ScribeConfig;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Validate a deserialized configuration.
pub fn validate_config(config: &ScribeConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let mut fail = |message: String| errors.push(ConfigError::Validation { message });

    // The writer endpoint is local-only.
    let host = config.writer.host.trim();
    let loopback = host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);
    if !loopback {
        fail(format!(
            "writer.host `{host}` must be a loopback address (127.0.0.1, ::1 or localhost)"
        ));
    }

    if config.writer.port == 0 {
        fail("writer.port must be a fixed port, got 0".to_string());
    }

    if config.writer.max_frame_bytes == 0 {
        fail("writer.max_frame_bytes must be greater than 0".to_string());
    }

    if config.storage.sql_vm_instructions_cb <= 0 {
        fail(format!(
            "storage.sql_vm_instructions_cb must be positive, got {}",
            config.storage.sql_vm_instructions_cb
        ));
    }

    if config.storage.context_switch_wait_ms == 0 {
        fail("storage.context_switch_wait_ms must be greater than 0".to_string());
    }

    let level = config.logging.level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        fail(format!(
            "logging.level `{}` is not one of {}",
            config.logging.level,
            LOG_LEVELS.join(", ")
        ));
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(config: &ScribeConfig) -> Vec<String> {
        match validate_config(config) {
            Ok(()) => Vec::new(),
            Err(errs) => errs.iter().map(|e| e.to_string()).collect(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&ScribeConfig::default()).is_ok());
    }

    #[test]
    fn non_loopback_host_rejected() {
        let mut config = ScribeConfig::default();
        config.writer.host = "0.0.0.0".into();
        let msgs = messages(&config);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("loopback"));
    }

    #[test]
    fn ipv6_loopback_and_localhost_accepted() {
        let mut config = ScribeConfig::default();
        config.writer.host = "::1".into();
        assert!(validate_config(&config).is_ok());
        config.writer.host = "localhost".into();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ScribeConfig::default();
        config.writer.port = 0;
        config.writer.max_frame_bytes = 0;
        config.storage.sql_vm_instructions_cb = 0;
        config.storage.context_switch_wait_ms = 0;
        config.logging.level = "loud".into();
        let msgs = messages(&config);
        assert_eq!(msgs.len(), 5, "got {msgs:?}");
        assert!(msgs.iter().any(|m| m.contains("writer.port")));
        assert!(msgs.iter().any(|m| m.contains("sql_vm_instructions_cb")));
        assert!(msgs.iter().any(|m| m.contains("logging.level `loud`")));
    }

    #[test]
    fn log_level_is_case_insensitive() {
        let mut config = ScribeConfig::default();
        config.logging.level = "DEBUG".into();
        assert!(validate_config(&config).is_ok());
    }
}
