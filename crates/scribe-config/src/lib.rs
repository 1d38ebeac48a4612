// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration for the Scribe writer process and application connections.
//!
//! TOML files are merged along the XDG hierarchy, `SCRIBE_*` environment
//! variables override them, and unknown keys are reported as miette
//! diagnostics with typo suggestions.
//!
//! ```no_run
//! use scribe_config::load_and_validate;
//!
//! let config = load_and_validate().expect("config errors");
//! println!("writer at {}", config.writer.address());
//! ```

pub mod diagnostic;
pub mod loader;
pub mod model;
pub mod validation;

use std::path::{Path, PathBuf};

pub use diagnostic::{ConfigError, render_errors};
pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::{LoggingConfig, ScribeConfig, StorageConfig, WriterConfig};

/// Load from the XDG hierarchy plus environment, then validate.
pub fn load_and_validate() -> Result<ScribeConfig, Vec<ConfigError>> {
    finish(loader::load_config(), collect_toml_sources)
}

/// Load from an explicit file plus environment, then validate.
pub fn load_and_validate_path(path: &Path) -> Result<ScribeConfig, Vec<ConfigError>> {
    finish(loader::load_config_from_path(path), || {
        read_source(path.to_path_buf()).into_iter().collect()
    })
}

/// Load from a TOML string, then validate.
pub fn load_and_validate_str(toml_content: &str) -> Result<ScribeConfig, Vec<ConfigError>> {
    finish(loader::load_config_from_str(toml_content), || {
        vec![("<inline>".to_string(), toml_content.to_string())]
    })
}

fn finish(
    loaded: Result<ScribeConfig, figment::Error>,
    sources: impl FnOnce() -> Vec<(String, String)>,
) -> Result<ScribeConfig, Vec<ConfigError>> {
    match loaded {
        Ok(config) => {
            validation::validate_config(&config)?;
            tracing::debug!(writer = %config.writer.address(), "configuration loaded");
            Ok(config)
        }
        Err(err) => Err(diagnostic::figment_to_config_errors(err, &sources())),
    }
}

/// Contents of every config file that exists, for span resolution.
fn collect_toml_sources() -> Vec<(String, String)> {
    let local = std::env::current_dir()
        .map(|d| d.join("scribe.toml"))
        .unwrap_or_else(|_| PathBuf::from("scribe.toml"));
    let user = dirs::config_dir().map(|d| d.join("scribe/scribe.toml"));
    let system = PathBuf::from("/etc/scribe/scribe.toml");

    [Some(local), user, Some(system)]
        .into_iter()
        .flatten()
        .filter_map(read_source)
        .collect()
}

fn read_source(path: PathBuf) -> Option<(String, String)> {
    std::fs::read_to_string(&path)
        .ok()
        .map(|content| (path.display().to_string(), content))
}
