// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `scribe serve`: run the writer until SIGINT or SIGTERM.

use scribe_config::ScribeConfig;
use scribe_core::ScribeError;
use scribe_writer::WriterServer;
use tracing::info;

use crate::shutdown;

pub async fn run_serve(mut config: ScribeConfig, port: Option<u16>) -> Result<(), ScribeError> {
    init_tracing(&config.logging.level);

    if let Some(port) = port {
        config.writer.port = port;
    }

    let cancel = shutdown::install_signal_handler();
    let server = WriterServer::bind(config).await?;
    info!(addr = %server.local_addr()?, "scribe writer starting");
    server.run(cancel).await?;
    info!("scribe writer stopped");
    Ok(())
}

/// Initializes the tracing subscriber with the given log level. `RUST_LOG`
/// takes precedence.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scribe={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}
