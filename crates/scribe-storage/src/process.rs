// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Launching the writer as a child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use scribe_core::ScribeError;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const READY_POLL: Duration = Duration::from_millis(20);

/// A running `scribe serve` child. Killed when dropped.
#[derive(Debug)]
pub struct WriterProcess {
    child: Child,
    port: u16,
}

impl WriterProcess {
    /// Start `binary serve --port <port>` and wait until the port accepts
    /// connections or `ready_timeout` elapses.
    pub async fn spawn(
        binary: &Path,
        port: u16,
        ready_timeout: Duration,
    ) -> Result<Self, ScribeError> {
        let mut child = Command::new(binary)
            .arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScribeError::Internal(format!("failed to spawn {}: {e}", binary.display())))?;
        debug!(pid = ?child.id(), port, "writer process spawned");

        let ready = tokio::time::timeout(ready_timeout, async {
            loop {
                if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                    return;
                }
                tokio::time::sleep(READY_POLL).await;
            }
        })
        .await;

        if ready.is_err() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill unresponsive writer");
            }
            return Err(ScribeError::Internal(format!(
                "writer on port {port} not ready after {ready_timeout:?}"
            )));
        }
        info!(pid = ?child.id(), port, "writer process ready");
        Ok(Self { child, port })
    }

    /// `scribe` next to the current executable.
    pub fn default_binary() -> Result<PathBuf, ScribeError> {
        let exe = std::env::current_exe()
            .map_err(|e| ScribeError::Internal(format!("cannot locate current executable: {e}")))?;
        let dir = exe
            .parent()
            .ok_or_else(|| ScribeError::Internal("executable has no parent directory".into()))?;
        Ok(dir.join(format!("scribe{}", std::env::consts::EXE_SUFFIX)))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the writer and reap it.
    pub async fn stop(mut self) -> Result<(), ScribeError> {
        self.child
            .kill()
            .await
            .map_err(|e| ScribeError::Internal(format!("failed to stop writer: {e}")))?;
        debug!(port = self.port, "writer process stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let err = WriterProcess::spawn(
            Path::new("/nonexistent/scribe"),
            1,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn default_binary_sits_next_to_current_exe() {
        let path = WriterProcess::default_binary().unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("scribe"));
    }
}
