// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test harness for end-to-end integration testing.
//!
//! `TestHarness` runs a writer server in-process on an ephemeral loopback
//! port, keeps a temp directory for database files, and opens
//! [`Connection`]s against both.

use std::net::SocketAddr;

use scribe_config::ScribeConfig;
use scribe_core::{ConnectionKind, ScribeError};
use scribe_storage::{Connection, ConnectionOptions, MinimizedSchema, ProgressRegistry};
use scribe_writer::{CallRecord, WriterServer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Builder for creating test environments with configurable options.
pub struct TestHarnessBuilder {
    config: ScribeConfig,
    password: Option<String>,
    schema: Option<MinimizedSchema>,
    record_calls: bool,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        let mut config = ScribeConfig::default();
        config.writer.port = 0;
        config.storage.context_switch_wait_ms = 5;
        Self {
            config,
            password: Some("test-password".to_string()),
            schema: None,
            record_calls: false,
        }
    }

    /// Set how often the progress callback fires, in VM instructions.
    pub fn with_progress_period(mut self, instructions: i32) -> Self {
        self.config.storage.sql_vm_instructions_cb = instructions;
        self
    }

    /// Set the encryption key used for encrypted kinds. `None` opens them
    /// without a key.
    pub fn with_password(mut self, password: Option<&str>) -> Self {
        self.password = password.map(str::to_string);
        self
    }

    /// Check this schema whenever a `User` or `Global` connection opens.
    pub fn with_schema(mut self, schema: MinimizedSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Keep a record of every call the writer executes, see
    /// [`TestHarness::call_records`].
    pub fn with_call_records(mut self) -> Self {
        self.record_calls = true;
        self
    }

    /// Bind the writer and start serving.
    pub async fn build(self) -> Result<TestHarness, ScribeError> {
        let temp_dir =
            tempfile::TempDir::new().map_err(|e| ScribeError::Storage { source: e.into() })?;

        let mut server = WriterServer::bind(self.config.clone()).await?;
        let calls = self.record_calls.then(|| server.record_calls());
        let addr = server.local_addr()?;
        let cancel = CancellationToken::new();
        let server_task = tokio::spawn(server.run(cancel.clone()));
        debug!(%addr, "test writer listening");

        let mut config = self.config;
        config.writer.port = addr.port();

        Ok(TestHarness {
            config,
            addr,
            password: self.password,
            schema: self.schema,
            calls,
            registry: ProgressRegistry::new(),
            cancel,
            server_task: Some(server_task),
            temp_dir,
        })
    }
}

/// A running writer plus a scratch directory.
pub struct TestHarness {
    pub config: ScribeConfig,
    addr: SocketAddr,
    password: Option<String>,
    schema: Option<MinimizedSchema>,
    calls: Option<mpsc::UnboundedReceiver<CallRecord>>,
    registry: ProgressRegistry,
    cancel: CancellationToken,
    server_task: Option<JoinHandle<Result<(), ScribeError>>>,
    temp_dir: tempfile::TempDir,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    /// Address the writer listens on.
    pub fn writer_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &ProgressRegistry {
        &self.registry
    }

    /// Path of `file` inside the scratch directory.
    pub fn db_path(&self, file: &str) -> String {
        self.temp_dir.path().join(file).display().to_string()
    }

    /// Options for `file` of `kind`, pointing at this writer.
    pub fn options(&self, file: &str, kind: ConnectionKind) -> ConnectionOptions {
        let mut options = ConnectionOptions::from_config(&self.config, self.db_path(file), kind);
        if let Some(password) = &self.password {
            options = options.password(password.clone());
        }
        if let Some(schema) = &self.schema {
            options = options.minimized_schema(schema.clone());
        }
        options
    }

    /// Open a connection to `file` of `kind`.
    pub async fn connect(&self, file: &str, kind: ConnectionKind) -> Result<Connection, ScribeError> {
        Connection::open(self.options(file, kind), &self.registry).await
    }

    /// Open the default `user.db` connection.
    pub async fn user_db(&self) -> Result<Connection, ScribeError> {
        self.connect("user.db", ConnectionKind::User).await
    }

    /// Calls the writer executed since the last look, in execution order.
    /// Empty unless built with [`TestHarnessBuilder::with_call_records`].
    pub fn call_records(&mut self) -> Vec<CallRecord> {
        let Some(calls) = self.calls.as_mut() else {
            return Vec::new();
        };
        std::iter::from_fn(|| calls.try_recv().ok()).collect()
    }

    /// Cancel the writer and wait for it to finish.
    pub async fn shutdown(&mut self) -> Result<(), ScribeError> {
        self.cancel.cancel();
        if let Some(task) = self.server_task.take() {
            task.await
                .map_err(|e| ScribeError::Internal(format!("writer task panicked: {e}")))??;
        }
        Ok(())
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use scribe_wire::{Value, values};

    use super::*;

    #[tokio::test]
    async fn harness_serves_connections() {
        let harness = TestHarness::builder().build().await.unwrap();
        assert_ne!(harness.writer_addr().port(), 0);

        let conn = harness.user_db().await.unwrap();
        conn.executescript("CREATE TABLE t(x INTEGER)").await.unwrap();
        conn.write_context(false, |c| async move {
            c.execute("INSERT INTO t VALUES(?)", &values![42]).await
        })
        .await
        .unwrap();

        let rows = conn
            .cursor()
            .execute("SELECT x FROM t", &[])
            .await
            .unwrap()
            .fetch_all();
        assert_eq!(rows, vec![vec![Value::Integer(42)]]);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn call_records_follow_the_writer() {
        let mut harness = TestHarness::builder().with_call_records().build().await.unwrap();
        let conn = harness.user_db().await.unwrap();
        conn.executescript("CREATE TABLE t(x INTEGER)").await.unwrap();

        let records = harness.call_records();
        let last = records.last().unwrap();
        assert_eq!(last.statement.as_deref(), Some("CREATE TABLE t(x INTEGER)"));
        assert_eq!(last.identity, *conn.identity());
        assert!(records.windows(2).all(|w| w[0].seq < w[1].seq));
        assert!(harness.call_records().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_writer() {
        let mut harness = TestHarness::builder().build().await.unwrap();
        let addr = harness.writer_addr();
        harness.shutdown().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
