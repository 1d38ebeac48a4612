// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The application-side connection façade.
//!
//! Reads go straight to a private local engine handle. Writes go through a
//! [`WriterClient`] to the writer process, inside scoped contexts that keep
//! at most one task in a write transaction or savepoint stack at a time.
//!
//! Ownership of the write lock and of the savepoint stack is tracked by task
//! id under a short-lived mutex that is never held across an await. A task
//! that finds either held by someone else waits for a release notification,
//! rechecking at least every `context_switch_wait_ms`.

use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use scribe_config::{ScribeConfig, StorageConfig};
use scribe_core::{ConnectionKind, ContextError, DatabaseIdentity, ScribeError};
use scribe_wire::{Call, DbMethod, Value};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::client::{WriterChannel, WriterClient, close_quietly};
use crate::cursor::{DbCursor, WriteTarget, map_tr_err};
use crate::progress::{ProgressGate, ProgressRegistry, UnitId};
use crate::savepoint::{SavepointAction, SavepointStack, savepoint_statement};
use crate::schema::{MinimizedSchema, check_schema};

/// Server-side cursor used by plain write contexts.
const WRITE_CURSOR: &str = "default";

const LAST_WRITE_TS: &str = "INSERT OR REPLACE INTO settings(name, value) VALUES(?, ?)";

/// Everything needed to open a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub path: String,
    pub kind: ConnectionKind,
    pub password: Option<String>,
    /// `host:port` of the writer.
    pub writer_addr: String,
    pub max_frame_bytes: usize,
    pub storage: StorageConfig,
    /// Checked once at open for `User` and `Global` connections.
    pub minimized_schema: Option<MinimizedSchema>,
}

impl ConnectionOptions {
    pub fn new(path: impl Into<String>, kind: ConnectionKind, writer_addr: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            password: None,
            writer_addr: writer_addr.into(),
            max_frame_bytes: scribe_config::WriterConfig::default().max_frame_bytes,
            storage: StorageConfig::default(),
            minimized_schema: None,
        }
    }

    /// Options pointing at the writer described by `config`.
    pub fn from_config(config: &ScribeConfig, path: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            max_frame_bytes: config.writer.max_frame_bytes,
            storage: config.storage.clone(),
            ..Self::new(path, kind, config.writer.address())
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn minimized_schema(mut self, schema: MinimizedSchema) -> Self {
        self.minimized_schema = Some(schema);
        self
    }
}

#[derive(Debug, Default)]
struct TxState {
    savepoints: SavepointStack,
    write_owner: Option<UnitId>,
}

impl TxState {
    fn write_held_by_other(&self, unit: UnitId) -> bool {
        self.write_owner.is_some_and(|owner| owner != unit)
    }
}

/// A shared handle on one database identity. Cheap to clone; clones share
/// the same lock state and savepoint stack.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    identity: DatabaseIdentity,
    local: tokio_rusqlite::Connection,
    channel: Arc<WriterChannel>,
    /// Unnamed stub for raw plumbing calls.
    stub: WriterClient,
    state: Mutex<TxState>,
    released: Notify,
    gate: Arc<ProgressGate>,
    registry: ProgressRegistry,
    recheck: Duration,
}

impl Connection {
    /// Open the local read handle, install the progress callback, connect
    /// to the writer and run the schema sanity check.
    ///
    /// The local handle is set up first, so a failure there never leaves the
    /// identity connected on the writer.
    pub async fn open(
        options: ConnectionOptions,
        registry: &ProgressRegistry,
    ) -> Result<Self, ScribeError> {
        let kind = options.kind;
        let identity = DatabaseIdentity::new(options.path.clone(), kind);

        let local = tokio_rusqlite::Connection::open(&options.path)
            .await
            .map_err(|e| ScribeError::Storage {
                source: Box::new(e),
            })?;

        let gate = registry.register(kind);
        let password = options.password.clone();
        let busy_timeout = options.storage.busy_timeout();
        let period = options.storage.sql_vm_instructions_cb;
        let handler = registry.handler(kind);
        let configured = local
            .call(move |conn| -> Result<(), rusqlite::Error> {
                if kind.is_encrypted()
                    && let Some(password) = &password
                {
                    conn.pragma_update(None, "key", password)?;
                }
                conn.busy_timeout(busy_timeout)?;
                conn.progress_handler(period, Some(handler));
                Ok(())
            })
            .await
            .map_err(map_tr_err);
        let connected = match configured {
            Ok(()) => connect_writer(&options, &identity).await,
            Err(e) => Err(e),
        };
        let (channel, stub) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                registry.unregister(kind);
                if let Err(close_err) = local.close().await {
                    warn!(identity = %identity, error = %close_err, "failed to close local handle");
                }
                return Err(e);
            }
        };

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                identity,
                local,
                channel,
                stub,
                state: Mutex::new(TxState::default()),
                released: Notify::new(),
                gate,
                registry: registry.clone(),
                recheck: options.storage.context_switch_wait(),
            }),
        };

        if kind != ConnectionKind::Transient
            && let Some(schema) = &options.minimized_schema
        {
            let checked = {
                let _critical = connection.inner.gate.critical_section();
                check_schema(&connection.cursor(), kind, schema).await
            };
            if let Err(e) = checked {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "failed to close connection after schema check");
                }
                return Err(e);
            }
        }

        info!(identity = %connection.inner.identity, "connection opened");
        Ok(connection)
    }

    pub fn identity(&self) -> &DatabaseIdentity {
        &self.inner.identity
    }

    /// The yield gate shared by this connection's cursors.
    pub fn gate(&self) -> &Arc<ProgressGate> {
        &self.inner.gate
    }

    /// Names of the open savepoints, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.state().savepoints.names().to_vec()
    }

    /// Whether some task is inside a write context.
    pub fn write_held(&self) -> bool {
        self.state().write_owner.is_some()
    }

    /// A fresh local cursor.
    pub fn cursor(&self) -> DbCursor {
        DbCursor::new(self.inner.local.clone(), Arc::clone(&self.inner.gate))
    }

    /// Unregister the progress gate, drop the writer's connection and close
    /// the local handle. A writer that already went away is not an error.
    pub async fn close(&self) -> Result<(), ScribeError> {
        self.inner.registry.unregister(self.inner.identity.kind);
        match self.inner.stub.close_connection().await {
            Ok(()) => {}
            Err(e) if e.is_channel_closed() => {
                debug!(identity = %self.inner.identity, "writer already gone at close");
            }
            Err(e) => return Err(e),
        }
        self.inner
            .local
            .clone()
            .close()
            .await
            .map_err(|e| ScribeError::Storage {
                source: Box::new(e),
            })?;
        info!(identity = %self.inner.identity, "connection closed");
        Ok(())
    }

    // Raw plumbing through the unnamed stub. No lock is taken.

    pub async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<WriterClient, ScribeError> {
        self.inner.stub.execute(sql, bindings).await?;
        Ok(self.inner.stub.clone())
    }

    pub async fn executemany(
        &self,
        sql: &str,
        rows: &[Vec<Value>],
    ) -> Result<WriterClient, ScribeError> {
        self.inner.stub.executemany(sql, rows).await?;
        Ok(self.inner.stub.clone())
    }

    pub async fn executescript(&self, script: &str) -> Result<WriterClient, ScribeError> {
        self.inner.stub.executescript(script).await?;
        Ok(self.inner.stub.clone())
    }

    pub async fn commit(&self) -> Result<(), ScribeError> {
        self.inner.stub.commit().await
    }

    pub async fn rollback(&self) -> Result<(), ScribeError> {
        self.inner.stub.rollback().await
    }

    /// Run `body` with a local cursor. Never waits on the writer.
    pub async fn read_context<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(DbCursor) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        body(self.cursor()).await
    }

    /// Run `body` inside a write transaction on the writer.
    ///
    /// Commits when `body` succeeds (stamping `last_write_ts` first when
    /// `commit_ts` is set) and rolls back otherwise. A task that already
    /// holds savepoints gets one more nested savepoint instead.
    pub async fn write_context<F, Fut, T, E>(&self, commit_ts: bool, body: F) -> Result<T, E>
    where
        F: FnOnce(WriterClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ScribeError>,
    {
        let unit = UnitId::current();
        let (holds_savepoints, holds_write) = {
            let state = self.state();
            (
                state.savepoints.owner() == Some(unit),
                state.write_owner == Some(unit),
            )
        };
        if holds_savepoints {
            trace!("write context inside savepoints, nesting a savepoint instead");
            return self.savepoint_context(None, body).await;
        }
        if holds_write {
            return Err(context_error("a write context is already open in this task").into());
        }

        let mut claim = self.claim_write(unit).await;
        let _critical = self.inner.gate.critical_section();
        let client = WriterClient::for_cursor(
            Arc::clone(&self.inner.channel),
            self.inner.identity.clone(),
            WRITE_CURSOR,
        );
        claim.unwind = Some(Unwind::Transaction(client.clone()));
        client.open_cursor().await?;
        let result = run_transaction(client.clone(), commit_ts, body).await;
        claim.unwind = Some(Unwind::Cursor(client.clone()));
        close_quietly(&client).await;
        claim.unwind = None;
        drop(claim);
        result
    }

    /// Run `body` in a local write transaction, bypassing the writer.
    ///
    /// Only safe while nothing else writes to this database, such as during
    /// schema upgrades.
    pub async fn read_write_context<F, Fut, T, E>(&self, commit_ts: bool, body: F) -> Result<T, E>
    where
        F: FnOnce(DbCursor) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ScribeError>,
    {
        let unit = UnitId::current();
        {
            let state = self.state();
            if state.savepoints.owner() == Some(unit) {
                return Err(
                    context_error("cannot open a local write transaction while holding savepoints")
                        .into(),
                );
            }
            if state.write_owner == Some(unit) {
                return Err(context_error("a write context is already open in this task").into());
            }
        }

        let mut claim = self.claim_write(unit).await;
        let _critical = self.inner.gate.critical_section();
        let cursor = self.cursor();
        claim.local = Some(cursor.clone());
        let result = run_transaction(cursor, commit_ts, body).await;
        claim.local = None;
        drop(claim);
        result
    }

    /// Run `body` inside a savepoint named `name`, or a fresh uuid.
    ///
    /// On success the savepoint and everything opened after it are released.
    /// On failure the work since it opened is rolled back, the savepoint is
    /// still released, and the body's error is returned with the enclosing
    /// scope left open.
    pub async fn savepoint_context<F, Fut, T, E>(&self, name: Option<&str>, body: F) -> Result<T, E>
    where
        F: FnOnce(WriterClient) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ScribeError>,
    {
        let name = name.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let unit = UnitId::current();

        self.wait_and_claim(|state| {
            if state.write_held_by_other(unit) || state.savepoints.held_by_other(unit) {
                return None;
            }
            let _critical = self.inner.gate.critical_section();
            Some(state.savepoints.push(&name, unit))
        })
        .await
        .map_err(ScribeError::from)?;
        let mut pushed = PushedSavepoint {
            conn: &self.inner,
            name: &name,
            unwind: None,
        };

        let client = WriterClient::for_cursor(
            Arc::clone(&self.inner.channel),
            self.inner.identity.clone(),
            &name,
        );
        pushed.unwind = Some(Unwind::Savepoint(client.clone(), name.clone()));
        client.open_cursor().await?;
        client.execute(&savepoint_statement(&name), &[]).await?;
        debug!(savepoint = %name, "savepoint opened");

        let result = match body(client.clone()).await {
            Ok(value) => self
                .finish_savepoint(&client, &name, SavepointAction::Release)
                .await
                .map(|()| value)
                .map_err(E::from),
            Err(e) => {
                if let Err(rollback_err) = self
                    .finish_savepoint(&client, &name, SavepointAction::RollbackTo)
                    .await
                {
                    log_secondary(&rollback_err, "rollback to savepoint failed");
                }
                if let Err(release_err) = self
                    .finish_savepoint(&client, &name, SavepointAction::Release)
                    .await
                {
                    log_secondary(&release_err, "release of savepoint failed");
                }
                Err(e)
            }
        };

        pushed.unwind = Some(Unwind::Cursor(client.clone()));
        debug!(savepoint = %name, "closing savepoint");
        close_quietly(&client).await;
        pushed.unwind = None;
        drop(pushed);
        result
    }

    /// Apply `action` to `name` if the body has not already done so.
    async fn finish_savepoint(
        &self,
        client: &WriterClient,
        name: &str,
        action: SavepointAction,
    ) -> Result<(), ScribeError> {
        if !self.state().savepoints.contains(name) {
            return Ok(());
        }
        client.execute(&action.statement(name), &[]).await
    }

    /// Release `name`, or the latest savepoint, and everything opened after
    /// it.
    pub async fn release_savepoint(&self, name: Option<&str>) -> Result<(), ScribeError> {
        let target = self
            .state()
            .savepoints
            .resolve(SavepointAction::Release, name)?;
        self.inner
            .stub
            .execute(&SavepointAction::Release.statement(&target), &[])
            .await?;
        let removed = {
            let mut state = self.state();
            let _critical = self.inner.gate.critical_section();
            state.savepoints.truncate_from(&target)
        };
        trace!(?removed, "savepoints released");
        self.inner.released.notify_waiters();
        Ok(())
    }

    /// Undo the work since `name`, or the latest savepoint, was opened. The
    /// savepoint itself stays on the stack.
    pub async fn rollback_savepoint(&self, name: Option<&str>) -> Result<(), ScribeError> {
        let target = self
            .state()
            .savepoints
            .resolve(SavepointAction::RollbackTo, name)?;
        self.inner
            .stub
            .execute(&SavepointAction::RollbackTo.statement(&target), &[])
            .await
    }

    fn state(&self) -> MutexGuard<'_, TxState> {
        self.inner.state()
    }

    /// Wait until neither the write lock nor the savepoint stack is held by
    /// another task, then take the write lock for `unit`.
    async fn claim_write(&self, unit: UnitId) -> WriteClaim {
        self.wait_and_claim(|state| {
            if state.write_owner.is_some() || state.savepoints.held_by_other(unit) {
                return None;
            }
            let _critical = self.inner.gate.critical_section();
            state.write_owner = Some(unit);
            Some(())
        })
        .await;
        trace!(?unit, "write lock taken");
        WriteClaim {
            conn: Arc::clone(&self.inner),
            unwind: None,
            local: None,
        }
    }

    /// Run `claim` under the state lock until it succeeds, sleeping between
    /// attempts until a release is signalled or the recheck delay passes.
    async fn wait_and_claim<R>(&self, mut claim: impl FnMut(&mut TxState) -> Option<R>) -> R {
        loop {
            let mut notified = pin!(self.inner.released.notified());
            notified.as_mut().enable();
            if let Some(claimed) = claim(&mut self.state()) {
                return claimed;
            }
            trace!("write lock or savepoints held by another task, waiting");
            let _ = tokio::time::timeout(self.inner.recheck, notified).await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Connection")
            .field("identity", &self.inner.identity)
            .field("write_owner", &state.write_owner)
            .field("savepoints", &state.savepoints.names())
            .finish()
    }
}

fn context_error(message: &str) -> ScribeError {
    ContextError(message.to_string()).into()
}

/// Connect to the writer and have it open `identity`.
async fn connect_writer(
    options: &ConnectionOptions,
    identity: &DatabaseIdentity,
) -> Result<(Arc<WriterChannel>, WriterClient), ScribeError> {
    let channel =
        WriterChannel::connect(options.writer_addr.as_str(), options.max_frame_bytes).await?;
    let stub = WriterClient::unnamed(Arc::clone(&channel), identity.clone());
    stub.initialize(options.password.as_deref()).await?;
    Ok((channel, stub))
}

impl ConnectionInner {
    fn state(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release_write(&self) {
        self.state().write_owner = None;
        self.released.notify_waiters();
    }

    /// Push deferred writer calls out without waiting for the next request.
    fn spawn_flush(&self) {
        if self.channel.is_closed() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let channel = Arc::clone(&self.channel);
        handle.spawn(async move {
            if let Err(e) = channel.flush_deferred().await {
                debug!(error = %e, "deferred writer calls not sent");
            }
        });
    }
}

/// Writer-side state a context still has open while it runs.
///
/// If the context future is dropped before it finishes, the matching undo
/// calls are queued on the channel, so they reach the writer ahead of any
/// later request.
enum Unwind {
    /// A transaction may be open on the writer.
    Transaction(WriterClient),
    /// The named savepoint may be open on the writer.
    Savepoint(WriterClient, String),
    /// Only the stub's server-side cursor is left.
    Cursor(WriterClient),
}

impl Unwind {
    fn defer(self, conn: &ConnectionInner) {
        let identity = &conn.identity;
        let (client, calls) = match self {
            Self::Transaction(client) => {
                (client, vec![Call::new(identity.clone(), DbMethod::Rollback)])
            }
            Self::Savepoint(client, name) => {
                let calls = [SavepointAction::RollbackTo, SavepointAction::Release]
                    .into_iter()
                    .map(|action| {
                        Call::new(identity.clone(), DbMethod::Execute).arg(action.statement(&name))
                    })
                    .collect();
                (client, calls)
            }
            Self::Cursor(client) => (client, Vec::new()),
        };
        client.abandon(calls);
        conn.spawn_flush();
    }
}

/// Releases the write lock when the context ends, even if it is dropped.
struct WriteClaim {
    conn: Arc<ConnectionInner>,
    unwind: Option<Unwind>,
    /// A local transaction that still needs a rollback.
    local: Option<DbCursor>,
}

impl Drop for WriteClaim {
    fn drop(&mut self) {
        if let Some(unwind) = self.unwind.take() {
            debug!(identity = %self.conn.identity, "write context abandoned");
            unwind.defer(&self.conn);
        }
        let Some(cursor) = self.local.take() else {
            self.conn.release_write();
            return;
        };

        // The lock stays held until the local rollback has run.
        debug!(identity = %self.conn.identity, "local write context abandoned");
        let conn = Arc::clone(&self.conn);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = cursor.rollback().await {
                        warn!(error = %e, "rollback of abandoned local transaction failed");
                    }
                    conn.release_write();
                });
            }
            Err(_) => {
                warn!("no runtime left to roll back an abandoned local transaction");
                conn.release_write();
            }
        }
    }
}

/// Pops a savepoint and everything after it when its context ends.
struct PushedSavepoint<'a> {
    conn: &'a ConnectionInner,
    name: &'a str,
    unwind: Option<Unwind>,
}

impl Drop for PushedSavepoint<'_> {
    fn drop(&mut self) {
        if let Some(unwind) = self.unwind.take() {
            debug!(savepoint = self.name, "savepoint context abandoned");
            let unwind = match unwind {
                Unwind::Savepoint(client, name) if !self.conn.state().savepoints.contains(&name) => {
                    Unwind::Cursor(client)
                }
                other => other,
            };
            unwind.defer(self.conn);
        }
        let removed = self.conn.state().savepoints.truncate_from(self.name);
        if !removed.is_empty() {
            trace!(?removed, "savepoints popped");
        }
        self.conn.released.notify_waiters();
    }
}

/// Log a failure that happened while cleaning up after another one.
fn log_secondary(err: &ScribeError, what: &str) {
    if err.is_channel_closed() {
        debug!(error = %err, "{what}: writer gone, scope abandoned");
    } else {
        warn!(error = %err, "{what}");
    }
}

/// BEGIN, run `body`, then commit or roll back.
async fn run_transaction<C, F, Fut, T, E>(target: C, commit_ts: bool, body: F) -> Result<T, E>
where
    C: WriteTarget + Clone,
    F: FnOnce(C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<ScribeError>,
{
    target.execute("BEGIN TRANSACTION", &[]).await?;
    let result = match body(target.clone()).await {
        Ok(value) => commit(&target, commit_ts).await.map(|()| value).map_err(E::from),
        Err(e) => Err(e),
    };
    if result.is_err()
        && let Err(rollback_err) = target.rollback().await
    {
        log_secondary(&rollback_err, "rollback after failed write context failed");
    }
    result
}

async fn commit<C: WriteTarget>(target: &C, commit_ts: bool) -> Result<(), ScribeError> {
    if commit_ts {
        let now = Utc::now().timestamp().to_string();
        target
            .execute(LAST_WRITE_TS, &[Value::from("last_write_ts"), Value::from(now)])
            .await?;
    }
    target.commit().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use scribe_core::ErrorKind;
    use scribe_wire::values;
    use scribe_writer::WriterServer;
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        addr: std::net::SocketAddr,
        cancel: CancellationToken,
        conn: Connection,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ScribeConfig::default();
        config.writer.port = 0;
        config.storage.context_switch_wait_ms = 5;
        let server = WriterServer::bind(config.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        config.writer.port = addr.port();
        let path = dir.path().join("user.db").display().to_string();
        let options =
            ConnectionOptions::from_config(&config, path, ConnectionKind::User).password("123");
        let conn = Connection::open(options, &ProgressRegistry::new()).await.unwrap();
        conn.executescript(
            "CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT UNIQUE);\
             CREATE TABLE settings(name TEXT PRIMARY KEY, value TEXT);",
        )
        .await
        .unwrap();
        Fixture {
            _dir: dir,
            addr,
            cancel,
            conn,
        }
    }

    async fn count(conn: &Connection) -> i64 {
        let row = conn
            .cursor()
            .execute("SELECT COUNT(*) FROM t", &[])
            .await
            .unwrap()
            .fetch_one();
        match row.as_deref() {
            Some([Value::Integer(n)]) => *n,
            other => panic!("unexpected row {other:?}"),
        }
    }

    async fn names(conn: &Connection) -> Vec<Vec<Value>> {
        conn.cursor()
            .execute("SELECT name FROM t ORDER BY id", &[])
            .await
            .unwrap()
            .fetch_all()
    }

    #[tokio::test]
    async fn write_context_commits_and_stamps() {
        let fx = fixture().await;
        fx.conn
            .write_context(true, |c| async move {
                c.execute("INSERT INTO t(name) VALUES(?)", &values!["a"]).await?;
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();
        assert_eq!(count(&fx.conn).await, 1);
        assert!(!fx.conn.write_held());

        let stamp = fx
            .conn
            .cursor()
            .execute("SELECT value FROM settings WHERE name = 'last_write_ts'", &[])
            .await
            .unwrap()
            .fetch_one();
        assert!(matches!(stamp.as_deref(), Some([Value::Text(_)])));
    }

    #[tokio::test]
    async fn write_context_rolls_back_on_error() {
        let fx = fixture().await;
        let before = count(&fx.conn).await;
        let err = fx
            .conn
            .write_context(false, |c| async move {
                c.execute("INSERT INTO t(name) VALUES('a')", &[]).await?;
                Err::<(), _>(ScribeError::Internal("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::Internal(_)));
        assert_eq!(count(&fx.conn).await, before);
    }

    #[tokio::test]
    async fn writer_fault_rolls_back_whole_context() {
        let fx = fixture().await;
        let err = fx
            .conn
            .write_context(false, |c| async move {
                c.execute("INSERT INTO t(name) VALUES('a')", &[]).await?;
                c.execute("INSERT INTO t(name) VALUES('a')", &[]).await?;
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.db_kind(), Some(ErrorKind::DbWrite));
        assert_eq!(count(&fx.conn).await, 0);
    }

    #[tokio::test]
    async fn nested_savepoint_rollback_keeps_outer_work() {
        let fx = fixture().await;
        let conn = fx.conn.clone();
        fx.conn
            .savepoint_context(Some("sp1"), |c| async move {
                c.execute("INSERT INTO t(name) VALUES('first')", &[]).await?;
                let inner = conn
                    .savepoint_context(Some("sp2"), |c| async move {
                        c.execute("INSERT INTO t(name) VALUES('second')", &[]).await?;
                        Err::<(), _>(ScribeError::Internal("inner failure".into()))
                    })
                    .await;
                assert!(inner.is_err());
                assert_eq!(conn.savepoints(), vec!["sp1".to_string()]);
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();

        assert!(fx.conn.savepoints().is_empty());
        let names = fx
            .conn
            .cursor()
            .execute("SELECT name FROM t", &[])
            .await
            .unwrap()
            .fetch_all();
        assert_eq!(names, vec![values!["first"]]);
    }

    #[tokio::test]
    async fn write_context_inside_savepoint_becomes_savepoint() {
        let fx = fixture().await;
        let conn = fx.conn.clone();
        fx.conn
            .savepoint_context(Some("outer"), |_| async move {
                let seen = conn
                    .write_context(false, |_| {
                        let conn = conn.clone();
                        async move { Ok::<_, ScribeError>(conn.savepoints()) }
                    })
                    .await?;
                assert_eq!(seen.len(), 2);
                assert_eq!(seen[0], "outer");
                assert!(!conn.write_held());
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_savepoint_name_is_context_error() {
        let fx = fixture().await;
        let conn = fx.conn.clone();
        let err = fx
            .conn
            .savepoint_context(Some("sp"), |_| async move {
                conn.savepoint_context(Some("sp"), |_| async { Ok::<_, ScribeError>(()) })
                    .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::Context(_)));
        assert!(fx.conn.savepoints().is_empty());
    }

    #[tokio::test]
    async fn manual_savepoint_release_and_rollback() {
        let fx = fixture().await;
        let err = fx.conn.release_savepoint(None).await.unwrap_err();
        assert!(matches!(err, ScribeError::Context(_)));

        let conn = fx.conn.clone();
        fx.conn
            .savepoint_context(Some("a"), |_| async move {
                conn.execute("INSERT INTO t(name) VALUES('x')", &[]).await?;
                conn.rollback_savepoint(None).await?;
                assert_eq!(conn.savepoints(), vec!["a".to_string()]);
                let missing = conn.rollback_savepoint(Some("zzz")).await.unwrap_err();
                assert!(matches!(missing, ScribeError::Context(_)));
                conn.release_savepoint(Some("a")).await?;
                assert!(conn.savepoints().is_empty());
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();
        assert_eq!(count(&fx.conn).await, 0);
    }

    #[tokio::test]
    async fn nested_write_context_in_same_task_is_rejected() {
        let fx = fixture().await;
        let conn = fx.conn.clone();
        let err = fx
            .conn
            .write_context(false, |_| async move {
                conn.write_context(false, |_| async { Ok::<_, ScribeError>(()) })
                    .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::Context(_)));
        assert!(!fx.conn.write_held());
    }

    #[tokio::test]
    async fn read_write_context_uses_local_handle() {
        let fx = fixture().await;
        fx.conn
            .read_write_context(false, |cur| async move {
                cur.execute("INSERT INTO t(name) VALUES('local')", &[]).await?;
                assert_eq!(cur.rowcount(), 1);
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();
        assert_eq!(count(&fx.conn).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_task_waits_for_write_context() {
        let fx = fixture().await;
        let first_done = Arc::new(AtomicBool::new(false));

        let conn = fx.conn.clone();
        let done = Arc::clone(&first_done);
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let first = tokio::spawn(async move {
            conn.write_context(false, |c| async move {
                let _ = entered_tx.send(());
                c.execute("INSERT INTO t(name) VALUES('a')", &[]).await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                c.execute("INSERT INTO t(name) VALUES('b')", &[]).await?;
                done.store(true, Ordering::SeqCst);
                Ok::<_, ScribeError>(())
            })
            .await
        });

        entered_rx.await.unwrap();
        let conn = fx.conn.clone();
        let done = Arc::clone(&first_done);
        let second = tokio::spawn(async move {
            conn.write_context(false, |c| async move {
                assert!(done.load(Ordering::SeqCst));
                c.execute("INSERT INTO t(name) VALUES('c')", &[]).await?;
                Ok::<_, ScribeError>(())
            })
            .await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(count(&fx.conn).await, 3);
    }

    #[tokio::test]
    async fn close_tolerates_missing_writer() {
        let fx = fixture().await;
        fx.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_write_context_is_rolled_back() {
        let fx = fixture().await;
        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            fx.conn.write_context(false, |c| async move {
                c.execute("INSERT INTO t(name) VALUES('cancelled')", &[]).await?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ScribeError>(())
            }),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!fx.conn.write_held());

        fx.conn
            .write_context(false, |c| async move {
                c.execute("INSERT INTO t(name) VALUES('kept')", &[]).await?;
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();
        // Nothing of the dropped context is left for a raw commit to keep.
        fx.conn.commit().await.unwrap();
        assert_eq!(names(&fx.conn).await, vec![values!["kept"]]);
    }

    #[tokio::test]
    async fn dropped_savepoint_context_is_unwound() {
        let fx = fixture().await;
        let conn = fx.conn.clone();
        fx.conn
            .savepoint_context(Some("outer"), |c| async move {
                c.execute("INSERT INTO t(name) VALUES('before')", &[]).await?;
                let timed_out = tokio::time::timeout(
                    Duration::from_millis(100),
                    conn.savepoint_context(Some("inner"), |c| async move {
                        c.execute("INSERT INTO t(name) VALUES('cancelled')", &[]).await?;
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, ScribeError>(())
                    }),
                )
                .await;
                assert!(timed_out.is_err());
                assert_eq!(conn.savepoints(), vec!["outer".to_string()]);

                // The name is free again on the writer too.
                conn.savepoint_context(Some("inner"), |c| async move {
                    c.execute("INSERT INTO t(name) VALUES('after')", &[]).await?;
                    Ok::<_, ScribeError>(())
                })
                .await?;
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();

        assert!(fx.conn.savepoints().is_empty());
        assert_eq!(
            names(&fx.conn).await,
            vec![values!["before"], values!["after"]]
        );
    }

    #[tokio::test]
    async fn dropped_read_write_context_is_rolled_back() {
        let fx = fixture().await;
        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            fx.conn.read_write_context(false, |cur| async move {
                cur.execute("INSERT INTO t(name) VALUES('cancelled')", &[]).await?;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ScribeError>(())
            }),
        )
        .await;
        assert!(timed_out.is_err());

        fx.conn
            .read_write_context(false, |cur| async move {
                cur.execute("INSERT INTO t(name) VALUES('kept')", &[]).await?;
                Ok::<_, ScribeError>(())
            })
            .await
            .unwrap();
        assert_eq!(names(&fx.conn).await, vec![values!["kept"]]);
    }

    #[tokio::test]
    async fn failed_local_open_leaves_writer_untouched() {
        let fx = fixture().await;
        let path = "/nonexistent/scribe/user.db";
        let options = ConnectionOptions::new(path, ConnectionKind::User, fx.addr.to_string());
        let err = Connection::open(options, &ProgressRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScribeError::Storage { .. }));

        let channel = WriterChannel::connect(fx.addr, 1 << 20).await.unwrap();
        let stub = WriterClient::unnamed(channel, DatabaseIdentity::new(path, ConnectionKind::User));
        let err = stub.execute("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.db_kind(), Some(ErrorKind::MemoryUsage));
    }
}
