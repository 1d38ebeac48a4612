// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The sequential executor that owns every real connection.
//!
//! One [`Executor`] runs on a dedicated thread. It receives decoded calls one
//! at a time, performs exactly one operation per call and produces exactly one
//! reply, so writes to any database are totally ordered.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OpenFlags};
use scribe_config::StorageConfig;
use scribe_core::DatabaseIdentity;
use scribe_wire::sql::params;
use scribe_wire::{Call, DbMethod, Reply, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::fault::{WriterFault, classify};

/// A call waiting for the executor, with the slot its reply goes to.
pub struct Job {
    pub call: Call,
    pub reply: oneshot::Sender<Reply>,
}

/// One connected database and the cursor names opened against it.
struct Slot {
    conn: Connection,
    cursors: HashSet<String>,
}

/// One call as the executor took it up. `seq` is the execution order.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub seq: u64,
    pub identity: DatabaseIdentity,
    pub method: DbMethod,
    pub cursor_name: Option<String>,
    /// Statement or script text, for calls that carry one.
    pub statement: Option<String>,
}

pub struct Executor {
    slots: HashMap<DatabaseIdentity, Slot>,
    storage: StorageConfig,
    sequence: u64,
    recorder: Option<mpsc::UnboundedSender<CallRecord>>,
}

impl Executor {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            slots: HashMap::new(),
            storage,
            sequence: 0,
            recorder: None,
        }
    }

    /// Report every call to `recorder` before it runs.
    pub fn with_recorder(mut self, recorder: mpsc::UnboundedSender<CallRecord>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Drain `jobs` until every sender is gone, then close all connections.
    pub fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.blocking_recv() {
            let reply = self.handle(job.call);
            // The client task may have gone away during shutdown.
            let _ = job.reply.send(reply);
        }
        info!(open = self.slots.len(), calls = self.sequence, "executor stopping");
        self.slots.clear();
    }

    /// Perform one call and build its reply.
    pub fn handle(&mut self, call: Call) -> Reply {
        self.sequence += 1;
        let seq = self.sequence;
        let method = call.method;
        trace!(seq, %method, identity = %call.identity, cursor = ?call.cursor_name, "call");
        if let Some(recorder) = &self.recorder {
            let statement = match call.args.first() {
                Some(Value::Text(text)) => Some(text.clone()),
                _ => None,
            };
            // A dropped receiver only means nobody is watching.
            let _ = recorder.send(CallRecord {
                seq,
                identity: call.identity.clone(),
                method,
                cursor_name: call.cursor_name.clone(),
                statement,
            });
        }

        match self.dispatch(call) {
            Ok(reply) => reply,
            Err(fault) => {
                let (kind, message) = classify(&fault);
                debug!(seq, %method, %kind, %message, "call failed");
                Reply::Error { kind, message }
            }
        }
    }

    fn dispatch(&mut self, call: Call) -> Result<Reply, WriterFault> {
        match call.method {
            DbMethod::Initialize => self.initialize(&call),
            DbMethod::Execute => self.execute(&call),
            DbMethod::ExecuteMany => self.execute_many(&call),
            DbMethod::ExecuteScript => self.execute_script(&call),
            DbMethod::Commit => self.finish_transaction(&call, "COMMIT"),
            DbMethod::Rollback => self.finish_transaction(&call, "ROLLBACK"),
            DbMethod::OpenCursor => self.open_cursor(&call),
            DbMethod::CloseCursor => self.close_cursor(&call),
            DbMethod::Close => self.close(&call),
        }
    }

    fn initialize(&mut self, call: &Call) -> Result<Reply, WriterFault> {
        if self.slots.contains_key(&call.identity) {
            debug!(identity = %call.identity, "already connected");
            return Ok(Reply::Ack);
        }

        let path = match call.kwargs.get("database") {
            Some(value) => text(value, "database")?,
            None => call.identity.path.as_str(),
        };
        let password = match call.kwargs.get("password") {
            Some(Value::Null) | None => None,
            Some(value) => Some(text(value, "password")?),
        };

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        if let Some(password) = password {
            if call.identity.kind.is_encrypted() {
                conn.pragma_update(None, "key", password)?;
            } else {
                warn!(identity = %call.identity, "ignoring key for an unencrypted database");
            }
        }
        // Touch the first page so a wrong key fails here, not on first use.
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))?;
        conn.busy_timeout(self.storage.busy_timeout())?;
        if self.storage.wal_mode {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(identity = %call.identity, %mode, "journal mode set");
        }

        info!(identity = %call.identity, "database connected");
        self.slots.insert(
            call.identity.clone(),
            Slot {
                conn,
                cursors: HashSet::new(),
            },
        );
        Ok(Reply::Ack)
    }

    fn execute(&mut self, call: &Call) -> Result<Reply, WriterFault> {
        let statement = statement_arg(call)?;
        let bindings = bindings_arg(call, 1)?;
        let conn = &self.slot(call)?.conn;

        let mut stmt = conn.prepare(statement)?;
        let readonly = stmt.readonly();
        let mut rows = stmt.query(params(bindings))?;
        while rows.next()?.is_some() {}
        drop(rows);

        let rowcount = if readonly { -1 } else { conn.changes() as i64 };
        Ok(Reply::done(conn.last_insert_rowid(), rowcount))
    }

    fn execute_many(&mut self, call: &Call) -> Result<Reply, WriterFault> {
        let statement = statement_arg(call)?;
        let batches = bindings_arg(call, 1)?;
        let conn = &self.slot(call)?.conn;

        let mut stmt = conn.prepare(statement)?;
        let mut rowcount: i64 = 0;
        for batch in batches {
            let Value::Array(bindings) = batch else {
                return Err(WriterFault::Argument(
                    "EXECUTE_MANY expects a sequence of binding sequences".into(),
                ));
            };
            rowcount += stmt.execute(params(bindings))? as i64;
        }
        Ok(Reply::done(conn.last_insert_rowid(), rowcount))
    }

    fn execute_script(&mut self, call: &Call) -> Result<Reply, WriterFault> {
        let script = statement_arg(call)?;
        let conn = &self.slot(call)?.conn;

        if !conn.is_autocommit() {
            conn.execute_batch("COMMIT")?;
        }
        conn.execute_batch(script)?;
        Ok(Reply::done(conn.last_insert_rowid(), -1))
    }

    fn finish_transaction(&mut self, call: &Call, verb: &str) -> Result<Reply, WriterFault> {
        let conn = &self.slot(call)?.conn;
        if !conn.is_autocommit() {
            conn.execute_batch(verb)?;
        }
        Ok(Reply::Done {
            lastrowid: None,
            rowcount: None,
        })
    }

    fn open_cursor(&mut self, call: &Call) -> Result<Reply, WriterFault> {
        let name = call
            .cursor_name
            .as_deref()
            .ok_or_else(|| WriterFault::Argument("OPEN_CURSOR needs a cursor name".into()))?;
        let slot = self
            .slots
            .get_mut(&call.identity)
            .ok_or_else(|| WriterFault::NotFound(format!("database {}", call.identity)))?;
        if !slot.cursors.insert(name.to_string()) {
            return Err(WriterFault::DuplicateCursor(name.to_string()));
        }
        Ok(Reply::Ack)
    }

    fn close_cursor(&mut self, call: &Call) -> Result<Reply, WriterFault> {
        let Some(name) = call.cursor_name.as_deref() else {
            return Ok(Reply::Ack);
        };
        let slot = self
            .slots
            .get_mut(&call.identity)
            .ok_or_else(|| WriterFault::NotFound(format!("database {}", call.identity)))?;
        if !slot.cursors.remove(name) {
            return Err(WriterFault::NotFound(format!("cursor `{name}`")));
        }
        Ok(Reply::Ack)
    }

    fn close(&mut self, call: &Call) -> Result<Reply, WriterFault> {
        let slot = self
            .slots
            .remove(&call.identity)
            .ok_or_else(|| WriterFault::NotFound(format!("database {}", call.identity)))?;
        if !slot.cursors.is_empty() {
            debug!(identity = %call.identity, cursors = slot.cursors.len(), "dropping open cursors");
        }
        slot.conn.close().map_err(|(_, err)| err)?;
        info!(identity = %call.identity, "database closed");
        Ok(Reply::Done {
            lastrowid: None,
            rowcount: None,
        })
    }

    /// The connection for the call's identity, checking its cursor exists.
    fn slot(&self, call: &Call) -> Result<&Slot, WriterFault> {
        let slot = self
            .slots
            .get(&call.identity)
            .ok_or_else(|| WriterFault::NotFound(format!("database {}", call.identity)))?;
        if let Some(name) = call.cursor_name.as_deref()
            && !slot.cursors.contains(name)
        {
            return Err(WriterFault::NotFound(format!("cursor `{name}`")));
        }
        Ok(slot)
    }
}

fn text<'a>(value: &'a Value, what: &str) -> Result<&'a str, WriterFault> {
    match value {
        Value::Text(s) => Ok(s),
        other => Err(WriterFault::Argument(format!(
            "{what} must be a string, got {other:?}"
        ))),
    }
}

fn statement_arg(call: &Call) -> Result<&str, WriterFault> {
    let first = call.args.first().ok_or_else(|| {
        WriterFault::Argument(format!("{} needs a statement argument", call.method))
    })?;
    text(first, "statement")
}

/// The binding sequence at `index`; absent means no bindings.
fn bindings_arg(call: &Call, index: usize) -> Result<&[Value], WriterFault> {
    if call.args.len() > index + 1 {
        return Err(WriterFault::Argument(format!(
            "{} takes at most {} arguments, got {}",
            call.method,
            index + 1,
            call.args.len()
        )));
    }
    match call.args.get(index) {
        None => Ok(&[]),
        Some(Value::Array(values)) => Ok(values),
        Some(other) => Err(WriterFault::Argument(format!(
            "bindings must be a sequence, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use scribe_core::{ConnectionKind, ErrorKind};
    use scribe_wire::values;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: Executor,
        identity: DatabaseIdentity,
    }

    fn fixture(kind: ConnectionKind) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db").display().to_string();
        let identity = DatabaseIdentity::new(path, kind);
        let mut executor = Executor::new(StorageConfig::default());
        let reply = executor.handle(
            Call::new(identity.clone(), DbMethod::Initialize).kwarg("password", "123"),
        );
        assert_eq!(reply, Reply::Ack);
        Fixture {
            _dir: dir,
            executor,
            identity,
        }
    }

    impl Fixture {
        fn run(&mut self, method: DbMethod, args: Vec<Value>) -> Reply {
            self.executor
                .handle(Call::new(self.identity.clone(), method).args(args))
        }

        fn count(&self) -> i64 {
            self.executor.slots[&self.identity]
                .conn
                .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
                .unwrap()
        }
    }

    fn error_kind(reply: &Reply) -> ErrorKind {
        match reply {
            Reply::Error { kind, .. } => *kind,
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[test]
    fn execute_reports_lastrowid_and_rowcount() {
        let mut fx = fixture(ConnectionKind::User);
        fx.run(
            DbMethod::ExecuteScript,
            values!["CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT UNIQUE)"],
        );
        let reply = fx.run(
            DbMethod::Execute,
            values!["INSERT INTO t(name) VALUES(?)", values!["a"]],
        );
        assert_eq!(reply, Reply::done(1, 1));
        assert_eq!(fx.count(), 1);
    }

    #[test]
    fn execute_many_sums_changes() {
        let mut fx = fixture(ConnectionKind::Global);
        fx.run(DbMethod::ExecuteScript, values!["CREATE TABLE t(name TEXT)"]);
        let reply = fx.run(
            DbMethod::ExecuteMany,
            values![
                "INSERT INTO t(name) VALUES(?)",
                values![values!["a"], values!["b"], values!["c"]]
            ],
        );
        assert_eq!(reply, Reply::done(3, 3));
    }

    #[test]
    fn rollback_undoes_open_transaction() {
        let mut fx = fixture(ConnectionKind::User);
        fx.run(DbMethod::ExecuteScript, values!["CREATE TABLE t(name TEXT)"]);
        fx.run(DbMethod::Execute, values!["BEGIN TRANSACTION"]);
        fx.run(DbMethod::Execute, values!["INSERT INTO t VALUES('x')"]);
        fx.run(DbMethod::Rollback, vec![]);
        assert_eq!(fx.count(), 0);
        // Nothing open: rollback is a no-op rather than an error.
        assert!(matches!(fx.run(DbMethod::Rollback, vec![]), Reply::Done { .. }));
    }

    #[test]
    fn execute_script_commits_pending_work_first() {
        let mut fx = fixture(ConnectionKind::User);
        fx.run(DbMethod::ExecuteScript, values!["CREATE TABLE t(name TEXT)"]);
        fx.run(DbMethod::Execute, values!["BEGIN TRANSACTION"]);
        fx.run(DbMethod::Execute, values!["INSERT INTO t VALUES('x')"]);
        fx.run(DbMethod::ExecuteScript, values!["PRAGMA foreign_keys=ON;"]);
        fx.run(DbMethod::Rollback, vec![]);
        assert_eq!(fx.count(), 1);
    }

    #[test]
    fn reinitialize_is_a_no_op() {
        let mut fx = fixture(ConnectionKind::User);
        fx.run(DbMethod::ExecuteScript, values!["CREATE TABLE t(name TEXT)"]);
        let again = fx.executor.handle(Call::new(fx.identity.clone(), DbMethod::Initialize));
        assert_eq!(again, Reply::Ack);
        assert_eq!(fx.count(), 0);
    }

    #[test]
    fn cursor_lifecycle() {
        let mut fx = fixture(ConnectionKind::User);
        let open = |fx: &mut Fixture, method| {
            fx.executor
                .handle(Call::new(fx.identity.clone(), method).cursor(Some("sp1")))
        };
        assert_eq!(open(&mut fx, DbMethod::OpenCursor), Reply::Ack);
        assert_eq!(
            error_kind(&open(&mut fx, DbMethod::OpenCursor)),
            ErrorKind::Programming
        );
        assert_eq!(open(&mut fx, DbMethod::CloseCursor), Reply::Ack);
        assert_eq!(
            error_kind(&open(&mut fx, DbMethod::CloseCursor)),
            ErrorKind::MemoryUsage
        );
        let reply = fx.executor.handle(
            Call::new(fx.identity.clone(), DbMethod::Execute)
                .cursor(Some("sp1"))
                .arg("SELECT 1"),
        );
        assert_eq!(error_kind(&reply), ErrorKind::MemoryUsage);
    }

    #[test]
    fn close_forgets_the_identity() {
        let mut fx = fixture(ConnectionKind::Transient);
        assert!(matches!(fx.run(DbMethod::Close, vec![]), Reply::Done { .. }));
        assert_eq!(
            error_kind(&fx.run(DbMethod::Execute, values!["SELECT 1"])),
            ErrorKind::MemoryUsage
        );
    }

    #[test]
    fn bad_arguments_are_programming_errors() {
        let mut fx = fixture(ConnectionKind::User);
        assert_eq!(error_kind(&fx.run(DbMethod::Execute, vec![])), ErrorKind::Programming);
        assert_eq!(
            error_kind(&fx.run(DbMethod::Execute, values!["SELECT ?", 1_i64])),
            ErrorKind::Programming
        );
    }

    #[test]
    fn wrong_bind_arity_is_db_write() {
        let mut fx = fixture(ConnectionKind::User);
        let reply = fx.run(DbMethod::Execute, values!["SELECT ?", values![1_i64, 2_i64]]);
        assert_eq!(error_kind(&reply), ErrorKind::DbWrite);
    }

    #[test]
    fn recorder_sees_calls_in_execution_order() {
        let mut fx = fixture(ConnectionKind::User);
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.executor = fx.executor.with_recorder(tx);

        fx.run(DbMethod::ExecuteScript, values!["CREATE TABLE t(x)"]);
        fx.executor
            .handle(Call::new(fx.identity.clone(), DbMethod::OpenCursor).cursor(Some("c1")));
        fx.run(DbMethod::Commit, vec![]);

        let records: Vec<CallRecord> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(records.len(), 3);
        assert!(records.windows(2).all(|w| w[1].seq == w[0].seq + 1));
        assert_eq!(records[0].statement.as_deref(), Some("CREATE TABLE t(x)"));
        assert_eq!(records[1].method, DbMethod::OpenCursor);
        assert_eq!(records[1].cursor_name.as_deref(), Some("c1"));
        assert_eq!(records[2].statement, None);
    }
}
