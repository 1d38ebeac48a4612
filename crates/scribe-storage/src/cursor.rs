// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local cursors and the write surface shared with the writer stub.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use scribe_core::ScribeError;
use scribe_wire::Value;
use scribe_wire::sql::{params, row_values};
use tracing::trace;

use crate::progress::ProgressGate;

/// Statements a write or savepoint body can issue.
///
/// Implemented by the writer stub (normal writes) and by [`DbCursor`] (the
/// exclusive read-write path that bypasses the writer).
#[async_trait]
pub trait WriteTarget: Send + Sync {
    async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<(), ScribeError>;

    async fn executemany(&self, sql: &str, rows: &[Vec<Value>]) -> Result<(), ScribeError>;

    async fn executescript(&self, script: &str) -> Result<(), ScribeError>;

    async fn commit(&self) -> Result<(), ScribeError>;

    async fn rollback(&self) -> Result<(), ScribeError>;

    /// Toggle foreign key enforcement. The pragma only takes effect outside a
    /// transaction, so it runs as a script (which commits first) and can
    /// reopen a transaction afterwards.
    async fn switch_foreign_keys(
        &self,
        enabled: bool,
        restart_transaction: bool,
    ) -> Result<(), ScribeError> {
        let state = if enabled { "ON" } else { "OFF" };
        self.executescript(&format!("PRAGMA foreign_keys={state};"))
            .await?;
        if restart_transaction {
            self.execute("BEGIN TRANSACTION", &[]).await?;
        }
        Ok(())
    }

    fn lastrowid(&self) -> i64;

    fn rowcount(&self) -> i64;
}

pub(crate) fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> ScribeError {
    ScribeError::Storage {
        source: Box::new(e),
    }
}

/// A cursor on the connection's private local engine handle.
///
/// Rows produced by the last `execute` are buffered and handed out by the
/// `fetch_*` methods. Each statement ends with a yield point.
#[derive(Clone)]
pub struct DbCursor {
    inner: Arc<CursorInner>,
}

struct CursorInner {
    conn: tokio_rusqlite::Connection,
    gate: Arc<ProgressGate>,
    rows: Mutex<VecDeque<Vec<Value>>>,
    lastrowid: AtomicI64,
    rowcount: AtomicI64,
}

struct Executed {
    rows: Vec<Vec<Value>>,
    lastrowid: i64,
    rowcount: i64,
}

impl DbCursor {
    pub(crate) fn new(conn: tokio_rusqlite::Connection, gate: Arc<ProgressGate>) -> Self {
        Self {
            inner: Arc::new(CursorInner {
                conn,
                gate,
                rows: Mutex::new(VecDeque::new()),
                lastrowid: AtomicI64::new(0),
                rowcount: AtomicI64::new(-1),
            }),
        }
    }

    /// Run one statement and buffer its rows. Returns `self` for chaining
    /// into a fetch.
    pub async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<&Self, ScribeError> {
        trace!(sql, "local execute");
        let sql = sql.to_string();
        let bindings = bindings.to_vec();
        let executed = self
            .inner
            .conn
            .call(move |conn| -> Result<Executed, rusqlite::Error> {
                let mut stmt = conn.prepare(&sql)?;
                let readonly = stmt.readonly();
                let mut rows = stmt.query(params(&bindings))?;
                let mut buffered = Vec::new();
                while let Some(row) = rows.next()? {
                    buffered.push(row_values(row)?);
                }
                drop(rows);
                Ok(Executed {
                    rows: buffered,
                    lastrowid: conn.last_insert_rowid(),
                    rowcount: if readonly { -1 } else { conn.changes() as i64 },
                })
            })
            .await
            .map_err(map_tr_err)?;

        self.store(executed);
        self.inner.gate.yield_point().await;
        Ok(self)
    }

    pub async fn executemany(&self, sql: &str, rows: &[Vec<Value>]) -> Result<&Self, ScribeError> {
        trace!(sql, rows = rows.len(), "local executemany");
        let sql = sql.to_string();
        let batches = rows.to_vec();
        let executed = self
            .inner
            .conn
            .call(move |conn| -> Result<Executed, rusqlite::Error> {
                let mut stmt = conn.prepare(&sql)?;
                let mut rowcount: i64 = 0;
                for bindings in &batches {
                    rowcount += stmt.execute(params(bindings))? as i64;
                }
                Ok(Executed {
                    rows: Vec::new(),
                    lastrowid: conn.last_insert_rowid(),
                    rowcount,
                })
            })
            .await
            .map_err(map_tr_err)?;

        self.store(executed);
        self.inner.gate.yield_point().await;
        Ok(self)
    }

    /// Run a script, committing any open transaction first.
    pub async fn executescript(&self, script: &str) -> Result<&Self, ScribeError> {
        trace!(script, "local executescript");
        let script = script.to_string();
        self.inner
            .conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                if !conn.is_autocommit() {
                    conn.execute_batch("COMMIT")?;
                }
                conn.execute_batch(&script)
            })
            .await
            .map_err(map_tr_err)?;

        self.buffer().clear();
        self.inner.gate.yield_point().await;
        Ok(self)
    }

    pub async fn commit(&self) -> Result<(), ScribeError> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(&self) -> Result<(), ScribeError> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&self, verb: &'static str) -> Result<(), ScribeError> {
        self.inner
            .conn
            .call(move |conn| -> Result<(), rusqlite::Error> {
                if !conn.is_autocommit() {
                    conn.execute_batch(verb)?;
                }
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Next buffered row, `None` when exhausted.
    pub fn fetch_one(&self) -> Option<Vec<Value>> {
        self.buffer().pop_front()
    }

    /// Up to `size` buffered rows.
    pub fn fetch_many(&self, size: usize) -> Vec<Vec<Value>> {
        let mut rows = self.buffer();
        let take = size.min(rows.len());
        rows.drain(..take).collect()
    }

    /// Every remaining buffered row.
    pub fn fetch_all(&self) -> Vec<Vec<Value>> {
        self.buffer().drain(..).collect()
    }

    pub fn lastrowid(&self) -> i64 {
        self.inner.lastrowid.load(Ordering::Acquire)
    }

    /// Rows changed by the last statement, `-1` after a read.
    pub fn rowcount(&self) -> i64 {
        self.inner.rowcount.load(Ordering::Acquire)
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<Value>>> {
        self.inner.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, executed: Executed) {
        *self.buffer() = executed.rows.into();
        self.inner
            .lastrowid
            .store(executed.lastrowid, Ordering::Release);
        self.inner
            .rowcount
            .store(executed.rowcount, Ordering::Release);
    }
}

#[async_trait]
impl WriteTarget for DbCursor {
    async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<(), ScribeError> {
        DbCursor::execute(self, sql, bindings).await.map(|_| ())
    }

    async fn executemany(&self, sql: &str, rows: &[Vec<Value>]) -> Result<(), ScribeError> {
        DbCursor::executemany(self, sql, rows).await.map(|_| ())
    }

    async fn executescript(&self, script: &str) -> Result<(), ScribeError> {
        DbCursor::executescript(self, script).await.map(|_| ())
    }

    async fn commit(&self) -> Result<(), ScribeError> {
        DbCursor::commit(self).await
    }

    async fn rollback(&self) -> Result<(), ScribeError> {
        DbCursor::rollback(self).await
    }

    fn lastrowid(&self) -> i64 {
        DbCursor::lastrowid(self)
    }

    fn rowcount(&self) -> i64 {
        DbCursor::rowcount(self)
    }
}

impl std::fmt::Debug for DbCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCursor")
            .field("buffered", &self.buffer().len())
            .field("lastrowid", &self.lastrowid())
            .field("rowcount", &self.rowcount())
            .finish()
    }
}
