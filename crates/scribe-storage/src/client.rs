// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process stub for the writer.
//!
//! A [`WriterClient`] turns method calls into [`Call`]s for one database
//! identity and, optionally, one named server-side cursor. Every call waits
//! for its reply; faults come back as [`DbError`] with the writer's message
//! unchanged.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use async_trait::async_trait;
use scribe_core::{DatabaseIdentity, DbError, ScribeError};
use scribe_wire::frame::transport_error;
use scribe_wire::{
    Call, DbMethod, FramedChannel, Reply, Value, feed_frame, flush_frames, framed, recv_frame,
};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::cursor::WriteTarget;

/// The request/reply stream to one writer, shared by all stubs of a
/// connection. One request is in flight at a time.
pub struct WriterChannel {
    stream: Mutex<ChannelStream>,
    /// Calls left behind by abandoned contexts, sent ahead of the next
    /// request.
    deferred: std::sync::Mutex<VecDeque<Call>>,
    /// Set once the writer hangs up. Later calls fail fast.
    closed: AtomicBool,
    addr: SocketAddr,
}

struct ChannelStream {
    framed: FramedChannel,
    /// Replies still owed to requests whose caller went away.
    unanswered: usize,
}

impl ChannelStream {
    /// Send one frame and read its reply.
    ///
    /// A frame that was queued but never answered is counted, and its reply
    /// is read and dropped before the next exchange, so a caller giving up
    /// halfway never leaves the stream out of step.
    async fn exchange(&mut self, payload: Vec<u8>) -> Result<Reply, ScribeError> {
        while self.unanswered > 0 {
            flush_frames(&mut self.framed).await?;
            recv_frame(&mut self.framed)
                .await?
                .ok_or(ScribeError::ChannelClosed)?;
            self.unanswered -= 1;
            trace!("discarded the reply of an abandoned request");
        }

        feed_frame(&mut self.framed, payload).await?;
        self.unanswered += 1;
        flush_frames(&mut self.framed).await?;
        let frame = recv_frame(&mut self.framed)
            .await?
            .ok_or(ScribeError::ChannelClosed)?;
        self.unanswered -= 1;
        Ok(Reply::from_bytes(&frame)?)
    }
}

impl WriterChannel {
    pub async fn connect<A>(addr: A, max_frame_bytes: usize) -> Result<Arc<Self>, ScribeError>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| ScribeError::Transport {
                message: format!("failed to connect to writer at {addr}: {e}"),
                source: Some(Box::new(e)),
            })?;
        stream.set_nodelay(true).map_err(transport_error)?;
        let addr = stream.peer_addr().map_err(transport_error)?;
        debug!(%addr, "connected to writer");
        Ok(Arc::new(Self {
            stream: Mutex::new(ChannelStream {
                framed: framed(stream, max_frame_bytes),
                unanswered: 0,
            }),
            deferred: std::sync::Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            addr,
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the writer has hung up on this channel.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send `call` and wait for its reply. Deferred calls go out first.
    pub async fn request(&self, call: &Call) -> Result<Reply, ScribeError> {
        let payload = call.to_bytes()?;
        let mut stream = self.stream.lock().await;
        self.send_deferred(&mut stream).await?;
        self.exchange(&mut stream, payload).await
    }

    /// Queue `calls` to run ahead of whatever this channel sends next.
    pub(crate) fn defer(&self, calls: impl IntoIterator<Item = Call>) {
        if self.is_closed() {
            return;
        }
        self.deferred_calls().extend(calls);
    }

    /// Send deferred calls now instead of waiting for the next request.
    pub(crate) async fn flush_deferred(&self) -> Result<(), ScribeError> {
        let mut stream = self.stream.lock().await;
        self.send_deferred(&mut stream).await
    }

    async fn exchange(
        &self,
        stream: &mut ChannelStream,
        payload: Vec<u8>,
    ) -> Result<Reply, ScribeError> {
        if self.is_closed() {
            return Err(ScribeError::ChannelClosed);
        }
        let reply = stream.exchange(payload).await;
        if matches!(reply, Err(ScribeError::ChannelClosed))
            && !self.closed.swap(true, Ordering::AcqRel)
        {
            debug!(addr = %self.addr, "writer hung up, channel abandoned");
            self.deferred_calls().clear();
        }
        reply
    }

    /// Replies to deferred calls are only logged. A call leaves the queue
    /// once its reply has been read.
    async fn send_deferred(&self, stream: &mut ChannelStream) -> Result<(), ScribeError> {
        loop {
            let Some(call) = self.deferred_calls().front().cloned() else {
                return Ok(());
            };
            match call.to_bytes() {
                Ok(payload) => match self.exchange(stream, payload).await? {
                    Reply::Error { kind, message } => {
                        debug!(method = %call.method, %kind, %message, "deferred call failed");
                    }
                    _ => trace!(method = %call.method, "deferred call done"),
                },
                Err(e) => warn!(method = %call.method, error = %e, "dropping deferred call"),
            }
            self.deferred_calls().pop_front();
        }
    }

    fn deferred_calls(&self) -> MutexGuard<'_, VecDeque<Call>> {
        self.deferred.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Stub for one identity and optional named cursor. Cheap to clone.
#[derive(Clone)]
pub struct WriterClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    channel: Arc<WriterChannel>,
    identity: DatabaseIdentity,
    cursor_name: Option<String>,
    lastrowid: AtomicI64,
    rowcount: AtomicI64,
}

impl WriterClient {
    fn new(channel: Arc<WriterChannel>, identity: DatabaseIdentity, cursor_name: Option<String>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                channel,
                identity,
                cursor_name,
                lastrowid: AtomicI64::new(0),
                rowcount: AtomicI64::new(0),
            }),
        }
    }

    /// A stub without a cursor of its own.
    pub fn unnamed(channel: Arc<WriterChannel>, identity: DatabaseIdentity) -> Self {
        Self::new(channel, identity, None)
    }

    /// A stub that first opens the server-side cursor `name`.
    pub async fn named(
        channel: Arc<WriterChannel>,
        identity: DatabaseIdentity,
        name: &str,
    ) -> Result<Self, ScribeError> {
        let client = Self::for_cursor(channel, identity, name);
        client.open_cursor().await?;
        Ok(client)
    }

    /// A stub for the server-side cursor `name`, not opened yet.
    pub(crate) fn for_cursor(
        channel: Arc<WriterChannel>,
        identity: DatabaseIdentity,
        name: &str,
    ) -> Self {
        Self::new(channel, identity, Some(name.to_string()))
    }

    pub(crate) async fn open_cursor(&self) -> Result<(), ScribeError> {
        debug!(cursor = ?self.cursor_name(), "opening cursor");
        self.send(self.call(DbMethod::OpenCursor)).await
    }

    /// Leave `unwind` and this stub's cursor close queued on the channel for
    /// a scope that ended without finishing.
    pub(crate) fn abandon(&self, mut unwind: Vec<Call>) {
        if self.cursor_name().is_some() {
            unwind.push(self.call(DbMethod::CloseCursor));
        }
        self.inner.channel.defer(unwind);
    }

    pub fn identity(&self) -> &DatabaseIdentity {
        &self.inner.identity
    }

    pub fn cursor_name(&self) -> Option<&str> {
        self.inner.cursor_name.as_deref()
    }

    fn call(&self, method: DbMethod) -> Call {
        Call::new(self.inner.identity.clone(), method).cursor(self.cursor_name())
    }

    async fn send(&self, call: Call) -> Result<(), ScribeError> {
        match self.inner.channel.request(&call).await? {
            Reply::Ack => Ok(()),
            Reply::Done {
                lastrowid,
                rowcount,
            } => {
                if let Some(id) = lastrowid {
                    self.inner.lastrowid.store(id, Ordering::Release);
                }
                if let Some(count) = rowcount {
                    self.inner.rowcount.store(count, Ordering::Release);
                }
                Ok(())
            }
            Reply::Error { kind, message } => Err(DbError::from_parts(kind, message).into()),
        }
    }

    /// Ask the writer to connect this identity. `password` keys encrypted
    /// databases.
    pub async fn initialize(&self, password: Option<&str>) -> Result<(), ScribeError> {
        debug!(identity = %self.inner.identity, "initialize");
        let mut call = Call::new(self.inner.identity.clone(), DbMethod::Initialize)
            .kwarg("database", self.inner.identity.path.as_str());
        if let Some(password) = password {
            call = call.kwarg("password", password);
        }
        self.send(call).await
    }

    /// Execute one statement. A parameter-binding interface fault is retried
    /// once with the identical statement.
    pub async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<(), ScribeError> {
        trace!(sql, "EXECUTE");
        let call = self
            .call(DbMethod::Execute)
            .arg(sql)
            .arg(Value::Array(bindings.to_vec()));
        match self.send(call.clone()).await {
            Err(ScribeError::Db(err)) if err.is_interface_fault() => {
                debug!(sql, error = %err, "interface fault, retrying once");
                self.send(call).await
            }
            other => other,
        }
    }

    pub async fn executemany(&self, sql: &str, rows: &[Vec<Value>]) -> Result<(), ScribeError> {
        trace!(sql, rows = rows.len(), "EXECUTEMANY");
        let rows = rows.iter().cloned().map(Value::Array).collect();
        self.send(self.call(DbMethod::ExecuteMany).arg(sql).arg(Value::Array(rows)))
            .await
    }

    /// Run a script. The writer commits any open transaction first.
    pub async fn executescript(&self, script: &str) -> Result<(), ScribeError> {
        trace!(script, "EXECUTESCRIPT");
        self.send(self.call(DbMethod::ExecuteScript).arg(script)).await
    }

    pub async fn commit(&self) -> Result<(), ScribeError> {
        self.send(self.call(DbMethod::Commit)).await
    }

    pub async fn rollback(&self) -> Result<(), ScribeError> {
        self.send(self.call(DbMethod::Rollback)).await
    }

    /// Close this stub's server-side cursor. A no-op for unnamed stubs.
    pub async fn close(&self) -> Result<(), ScribeError> {
        if let Some(name) = self.cursor_name() {
            debug!(cursor = name, "closing cursor");
        }
        self.send(self.call(DbMethod::CloseCursor)).await
    }

    /// Drop the writer's connection for this identity and all its cursors.
    pub async fn close_connection(&self) -> Result<(), ScribeError> {
        self.send(Call::new(self.inner.identity.clone(), DbMethod::Close))
            .await
    }

    pub fn lastrowid(&self) -> i64 {
        self.inner.lastrowid.load(Ordering::Acquire)
    }

    pub fn rowcount(&self) -> i64 {
        self.inner.rowcount.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WriteTarget for WriterClient {
    async fn execute(&self, sql: &str, bindings: &[Value]) -> Result<(), ScribeError> {
        WriterClient::execute(self, sql, bindings).await
    }

    async fn executemany(&self, sql: &str, rows: &[Vec<Value>]) -> Result<(), ScribeError> {
        WriterClient::executemany(self, sql, rows).await
    }

    async fn executescript(&self, script: &str) -> Result<(), ScribeError> {
        WriterClient::executescript(self, script).await
    }

    async fn commit(&self) -> Result<(), ScribeError> {
        WriterClient::commit(self).await
    }

    async fn rollback(&self) -> Result<(), ScribeError> {
        WriterClient::rollback(self).await
    }

    fn lastrowid(&self) -> i64 {
        WriterClient::lastrowid(self)
    }

    fn rowcount(&self) -> i64 {
        WriterClient::rowcount(self)
    }
}

impl fmt::Debug for WriterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterClient")
            .field("identity", &self.inner.identity)
            .field("cursor", &self.inner.cursor_name)
            .field("writer", &self.inner.channel.addr)
            .finish()
    }
}

/// Close a stub's cursor at the end of a scope, logging instead of failing.
pub(crate) async fn close_quietly(client: &WriterClient) {
    match client.close().await {
        Ok(()) => {}
        Err(e) if e.is_channel_closed() => debug!("writer gone while closing cursor"),
        Err(e) => warn!(cursor = ?client.cursor_name(), error = %e, "failed to close cursor"),
    }
}
