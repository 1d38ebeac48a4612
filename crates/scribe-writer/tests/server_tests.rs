// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Writer server tests over a real loopback socket.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use scribe_config::ScribeConfig;
use scribe_core::{ConnectionKind, DatabaseIdentity, ErrorKind};
use scribe_wire::{Call, DbMethod, FramedChannel, Reply, framed, recv_frame, send_frame, values};
use scribe_writer::WriterServer;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), scribe_core::ScribeError>>,
    dir: tempfile::TempDir,
}

async fn start() -> Running {
    let mut config = ScribeConfig::default();
    config.writer.port = 0;
    let server = WriterServer::bind(config).await.expect("bind");
    let addr = server.local_addr().expect("addr");
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.run(cancel.clone()));
    Running {
        addr,
        cancel,
        handle,
        dir: tempfile::tempdir().expect("tempdir"),
    }
}

async fn connect(addr: SocketAddr) -> FramedChannel {
    framed(TcpStream::connect(addr).await.expect("connect"), 1 << 20)
}

async fn call(channel: &mut FramedChannel, call: Call) -> Reply {
    raw(channel, call.to_bytes().expect("encode")).await
}

async fn raw(channel: &mut FramedChannel, bytes: Vec<u8>) -> Reply {
    send_frame(channel, bytes).await.expect("send");
    let frame = recv_frame(channel).await.expect("recv").expect("frame");
    Reply::from_bytes(&frame).expect("reply")
}

impl Running {
    fn identity(&self) -> DatabaseIdentity {
        let path = self.dir.path().join("user.db").display().to_string();
        DatabaseIdentity::new(path, ConnectionKind::User)
    }
}

#[tokio::test]
async fn serves_calls_from_two_clients_on_one_connection() {
    let server = start().await;
    let id = server.identity();
    let mut a = connect(server.addr).await;
    let mut b = connect(server.addr).await;

    assert_eq!(call(&mut a, Call::new(id.clone(), DbMethod::Initialize)).await, Reply::Ack);
    assert_eq!(call(&mut b, Call::new(id.clone(), DbMethod::Initialize)).await, Reply::Ack);
    call(
        &mut a,
        Call::new(id.clone(), DbMethod::ExecuteScript).arg("CREATE TABLE t(name TEXT UNIQUE)"),
    )
    .await;

    let first = call(
        &mut a,
        Call::new(id.clone(), DbMethod::Execute).args(values!["INSERT INTO t VALUES(?)", values!["x"]]),
    )
    .await;
    assert_eq!(first, Reply::done(1, 1));

    let dup = call(
        &mut b,
        Call::new(id.clone(), DbMethod::Execute).args(values!["INSERT INTO t VALUES(?)", values!["x"]]),
    )
    .await;
    match dup {
        Reply::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::DbWrite);
            assert_eq!(message, "UNIQUE constraint failed: t.name");
        }
        other => panic!("expected constraint error, got {other:?}"),
    }

    server.cancel.cancel();
    server.handle.await.expect("join").expect("clean shutdown");
}

/// Mirrors the call record with an arbitrary payload for one argument.
#[derive(Serialize)]
struct ForgedCall {
    connection_kind: u8,
    db_path: String,
    method: u8,
    args: Vec<ForgedEnvelope>,
    kwargs: BTreeMap<String, ForgedEnvelope>,
}

#[derive(Serialize)]
struct ForgedEnvelope {
    tag: u8,
    data: Vec<u8>,
}

fn forged(method: u8, args: Vec<ForgedEnvelope>) -> Vec<u8> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(
        &ForgedCall {
            connection_kind: 1,
            db_path: "/nowhere.db".into(),
            method,
            args,
            kwargs: BTreeMap::new(),
        },
        &mut bytes,
    )
    .expect("serialize");
    bytes
}

#[tokio::test]
async fn malformed_frames_are_classified() {
    let server = start().await;
    let mut ch = connect(server.addr).await;

    let bad_float = forged(
        DbMethod::Execute.to_u8(),
        vec![ForgedEnvelope {
            tag: 4,
            data: b"not-a-float".to_vec(),
        }],
    );
    match raw(&mut ch, bad_float).await {
        Reply::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::Computation);
            assert!(message.contains("not-a-float"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let unknown_method = forged(200, vec![]);
    assert!(matches!(
        raw(&mut ch, unknown_method).await,
        Reply::Error { kind: ErrorKind::Programming, .. }
    ));

    let unknown_tag = forged(
        DbMethod::Execute.to_u8(),
        vec![ForgedEnvelope { tag: 0, data: vec![] }],
    );
    assert!(matches!(
        raw(&mut ch, unknown_tag).await,
        Reply::Error { kind: ErrorKind::Programming, .. }
    ));

    // The channel is still usable afterwards.
    let id = server.identity();
    assert_eq!(call(&mut ch, Call::new(id, DbMethod::Initialize)).await, Reply::Ack);
    server.cancel.cancel();
    server.handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn unopenable_path_is_host_system() {
    let server = start().await;
    let mut ch = connect(server.addr).await;
    let id = DatabaseIdentity::new("/definitely/not/here/x.db", ConnectionKind::Global);
    match call(&mut ch, Call::new(id, DbMethod::Initialize)).await {
        Reply::Error { kind, .. } => assert_eq!(kind, ErrorKind::HostSystem),
        other => panic!("unexpected {other:?}"),
    }
    server.cancel.cancel();
    server.handle.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn shutdown_closes_client_channels() {
    let server = start().await;
    let mut ch = connect(server.addr).await;
    let id = server.identity();
    assert_eq!(call(&mut ch, Call::new(id, DbMethod::Initialize)).await, Reply::Ack);

    server.cancel.cancel();
    server.handle.await.expect("join").expect("clean shutdown");

    let next = recv_frame(&mut ch).await;
    assert!(matches!(next, Ok(None) | Err(scribe_core::ScribeError::ChannelClosed)));
    assert!(TcpStream::connect(server.addr).await.is_err());
}
