// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Loopback endpoint of the writer process.
//!
//! Each accepted client gets a reader task that decodes frames and forwards
//! calls to the single [`Executor`] thread, then writes back the reply. After
//! the cancellation token fires the server stops accepting, lets in-flight
//! calls finish and sends no further replies.

use std::net::SocketAddr;

use scribe_config::ScribeConfig;
use scribe_core::ScribeError;
use scribe_wire::{Call, Reply, framed, recv_frame, send_frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::executor::{CallRecord, Executor, Job};
use crate::fault::{WriterFault, classify};

/// Calls queued for the executor before client tasks wait.
const JOB_QUEUE_DEPTH: usize = 64;

pub struct WriterServer {
    listener: TcpListener,
    config: ScribeConfig,
    recorder: Option<mpsc::UnboundedSender<CallRecord>>,
}

impl WriterServer {
    /// Bind the configured endpoint. Port 0 picks a free port (tests).
    pub async fn bind(config: ScribeConfig) -> Result<Self, ScribeError> {
        let addr = config.writer.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ScribeError::Transport {
                message: format!("failed to bind writer to {addr}: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self {
            listener,
            config,
            recorder: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ScribeError> {
        self.listener
            .local_addr()
            .map_err(|e| ScribeError::Transport {
                message: format!("writer has no local address: {e}"),
                source: Some(Box::new(e)),
            })
    }

    /// Stream a [`CallRecord`] for every call the executor takes up, in
    /// execution order.
    pub fn record_calls(&mut self) -> mpsc::UnboundedReceiver<CallRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.recorder = Some(tx);
        rx
    }

    /// Serve until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ScribeError> {
        let addr = self.local_addr()?;
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(JOB_QUEUE_DEPTH);

        let mut executor = Executor::new(self.config.storage.clone());
        if let Some(recorder) = self.recorder {
            executor = executor.with_recorder(recorder);
        }
        let executor_thread = std::thread::Builder::new()
            .name("scribe-executor".into())
            .spawn(move || executor.run(jobs_rx))
            .map_err(|e| ScribeError::Internal(format!("failed to start executor: {e}")))?;

        info!(%addr, "writer listening");
        let clients = TaskTracker::new();
        let max_frame = self.config.writer.max_frame_bytes;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        clients.spawn(serve_client(
                            stream,
                            peer,
                            jobs_tx.clone(),
                            cancel.clone(),
                            max_frame,
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }

        info!(clients = clients.len(), "writer shutting down");
        drop(self.listener);
        clients.close();
        clients.wait().await;
        drop(jobs_tx);

        tokio::task::spawn_blocking(move || executor_thread.join())
            .await
            .map_err(|e| ScribeError::Internal(format!("executor join failed: {e}")))?
            .map_err(|_| ScribeError::Internal("executor thread panicked".into()))?;
        info!("writer stopped");
        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    jobs: mpsc::Sender<Job>,
    cancel: CancellationToken,
    max_frame: usize,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not disable nagle");
    }
    let mut channel = framed(stream, max_frame);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = recv_frame(&mut channel) => frame,
        };
        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(%peer, "client disconnected");
                break;
            }
            Err(e) => {
                warn!(%peer, error = %e, "read failed, dropping client");
                break;
            }
        };

        let reply = match Call::from_bytes(&bytes) {
            Ok(call) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if jobs.send(Job { call, reply: reply_tx }).await.is_err() {
                    break;
                }
                match reply_rx.await {
                    Ok(reply) => reply,
                    Err(_) => break,
                }
            }
            Err(err) => {
                let (kind, message) = classify(&WriterFault::Codec(err));
                Reply::Error { kind, message }
            }
        };

        if cancel.is_cancelled() {
            debug!(%peer, "shutting down, reply withheld");
            break;
        }

        let payload = match reply.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(%peer, error = %e, "failed to encode reply");
                break;
            }
        };
        if let Err(e) = send_frame(&mut channel, payload).await {
            warn!(%peer, error = %e, "write failed, dropping client");
            break;
        }
    }
}
