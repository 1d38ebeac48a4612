// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Length-delimited frames over the loopback stream.

use std::io;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use scribe_core::ScribeError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A framed writer channel.
pub type FramedChannel<S = TcpStream> = Framed<S, LengthDelimitedCodec>;

/// Wrap a stream with 4-byte big-endian length prefixes.
pub fn framed<S>(stream: S, max_frame_bytes: usize) -> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_framed(stream)
}

/// Send one frame. An empty payload is a valid frame.
pub async fn send_frame<S>(channel: &mut FramedChannel<S>, payload: Vec<u8>) -> Result<(), ScribeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel
        .send(Bytes::from(payload))
        .await
        .map_err(transport_error)
}

/// Queue one frame in the write buffer without flushing it.
///
/// Once this returns the whole frame is owned by the channel; a later
/// [`flush_frames`] or [`send_frame`] writes it out even if the caller that
/// queued it has gone away.
pub async fn feed_frame<S>(channel: &mut FramedChannel<S>, payload: Vec<u8>) -> Result<(), ScribeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    channel
        .feed(Bytes::from(payload))
        .await
        .map_err(transport_error)
}

/// Write out every queued frame.
pub async fn flush_frames<S>(channel: &mut FramedChannel<S>) -> Result<(), ScribeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    SinkExt::<Bytes>::flush(channel).await.map_err(transport_error)
}

/// Receive one frame, `None` once the peer has closed the stream.
pub async fn recv_frame<S>(channel: &mut FramedChannel<S>) -> Result<Option<Bytes>, ScribeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match channel.next().await {
        Some(Ok(frame)) => Ok(Some(frame.freeze())),
        Some(Err(err)) => Err(transport_error(err)),
        None => Ok(None),
    }
}

/// Map stream I/O failures; a peer hanging up becomes `ChannelClosed`.
pub fn transport_error(err: io::Error) -> ScribeError {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ScribeError::ChannelClosed,
        _ => ScribeError::Transport {
            message: err.to_string(),
            source: Some(Box::new(err)),
        },
    }
}
