// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Everything that travels between an application connection and the writer
//! process: tagged values, call and reply envelopes, and the frame transport.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod sql;

pub use codec::{Envelope, Value, decode, encode};
pub use envelope::{Call, DbMethod, Reply};
pub use error::CodecError;
pub use frame::{FramedChannel, feed_frame, flush_frames, framed, recv_frame, send_frame};
