// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the Scribe database layer.
//!
//! Faults raised inside the writer process cross the process boundary as an
//! [`ErrorKind`] plus a message and are rebuilt on the caller side as a
//! [`DbError`]. The native error is not carried across; only the kind and the
//! exact message text survive.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// Closed set of fault families that can cross the writer boundary.
///
/// Classification on the writer side checks the families in declaration
/// order and the first match wins.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum ErrorKind {
    /// The engine rejected the statement: constraint, malformed SQL, wrong
    /// bind arity, busy/locked, interface mismatch.
    DbWrite,
    /// Numeric fault: division by zero, overflow, text that is not a number.
    Computation,
    /// Caller defect: bad argument type or count, unsupported operation.
    Programming,
    /// OS level fault: interrupted call, reset, permission, timeout.
    HostSystem,
    /// Resource or index fault: out of range, missing key, OOM, exhausted
    /// iteration.
    MemoryUsage,
    /// Anything that matched none of the above.
    Unknown,
}

impl ErrorKind {
    /// Wire tag for this kind.
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::DbWrite => 1,
            Self::Computation => 2,
            Self::Programming => 3,
            Self::HostSystem => 4,
            Self::MemoryUsage => 5,
            Self::Unknown => 6,
        }
    }

    /// Parse a wire tag. Unknown tags map to `None`.
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::DbWrite),
            2 => Some(Self::Computation),
            3 => Some(Self::Programming),
            4 => Some(Self::HostSystem),
            5 => Some(Self::MemoryUsage),
            6 => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Message prefix the writer puts on parameter-binding interface faults.
///
/// These are the only faults the client stub retries, exactly once.
pub const INTERFACE_FAULT_PREFIX: &str = "interface error: ";

/// A fault raised by the writer process, rebuilt in the caller's process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("database write error: {0}")]
    DbWrite(String),

    #[error("computation error: {0}")]
    Computation(String),

    #[error("programming error: {0}")]
    Programming(String),

    #[error("host system error: {0}")]
    HostSystem(String),

    #[error("memory usage error: {0}")]
    MemoryUsage(String),

    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl DbError {
    /// Rebuild the error for `kind` carrying `message` verbatim.
    pub fn from_parts(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::DbWrite => Self::DbWrite(message),
            ErrorKind::Computation => Self::Computation(message),
            ErrorKind::Programming => Self::Programming(message),
            ErrorKind::HostSystem => Self::HostSystem(message),
            ErrorKind::MemoryUsage => Self::MemoryUsage(message),
            ErrorKind::Unknown => Self::Unknown(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DbWrite(_) => ErrorKind::DbWrite,
            Self::Computation(_) => ErrorKind::Computation,
            Self::Programming(_) => ErrorKind::Programming,
            Self::HostSystem(_) => ErrorKind::HostSystem,
            Self::MemoryUsage(_) => ErrorKind::MemoryUsage,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether this is a transient binding fault worth one more attempt.
    pub fn is_interface_fault(&self) -> bool {
        matches!(self, Self::DbWrite(m) if m.starts_with(INTERFACE_FAULT_PREFIX))
    }

    /// The message exactly as the writer produced it.
    pub fn message(&self) -> &str {
        match self {
            Self::DbWrite(m)
            | Self::Computation(m)
            | Self::Programming(m)
            | Self::HostSystem(m)
            | Self::MemoryUsage(m)
            | Self::Unknown(m) => m,
        }
    }
}

/// Misuse of the savepoint stack or write contexts.
///
/// Always raised locally; never sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("context error: {0}")]
pub struct ContextError(pub String);

/// The primary error type used across the Scribe crates.
#[derive(Debug, Error)]
pub enum ScribeError {
    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A fault marshaled back from the writer process.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Savepoint or context misuse by the caller.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// A value or envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The channel to the writer failed or was closed.
    #[error("writer channel error: {message}")]
    Transport {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The writer closed the channel (normally during its shutdown).
    #[error("writer channel closed")]
    ChannelClosed,

    /// A local engine fault (read cursor, local write transaction).
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The on-disk schema does not match the expected one.
    #[error("schema error: {0}")]
    Schema(String),

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ScribeError {
    /// Whether this error means the writer hung up on us.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }

    /// The writer-side kind, if this error came across the boundary.
    pub fn db_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Db(e) => Some(e.kind()),
            _ => None,
        }
    }
}
