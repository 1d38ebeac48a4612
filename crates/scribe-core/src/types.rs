// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identity types shared by the application side and the writer process.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Which database a connection talks to.
///
/// The kind selects the engine variant (encrypted for `User` and `Transient`,
/// plain for `Global`) and the minimized schema checked at startup.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// The per-user encrypted database.
    User,
    /// Scratch database, encrypted, no schema check.
    Transient,
    /// The shared global database, unencrypted.
    Global,
}

impl ConnectionKind {
    /// Wire tag for this kind.
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::User => 1,
            Self::Transient => 2,
            Self::Global => 3,
        }
    }

    /// Parse a wire tag. `None` for unknown tags.
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::User),
            2 => Some(Self::Transient),
            3 => Some(Self::Global),
            _ => None,
        }
    }

    /// Whether the engine for this kind is opened through SQLCipher.
    pub const fn is_encrypted(self) -> bool {
        !matches!(self, Self::Global)
    }
}

/// The `(path, kind)` pair that scopes one real connection in the writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseIdentity {
    pub path: String,
    pub kind: ConnectionKind,
}

impl DatabaseIdentity {
    pub fn new(path: impl Into<String>, kind: ConnectionKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

impl fmt::Display for DatabaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.path)
    }
}
