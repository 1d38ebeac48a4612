// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use scribe_core::ScribeError;
use thiserror::Error;

/// Failure to encode or decode something on the writer channel.
///
/// Inside the writer these classify as programming errors, except
/// [`CodecError::InvalidFloat`] which is a numeric fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unknown wire tag {0}")]
    UnknownTag(u8),

    #[error("malformed payload for tag {tag}: {reason}")]
    InvalidPayload { tag: u8, reason: String },

    #[error("invalid float text `{0}`")]
    InvalidFloat(String),

    #[error("unsupported value: {0}")]
    Unsupported(String),

    #[error("unknown {field} tag {tag}")]
    UnknownEnum { field: &'static str, tag: u8 },

    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

impl CodecError {
    pub(crate) fn payload(tag: u8, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            tag,
            reason: reason.into(),
        }
    }
}

impl From<CodecError> for ScribeError {
    fn from(err: CodecError) -> Self {
        ScribeError::Codec(err.to_string())
    }
}

