// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the Scribe single-writer database layer.
//!
//! This crate provides the identity types and the error taxonomy shared by
//! the application-side connection and the writer process. Nothing here
//! touches the engine or the network.

pub mod error;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use error::{ContextError, DbError, ErrorKind, INTERFACE_FAULT_PREFIX, ScribeError};
pub use types::{ConnectionKind, DatabaseIdentity};
