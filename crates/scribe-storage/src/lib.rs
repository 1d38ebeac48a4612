// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Application-side access to a Scribe database.
//!
//! A [`Connection`] reads through a private local engine handle and sends
//! every write to the single writer process through a [`WriterClient`].
//! Scoped contexts keep at most one task writing at a time and manage the
//! nested savepoint stack.

pub mod client;
pub mod connection;
pub mod cursor;
pub mod process;
pub mod progress;
pub mod savepoint;
pub mod schema;

pub use client::{WriterChannel, WriterClient};
pub use connection::{Connection, ConnectionOptions};
pub use cursor::{DbCursor, WriteTarget};
pub use process::WriterProcess;
pub use progress::{CriticalSection, ProgressGate, ProgressRegistry, UnitId};
pub use savepoint::{SavepointAction, SavepointStack};
pub use schema::{MinimizedSchema, check_schema, minimize, minimized_schema};
