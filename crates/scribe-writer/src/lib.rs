// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The Scribe writer process.
//!
//! A single [`WriterServer`] owns every real database connection. Clients on
//! the loopback endpoint send calls; an [`Executor`] thread performs them one
//! at a time and each fault is classified into an [`ErrorKind`] before it is
//! sent back.
//!
//! [`ErrorKind`]: scribe_core::ErrorKind

pub mod executor;
pub mod fault;
pub mod server;

pub use executor::{CallRecord, Executor};
pub use fault::{WriterFault, classify};
pub use server::WriterServer;
