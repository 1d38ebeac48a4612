// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for Scribe integration tests.

pub mod harness;

pub use harness::{TestHarness, TestHarnessBuilder};
