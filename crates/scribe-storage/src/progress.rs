// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cooperative yield points driven by the engine's progress callback.
//!
//! The callback installed on a local connection runs on the engine thread and
//! cannot suspend a task, so it only marks a [`ProgressGate`] as pending. The
//! cursor that issued the statement then yields once at its next
//! [`ProgressGate::yield_point`]. Inside a [`CriticalSection`] both halves are
//! disabled so bookkeeping is never interleaved with another unit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use scribe_core::ConnectionKind;
use tracing::trace;

/// Identity of the cooperative unit (tokio task) making a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitId {
    Task(tokio::task::Id),
    /// Code running outside any task, such as a `block_on` body.
    Root,
}

impl UnitId {
    pub fn current() -> Self {
        tokio::task::try_id().map_or(Self::Root, Self::Task)
    }
}

/// Per-kind yield state shared by a connection and its cursors.
#[derive(Debug, Default)]
pub struct ProgressGate {
    pending: AtomicBool,
    critical: AtomicUsize,
    in_callback: AtomicBool,
    fired: AtomicU64,
}

impl ProgressGate {
    /// Engine-side hook. Never interrupts the statement.
    pub fn on_progress(&self) -> bool {
        if self.critical.load(Ordering::Acquire) == 0 {
            self.pending.store(true, Ordering::Release);
            self.fired.fetch_add(1, Ordering::Relaxed);
        }
        false
    }

    /// Yield to other tasks once if the callback fired since the last yield.
    pub async fn yield_point(&self) {
        if self.in_critical_section() || !self.pending.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.in_callback.swap(true, Ordering::AcqRel) {
            return;
        }
        let _reset = ResetOnDrop(&self.in_callback);
        tokio::task::yield_now().await;
    }

    /// Suppress yields until the returned guard is dropped. Nests.
    pub fn critical_section(self: &Arc<Self>) -> CriticalSection {
        let depth = self.critical.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(depth, "entering critical section");
        self.pending.store(false, Ordering::Release);
        CriticalSection {
            gate: Arc::clone(self),
        }
    }

    pub fn in_critical_section(&self) -> bool {
        self.critical.load(Ordering::Acquire) > 0
    }

    /// How many times the callback requested a yield.
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// RAII guard returned by [`ProgressGate::critical_section`].
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalSection {
    gate: Arc<ProgressGate>,
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        let depth = self.gate.critical.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(depth, "leaving critical section");
    }
}

/// One [`ProgressGate`] per connection kind.
///
/// The engine callback looks its gate up here on every invocation, so a
/// connection that has been closed (and unregistered) stops yielding even if
/// a stale callback is still installed.
#[derive(Debug, Clone, Default)]
pub struct ProgressRegistry {
    gates: Arc<RwLock<HashMap<ConnectionKind, Arc<ProgressGate>>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The gate for `kind`, created on first use.
    pub fn register(&self, kind: ConnectionKind) -> Arc<ProgressGate> {
        let mut gates = self.gates.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(kind).or_default())
    }

    pub fn unregister(&self, kind: ConnectionKind) {
        self.gates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
    }

    pub fn gate(&self, kind: ConnectionKind) -> Option<Arc<ProgressGate>> {
        self.gates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// The engine progress handler for connections of `kind`.
    pub fn handler(&self, kind: ConnectionKind) -> impl FnMut() -> bool + Send + 'static {
        let registry = self.clone();
        move || registry.gate(kind).is_some_and(|gate| gate.on_progress())
    }
}
