// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The ordered stack of open savepoint names held by one connection.

use std::fmt;

use scribe_core::ContextError;

use crate::progress::UnitId;

/// What to do with a savepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointAction {
    /// Forget the savepoint and everything opened after it, keeping the work.
    Release,
    /// Undo everything done since the savepoint opened; the savepoint stays.
    RollbackTo,
}

impl SavepointAction {
    pub fn statement(self, name: &str) -> String {
        format!("{self} SAVEPOINT {}", quote(name))
    }
}

impl fmt::Display for SavepointAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Release => "RELEASE",
            Self::RollbackTo => "ROLLBACK TO",
        })
    }
}

/// `SAVEPOINT "name"` for opening `name`.
pub fn savepoint_statement(name: &str) -> String {
    format!("SAVEPOINT {}", quote(name))
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Unique savepoint names in the order they were opened, plus the unit that
/// owns them. The owner is cleared when the last name is released.
#[derive(Debug, Default)]
pub struct SavepointStack {
    names: Vec<String>,
    owner: Option<UnitId>,
}

impl SavepointStack {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn owner(&self) -> Option<UnitId> {
        self.owner
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Whether a unit other than `unit` holds savepoints.
    pub fn held_by_other(&self, unit: UnitId) -> bool {
        self.owner.is_some_and(|owner| owner != unit)
    }

    /// Open `name` on behalf of `unit`.
    pub fn push(&mut self, name: &str, unit: UnitId) -> Result<(), ContextError> {
        if self.contains(name) {
            return Err(ContextError(format!(
                "wanted to enter savepoint {name} but a savepoint with the same name already \
                 exists. Current savepoints: {:?}",
                self.names
            )));
        }
        self.names.push(name.to_string());
        self.owner = Some(unit);
        Ok(())
    }

    /// The savepoint `action` applies to: `name`, or the latest one.
    pub fn resolve(
        &self,
        action: SavepointAction,
        name: Option<&str>,
    ) -> Result<String, ContextError> {
        let verb = action.to_string().to_lowercase();
        let Some(latest) = self.names.last() else {
            return Err(ContextError(format!(
                "incorrect use of savepoints: wanted to {verb} savepoint {}, but the stack is empty",
                name.unwrap_or("<latest>")
            )));
        };
        match name {
            None => Ok(latest.clone()),
            Some(name) if self.contains(name) => Ok(name.to_string()),
            Some(name) => Err(ContextError(format!(
                "incorrect use of savepoints: wanted to {verb} savepoint {name}, but it is not \
                 present in the stack: {:?}",
                self.names
            ))),
        }
    }

    /// Drop `name` and every savepoint opened after it. Returns what was removed.
    pub fn truncate_from(&mut self, name: &str) -> Vec<String> {
        let removed = match self.names.iter().position(|n| n == name) {
            Some(index) => self.names.split_off(index),
            None => Vec::new(),
        };
        if self.names.is_empty() {
            self.owner = None;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_claims_ownership_and_rejects_duplicates() {
        let mut stack = SavepointStack::default();
        stack.push("sp1", UnitId::Root).unwrap();
        assert_eq!(stack.owner(), Some(UnitId::Root));
        let err = stack.push("sp1", UnitId::Root).unwrap_err();
        assert!(err.0.contains("same name"));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn resolve_defaults_to_latest() {
        let mut stack = SavepointStack::default();
        stack.push("a", UnitId::Root).unwrap();
        stack.push("b", UnitId::Root).unwrap();
        assert_eq!(stack.resolve(SavepointAction::Release, None).unwrap(), "b");
        assert_eq!(stack.resolve(SavepointAction::RollbackTo, Some("a")).unwrap(), "a");
    }

    #[test]
    fn resolve_fails_on_empty_stack_or_absent_name() {
        let mut stack = SavepointStack::default();
        let err = stack.resolve(SavepointAction::Release, None).unwrap_err();
        assert!(err.0.contains("stack is empty"));

        stack.push("a", UnitId::Root).unwrap();
        let err = stack
            .resolve(SavepointAction::RollbackTo, Some("zzz"))
            .unwrap_err();
        assert!(err.0.contains("rollback to savepoint zzz"));
        assert!(err.0.contains("not present"));
    }

    #[test]
    fn truncate_removes_name_and_everything_after() {
        let mut stack = SavepointStack::default();
        for name in ["a", "b", "c"] {
            stack.push(name, UnitId::Root).unwrap();
        }
        assert_eq!(stack.truncate_from("b"), vec!["b", "c"]);
        assert_eq!(stack.names(), ["a"]);
        assert_eq!(stack.owner(), Some(UnitId::Root));

        assert_eq!(stack.truncate_from("a"), vec!["a"]);
        assert!(stack.is_empty());
        assert_eq!(stack.owner(), None);
    }

    #[test]
    fn statements_quote_names() {
        assert_eq!(savepoint_statement("sp1"), "SAVEPOINT \"sp1\"");
        assert_eq!(
            SavepointAction::RollbackTo.statement("a\"b"),
            "ROLLBACK TO SAVEPOINT \"a\"\"b\""
        );
        assert_eq!(SavepointAction::Release.statement("x"), "RELEASE SAVEPOINT \"x\"");
    }
}
