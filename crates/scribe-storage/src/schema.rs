// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Startup schema sanity check.
//!
//! Table definitions are compared in a minimized form: the body between the
//! outermost parentheses of `CREATE TABLE`, with spaces and newlines removed
//! and single quotes turned into double quotes. This makes the comparison
//! insensitive to formatting while still catching any column or constraint
//! change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use scribe_core::{ConnectionKind, ScribeError};
use scribe_wire::Value;
use tracing::{debug, error};

use crate::cursor::DbCursor;

static TABLE_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CREATETABLE.*?\((.+)\)").expect("table body pattern is valid"));

const REPAIR_HINT: &str = "Restore the database from a backup or reach out to the developers.";

/// Expected minimized table bodies keyed by table name.
pub type MinimizedSchema = HashMap<String, String>;

/// Minimized body of a `CREATE TABLE` statement, `None` if `sql` is not one.
pub fn minimize(sql: &str) -> Option<String> {
    let squeezed: String = sql
        .chars()
        .filter(|c| *c != ' ' && *c != '\n')
        .map(|c| if c == '\'' { '"' } else { c })
        .collect();
    TABLE_BODY
        .captures(&squeezed)
        .and_then(|caps| caps.get(1))
        .map(|body| body.as_str().to_string())
}

/// Build an expected schema from `(table, CREATE TABLE ...)` pairs.
pub fn minimized_schema<'a>(
    tables: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<MinimizedSchema, ScribeError> {
    tables
        .into_iter()
        .map(|(name, sql)| {
            minimize(sql)
                .map(|body| (name.to_string(), body))
                .ok_or_else(|| ScribeError::Schema(format!("`{name}` is not a CREATE TABLE")))
        })
        .collect()
}

fn text(value: &Value) -> Option<&str> {
    match value {
        Value::Text(s) => Some(s),
        _ => None,
    }
}

/// Compare the live schema seen through `cursor` with `expected`.
pub async fn check_schema(
    cursor: &DbCursor,
    kind: ConnectionKind,
    expected: &MinimizedSchema,
) -> Result<(), ScribeError> {
    let db_name = kind.to_string();

    let rows = cursor
        .execute("SELECT name, sql FROM sqlite_master WHERE type='table'", &[])
        .await?
        .fetch_all();
    // name -> (minimized body, raw sql)
    let mut live: BTreeMap<String, (String, String)> = BTreeMap::new();
    for row in rows {
        let (Some(name), Some(raw)) = (
            row.first().and_then(text),
            row.get(1).and_then(text),
        ) else {
            continue;
        };
        let body = minimize(raw).unwrap_or_default();
        live.insert(name.to_string(), (body, raw.to_string()));
    }

    let extra_structures = cursor
        .execute(
            "SELECT type, name, sql FROM sqlite_master WHERE type NOT IN ('table', 'index')",
            &[],
        )
        .await?
        .fetch_all();
    if !extra_structures.is_empty() {
        error!(db = %db_name, structures = ?extra_structures, "unexpected structures in database");
        return Err(ScribeError::Schema(format!(
            "There are unexpected structures in your {db_name} database. \
             Check the logs for more details. {REPAIR_HINT}"
        )));
    }

    let live_names: BTreeSet<&str> = live.keys().map(String::as_str).collect();
    let expected_names: BTreeSet<&str> = expected.keys().map(String::as_str).collect();

    let missing: Vec<&str> = expected_names.difference(&live_names).copied().collect();
    if !missing.is_empty() {
        return Err(ScribeError::Schema(format!(
            "Tables {missing:?} are missing from your {db_name} database. {REPAIR_HINT}"
        )));
    }

    let extra: Vec<&str> = live_names.difference(&expected_names).copied().collect();
    if !extra.is_empty() {
        return Err(ScribeError::Schema(format!(
            "Your {db_name} database has the following unexpected tables: {extra:?}. {REPAIR_HINT}"
        )));
    }

    let mut differing = Vec::new();
    for (name, (body, raw)) in &live {
        let wanted = &expected[name];
        if body != wanted {
            error!(
                db = %db_name,
                table = %name,
                expected = %wanted,
                found = %body,
                raw = %raw,
                "table structure differs"
            );
            differing.push(name.as_str());
        }
    }
    if !differing.is_empty() {
        return Err(ScribeError::Schema(format!(
            "Structure of tables {differing:?} in your {db_name} database differ from the \
             expected. Check the logs for more details. {REPAIR_HINT}"
        )));
    }

    debug!(db = %db_name, tables = live.len(), "schema sanity check passed");
    Ok(())
}
