// SPDX-FileCopyrightText: 2026 Scribe Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classification of writer-side faults into wire error kinds.
//!
//! Families are tested in a fixed order and the first match wins, so a fault
//! that fits several families (a busy database is also an OS condition) is
//! always reported the same way.

use rusqlite::ErrorCode;
use scribe_core::{ErrorKind, INTERFACE_FAULT_PREFIX};
use scribe_wire::CodecError;
use thiserror::Error;

/// Anything that can go wrong while the writer performs one call.
#[derive(Debug, Error)]
pub enum WriterFault {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{0}")]
    Argument(String),

    #[error("cursor `{0}` already exists")]
    DuplicateCursor(String),

    #[error("{0} not found")]
    NotFound(String),
}

type Matcher = fn(&WriterFault) -> bool;

const FAMILIES: [(ErrorKind, Matcher); 5] = [
    (ErrorKind::DbWrite, is_db_write),
    (ErrorKind::Computation, is_computation),
    (ErrorKind::Programming, is_programming),
    (ErrorKind::HostSystem, is_host_system),
    (ErrorKind::MemoryUsage, is_memory_usage),
];

/// Kind and message to send back for `fault`.
pub fn classify(fault: &WriterFault) -> (ErrorKind, String) {
    let kind = FAMILIES
        .iter()
        .find(|(_, matches)| matches(fault))
        .map_or(ErrorKind::Unknown, |(kind, _)| *kind);
    let message = if is_interface(fault) {
        format!("{INTERFACE_FAULT_PREFIX}{fault}")
    } else {
        fault.to_string()
    };
    (kind, message)
}

fn sqlite_code(fault: &WriterFault) -> Option<ErrorCode> {
    match fault {
        WriterFault::Sqlite(err) => err.sqlite_error_code(),
        _ => None,
    }
}

/// Parameter binding faults, the only ones the client retries.
fn is_interface(fault: &WriterFault) -> bool {
    matches!(
        fault,
        WriterFault::Sqlite(rusqlite::Error::ToSqlConversionFailure(_))
    ) || sqlite_code(fault) == Some(ErrorCode::ApiMisuse)
}

fn is_db_write(fault: &WriterFault) -> bool {
    use rusqlite::Error as E;

    if is_interface(fault) {
        return true;
    }
    if let WriterFault::Sqlite(
        E::InvalidParameterCount(..)
        | E::InvalidParameterName(_)
        | E::MultipleStatement
        | E::ExecuteReturnedResults
        | E::StatementChangedRows(_)
        | E::InvalidQuery,
    ) = fault
    {
        return true;
    }
    matches!(
        sqlite_code(fault),
        Some(
            ErrorCode::ConstraintViolation
                | ErrorCode::Unknown
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::ReadOnly
                | ErrorCode::TypeMismatch
                | ErrorCode::ParameterOutOfRange
                | ErrorCode::SchemaChanged
                | ErrorCode::OperationAborted
        )
    )
}

fn is_computation(fault: &WriterFault) -> bool {
    use rusqlite::Error as E;

    matches!(
        fault,
        WriterFault::Codec(CodecError::InvalidFloat(_))
            | WriterFault::Sqlite(
                E::IntegralValueOutOfRange(..)
                    | E::Utf8Error(..)
                    | E::NulError(_)
                    | E::FromSqlConversionFailure(..)
                    | E::InvalidColumnType(..)
            )
    ) || sqlite_code(fault) == Some(ErrorCode::TooBig)
}

fn is_programming(fault: &WriterFault) -> bool {
    matches!(
        fault,
        WriterFault::Codec(_)
            | WriterFault::Argument(_)
            | WriterFault::DuplicateCursor(_)
            | WriterFault::Sqlite(
                rusqlite::Error::InvalidPath(_) | rusqlite::Error::SqliteSingleThreadedMode
            )
    )
}

fn is_host_system(fault: &WriterFault) -> bool {
    matches!(
        sqlite_code(fault),
        Some(
            ErrorCode::PermissionDenied
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::OperationInterrupted
                | ErrorCode::DiskFull
                | ErrorCode::FileLockingProtocolFailed
                | ErrorCode::NoLargeFileSupport
        )
    )
}

fn is_memory_usage(fault: &WriterFault) -> bool {
    use rusqlite::Error as E;

    matches!(
        fault,
        WriterFault::NotFound(_)
            | WriterFault::Sqlite(
                E::InvalidColumnIndex(_)
                    | E::InvalidColumnName(_)
                    | E::QueryReturnedNoRows
            )
    ) || sqlite_code(fault) == Some(ErrorCode::OutOfMemory)
}
