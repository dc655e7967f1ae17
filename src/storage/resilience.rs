//! Transient-failure classification.
//!
//! [`is_transient_error`] decides whether a failed operation should trigger a
//! reconnect. Typed driver errors are checked first; the rendered message is
//! matched against known fragments only when the type says nothing.

use crate::Error;

/// Message fragments that mark a broken connection.
const TRANSIENT_MESSAGES: [&str; 7] = [
    "connection reset",
    "unexpected eof",
    "closed explicitly",
    "no reachable servers",
    "i/o timeout",
    "broken pipe",
    "connection refused",
];

/// Server error codes the document driver reports for retryable conditions
/// (host unreachable, not primary, shutdown in progress, network timeout).
#[cfg(feature = "mongodb")]
const RETRYABLE_SERVER_CODES: [i32; 12] = [
    6, 7, 89, 91, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436,
];

/// Returns `true` when `err` means the session is broken and should be
/// replaced.
///
/// Validation and translation errors are never transient.
#[must_use]
pub fn is_transient_error(err: &Error) -> bool {
    match err {
        Error::Io(e) => is_transient_io(e.kind()) || is_transient_message(&e.to_string()),
        Error::Sqlite(e) => is_transient_sqlite(e),
        #[cfg(feature = "mongodb")]
        Error::Mongo(e) => is_transient_mongo(e),
        Error::OperationFailed { cause, .. } => is_transient_message(cause),
        _ => false,
    }
}

/// Matches a rendered error against the known transient fragments.
#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|m| lower.contains(m))
}

const fn is_transient_io(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::TimedOut
    )
}

fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::SystemIoFailure
        ),
        rusqlite::Error::QueryReturnedNoRows
        | rusqlite::Error::InvalidParameterCount(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::InvalidColumnName(_) => false,
        other => is_transient_message(&other.to_string()),
    }
}

#[cfg(feature = "mongodb")]
fn is_transient_mongo(err: &mongodb::error::Error) -> bool {
    use mongodb::error::ErrorKind;
    if err.contains_label("RetryableWriteError") || err.contains_label("TransientTransactionError")
    {
        return true;
    }
    match err.kind.as_ref() {
        ErrorKind::Io(io) => is_transient_io(io.kind()) || is_transient_message(&io.to_string()),
        ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => true,
        ErrorKind::Command(c) => {
            RETRYABLE_SERVER_CODES.contains(&c.code) || is_transient_message(&c.message)
        },
        ErrorKind::Authentication { .. }
        | ErrorKind::InvalidArgument { .. }
        | ErrorKind::BsonDeserialization(_)
        | ErrorKind::BsonSerialization(_) => false,
        _ => is_transient_message(&err.to_string()),
    }
}
