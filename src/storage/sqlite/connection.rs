//! Connection handling for the `SQLite` backend.
//!
//! This module provides utilities for managing `SQLite` connections with proper
//! mutex handling, poison recovery, and performance configuration.

use crate::{Error, Result};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Helper to acquire mutex lock with poison recovery.
///
/// If the mutex is poisoned (due to a panic in a previous critical section),
/// we recover the inner value and log a warning. A panic inside a transaction
/// has already rolled it back by the time the lock is released.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("SQLite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Opens a database; `None` means an in-memory database.
///
/// # Errors
///
/// Returns the driver error if the file cannot be opened.
pub fn open(path: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(path) => Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?,
        None => Connection::open_in_memory()?,
    };
    Ok(conn)
}

/// Configures a `SQLite` connection.
///
/// # Configuration Applied
///
/// - **WAL mode**: concurrent readers with a single writer (file databases only;
///   in-memory databases report `memory`)
/// - **NORMAL synchronous**: balances durability with performance
/// - **`busy_timeout`**: waits up to `busy_timeout` for locks instead of
///   failing immediately
/// - **`regexp`**: the function behind the `REGEXP` operator
///
/// # Errors
///
/// Returns [`Error::OperationFailed`] if the `regexp` function cannot be
/// registered.
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    // journal_mode returns a row, so the result is ignored rather than
    // run through execute_batch.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    conn.busy_timeout(busy_timeout)?;
    register_regexp(conn).map_err(|e| Error::OperationFailed {
        operation: "register_regexp".to_string(),
        cause: e.to_string(),
    })
}

/// Registers `regexp(pattern, text)`, compiling each distinct pattern once per
/// statement.
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<Regex> = ctx.get_or_create_aux(
                0,
                |vr| -> std::result::Result<Regex, Box<dyn std::error::Error + Send + Sync>> {
                    Ok(Regex::new(vr.as_str()?)?)
                },
            )?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Null => false,
                ValueRef::Text(bytes) => re.is_match(&String::from_utf8_lossy(bytes)),
                ValueRef::Integer(i) => re.is_match(&i.to_string()),
                ValueRef::Real(f) => re.is_match(&f.to_string()),
                ValueRef::Blob(_) => false,
            };
            Ok(matched)
        },
    )
}
