//! # Polystore
//!
//! A storage-abstraction layer that lets application code issue one
//! backend-agnostic query/update vocabulary against interchangeable document
//! and relational stores.
//!
//! ## Features
//!
//! - A 12-byte [`Identifier`] generated, compared and serialized the same way
//!   whatever driver produced it
//! - A universal query model ([`Dbm`]) compiled to BSON filters or SQL
//!   predicate chains
//! - Upsert and bulk-update emulation for relational backends
//! - A connection [`LifecycleManager`] that classifies transient failures and
//!   reconnects transparently
//! - Pluggable backends (`SQLite` always, `MongoDB` behind the `mongodb` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use polystore::{dbm, ClientOpts, Store};
//!
//! let store = Store::connect(ClientOpts::new("sqlite::memory:"))?;
//! let mut jane = Person { name: "Jane".into(), age: 8, ..Default::default() };
//! store.insert(&mut jane)?;
//! let adults: Vec<Person> = store.find(&dbm! { "age" => dbm! { "$gte" => 18 } })?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod config;
pub mod models;
pub mod observability;
pub mod query;
pub mod services;
pub mod storage;

// Re-exports for convenience
pub use config::{BackendKind, ClientOpts, Consistency, TlsSettings};
pub use models::{
    DbObject, Dbm, Identifier, IndexDescriptor, IndexKey, IndexKind, Record, Value,
};
pub use query::{Query, SortKey};
pub use services::Store;
pub use storage::{Backend, ConnectionState, Connector, DbType, LifecycleManager};

/// Error type for polystore operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidIdentifier` | Hex string is not 24 hex chars, raw bytes are not 12 long |
/// | `NoCollectionName` | Neither `_collection` nor a table name is available |
/// | `EmptyIndexKeys` / `ComposedTtlIndex` | Index descriptor fails validation |
/// | `RowFilterCountMismatch` | Bulk update filters are neither 0 nor one per row |
/// | `SessionClosed` / `AlreadyClosed` | Lifecycle misuse |
/// | `TlsConfig` | CA, certificate or key file is unreadable or not PEM |
/// | `NotFound` | No matching document/row (see [`is_not_found`]) |
/// | `Sqlite` / `Mongo` | Unclassified driver errors, passed through untouched |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    ///
    /// Raised when:
    /// - A directive such as `_limit` carries a value of the wrong type
    /// - A consistency or backend string cannot be parsed
    /// - A record cannot be mapped to or from a query model
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An identifier could not be decoded.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// No collection or table name could be resolved for an operation.
    #[error("no collection name: set `_collection` or declare a table name")]
    NoCollectionName,

    /// An index descriptor has no keys.
    #[error("index has no keys")]
    EmptyIndexKeys,

    /// A TTL was requested on a compound index.
    #[error("TTL indexes must have exactly one key")]
    ComposedTtlIndex,

    /// More than one filter was given for a single-row operation.
    #[error("multiple filters given for a single row")]
    MultipleFilterForSingleRow,

    /// Bulk update filter count is neither zero nor one per row.
    #[error("row/filter count mismatch: {rows} rows, {filters} filters")]
    RowFilterCountMismatch {
        /// Number of rows supplied.
        rows: usize,
        /// Number of filters supplied.
        filters: usize,
    },

    /// A bulk operation was called without rows.
    #[error("empty row set")]
    EmptyRowSet,

    /// A row operation has neither a filter nor an identifier to target.
    #[error("no filter and no identifier given")]
    NoFilter,

    /// A multi-row write with an empty filter was not acknowledged.
    #[error("global update or delete requires explicit acknowledgment")]
    GlobalUpdateNotAllowed,

    /// An operator cannot be expressed by the target backend.
    #[error("unsupported operator '{0}' for this backend")]
    UnsupportedOperator(String),

    /// No live session is available.
    #[error("session closed")]
    SessionClosed,

    /// `close` was called on a manager that is not connected.
    #[error("already closed")]
    AlreadyClosed,

    /// TLS material could not be loaded.
    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    /// No document or row matched.
    #[error("not found")]
    NotFound,

    /// An operation failed.
    ///
    /// Raised when:
    /// - The configuration file cannot be read or parsed
    /// - Logging is initialized twice
    /// - A backend reply has an unexpected shape
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// `SQLite` driver error, passed through unchanged.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// `MongoDB` driver error, passed through unchanged.
    #[cfg(feature = "mongodb")]
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    /// BSON encoding error.
    #[error(transparent)]
    Bson(#[from] bson::ser::Error),

    /// JSON mapping error between records and query models.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for polystore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns `true` when `err` means "no matching document or row".
///
/// This is the single backend-agnostic predicate callers should use instead of
/// matching driver-specific sentinels.
#[must_use]
pub fn is_not_found(err: &Error) -> bool {
    match err {
        Error::NotFound => true,
        Error::Sqlite(rusqlite::Error::QueryReturnedNoRows) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidInput("test error".to_string());
        assert_eq!(err.to_string(), "invalid input: test error");

        let err = Error::OperationFailed {
            operation: "test".to_string(),
            cause: "failed".to_string(),
        };
        assert_eq!(err.to_string(), "operation 'test' failed: failed");

        let err = Error::RowFilterCountMismatch {
            rows: 3,
            filters: 2,
        };
        assert_eq!(err.to_string(), "row/filter count mismatch: 3 rows, 2 filters");
    }

    #[test]
    fn test_is_not_found() {
        assert!(is_not_found(&Error::NotFound));
        assert!(is_not_found(&Error::Sqlite(
            rusqlite::Error::QueryReturnedNoRows
        )));
        assert!(!is_not_found(&Error::NoFilter));
        assert!(!is_not_found(&Error::SessionClosed));
    }
}
