//! Backend session trait.

use crate::config::BackendKind;
use crate::models::{Dbm, IndexDescriptor, Schema};
use crate::query::Query;
use crate::Result;
use std::fmt;

/// Server flavor behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbType {
    /// Embedded `SQLite`.
    Sqlite,
    /// `MongoDB` proper.
    MongoDb,
    /// Azure Cosmos DB through its `MongoDB` API.
    CosmosDb,
    /// Amazon `DocumentDB`.
    DocumentDb,
}

impl DbType {
    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::MongoDb => "mongodb",
            Self::CosmosDb => "cosmosdb",
            Self::DocumentDb => "documentdb",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live session against one backend.
///
/// Rows, filters and updates travel as [`Dbm`]s; each backend compiles them
/// with its own dialect. Filters never contain directives: callers run them
/// through [`Query::parse`] first.
///
/// Counts returned by write operations are matched rows.
pub trait Backend: Send + Sync {
    /// Returns the backend discriminator.
    fn kind(&self) -> BackendKind;

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns the driver error when the server does not answer.
    fn ping(&self) -> Result<()>;

    /// Probes the server flavor.
    ///
    /// # Errors
    ///
    /// Returns the driver error when the probe fails for a reason other than
    /// an unsupported command.
    fn db_type(&self) -> Result<DbType>;

    /// Returns `false` when a fresh session would not see this session's
    /// data; transient failures then surface without a redial.
    fn reconnectable(&self) -> bool {
        true
    }

    /// Returns the filter this backend runs for `query`.
    ///
    /// Document stores route on the sharding hint; others ignore it.
    fn routed_filter(&self, query: &Query) -> Dbm {
        query.filter.clone()
    }

    /// Declares the field layout of a collection.
    ///
    /// Schemaless backends ignore it; relational backends create missing
    /// columns and use the field kinds to decode rows.
    ///
    /// # Errors
    ///
    /// Returns the driver error when DDL fails.
    fn ensure_collection(&self, _collection: &str, _schema: &Schema) -> Result<()> {
        Ok(())
    }

    /// Inserts one row; the row must carry its identifier.
    ///
    /// # Errors
    ///
    /// Returns the driver error, e.g. on a duplicate identifier.
    fn insert(&self, collection: &str, row: &Dbm) -> Result<()>;

    /// Returns the rows matching a parsed query.
    ///
    /// # Errors
    ///
    /// Returns translation or driver errors.
    fn find(&self, collection: &str, query: &Query) -> Result<Vec<Dbm>>;

    /// Counts rows matching a filter.
    ///
    /// # Errors
    ///
    /// Returns translation or driver errors.
    fn count(&self, collection: &str, filter: &Dbm) -> Result<u64>;

    /// Applies an update to the first (or, with `multi`, every) matching row.
    ///
    /// # Errors
    ///
    /// Returns translation or driver errors.
    fn update(&self, collection: &str, filter: &Dbm, update: &Dbm, multi: bool) -> Result<u64>;

    /// Updates the first matching row, or inserts one built from `seed`, the
    /// filter's equality fields and the update. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns translation or driver errors.
    fn upsert(&self, collection: &str, filter: &Dbm, update: &Dbm, seed: &Dbm) -> Result<Dbm>;

    /// Applies `(filter, update)` pairs, each to at most one row.
    ///
    /// # Errors
    ///
    /// Returns translation or driver errors.
    fn bulk_update(&self, collection: &str, pairs: &[(Dbm, Dbm)]) -> Result<u64>;

    /// Deletes the first (or, with `multi`, every) matching row.
    ///
    /// # Errors
    ///
    /// Returns translation or driver errors.
    fn delete(&self, collection: &str, filter: &Dbm, multi: bool) -> Result<u64>;

    /// Creates an index.
    ///
    /// # Errors
    ///
    /// Returns validation or driver errors.
    fn create_index(&self, collection: &str, index: &IndexDescriptor) -> Result<()>;

    /// Lists the indexes of a collection, excluding the identifier index.
    ///
    /// # Errors
    ///
    /// Returns driver errors.
    fn get_indexes(&self, collection: &str) -> Result<Vec<IndexDescriptor>>;

    /// Releases the session.
    ///
    /// # Errors
    ///
    /// Returns the driver error raised while shutting down.
    fn close(&self) -> Result<()>;
}
