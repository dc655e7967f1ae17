//! `SQLite` session and connector.

use super::connection::{acquire_lock, configure_connection, open};
use super::rows::{self, ensure_columns, filter_columns, update_columns};
use super::{BACKEND, database_path, index, upsert};
use crate::config::{BackendKind, ClientOpts, Consistency};
use crate::models::{Dbm, ID_FIELD, IndexDescriptor, Schema, Value};
use crate::observability::{record_operation_metrics, status_label};
use crate::query::{Query, sql};
use crate::storage::tls::TlsMaterial;
use crate::storage::traits::{Backend, Connector, DbType};
use crate::{Error, Result};
use rusqlite::{Connection, params_from_iter};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Dials [`SqliteBackend`] sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn connect(&self, opts: &ClientOpts, tls: Option<&TlsMaterial>) -> Result<Arc<dyn Backend>> {
        if tls.is_some() {
            debug!("TLS settings have no effect on an embedded database");
        }
        if opts.consistency != Consistency::Strong {
            debug!(consistency = ?opts.consistency, "Embedded database is always strongly consistent");
        }
        let path = database_path(&opts.url);
        Ok(Arc::new(SqliteBackend::open(path, opts.timeout())?))
    }
}

/// `SQLite` session.
///
/// # Concurrency Model
///
/// Statements are serialized through a `Mutex<Connection>`; WAL mode and the
/// busy timeout let several sessions share a database file. The connection is
/// taken out of the mutex on [`Backend::close`], after which every call fails
/// with [`Error::SessionClosed`].
///
/// # Schema
///
/// Every collection is a table with a `"_id" TEXT PRIMARY KEY` column and one
/// untyped column per field. Identifiers are stored as lowercase hex,
/// timestamps as fixed-width RFC 3339 text, booleans as `0`/`1`, lists and maps as JSON.
/// Schemas declared through [`Backend::ensure_collection`] drive decoding
/// back into booleans and JSON values.
pub struct SqliteBackend {
    conn: Mutex<Option<Connection>>,
    db_path: Option<PathBuf>,
    schemas: RwLock<HashMap<String, Schema>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("db_path", &self.db_path)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens a database file, or an in-memory database for `None`.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the database cannot be opened or configured.
    pub fn open(db_path: Option<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let conn = open(db_path.as_deref())?;
        configure_connection(&conn, busy_timeout)?;
        debug!(path = ?db_path, "Opened SQLite database");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path,
            schemas: RwLock::new(HashMap::new()),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the database cannot be configured.
    pub fn in_memory() -> Result<Self> {
        Self::open(None, crate::config::DEFAULT_CONNECT_TIMEOUT)
    }

    /// Returns the database path (None for in-memory).
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = acquire_lock(&self.conn);
        let conn = guard.as_mut().ok_or(Error::SessionClosed)?;
        f(conn)
    }

    fn schema(&self, collection: &str) -> Option<Schema> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .cloned()
    }

    /// Adds columns for every field a filter reads; `false` when the table
    /// does not exist yet.
    fn prepare_read(conn: &Connection, collection: &str, filter: &Dbm) -> Result<bool> {
        if !rows::table_exists(conn, collection)? {
            return Ok(false);
        }
        let mut columns = BTreeSet::new();
        filter_columns(filter, &mut columns);
        ensure_columns(conn, collection, columns.iter().map(String::as_str))?;
        Ok(true)
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    #[instrument(skip(self), fields(operation = "ping", backend = BACKEND))]
    fn ping(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
            Ok(())
        });
        record_operation_metrics(BACKEND, "ping", start, status_label(&result));
        result
    }

    fn db_type(&self) -> Result<DbType> {
        self.with_conn(|_| Ok(DbType::Sqlite))
    }

    /// An in-memory database dies with its connection.
    fn reconnectable(&self) -> bool {
        self.db_path.is_some()
    }

    #[instrument(skip(self, schema), fields(operation = "ensure_collection", backend = BACKEND))]
    fn ensure_collection(&self, collection: &str, schema: &Schema) -> Result<()> {
        if self.schema(collection).as_ref() == Some(schema) {
            return Ok(());
        }
        self.with_conn(|conn| ensure_columns(conn, collection, schema.names()))?;
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection.to_string(), schema.clone());
        Ok(())
    }

    #[instrument(skip(self, row), fields(operation = "insert", backend = BACKEND))]
    fn insert(&self, collection: &str, row: &Dbm) -> Result<()> {
        let start = Instant::now();
        let result = (|| {
            let mut row = row.clone();
            let id = row
                .get(ID_FIELD)
                .ok_or_else(|| Error::InvalidIdentifier("row has no identifier".to_string()))?
                .to_identifier()?;
            row.insert(ID_FIELD.to_string(), Value::Id(id));
            if let Some(field) = row.keys().find(|k| k.contains('.') || k.starts_with('$')) {
                return Err(Error::InvalidInput(format!(
                    "'{field}' is not a valid column name"
                )));
            }
            let stmt = sql::insert(collection, &row);
            self.with_conn(|conn| {
                ensure_columns(conn, collection, row.keys().map(String::as_str))?;
                conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
                Ok(())
            })
        })();
        record_operation_metrics(BACKEND, "insert", start, status_label(&result));
        result
    }

    #[instrument(skip(self, query), fields(operation = "find", backend = BACKEND))]
    fn find(&self, collection: &str, query: &Query) -> Result<Vec<Dbm>> {
        let start = Instant::now();
        let result = (|| {
            let stmt = sql::select(collection, query)?;
            let schema = self.schema(collection);
            self.with_conn(|conn| {
                let mut read = query.filter.clone();
                for key in &query.sort {
                    read.entry(key.field.clone()).or_insert(Value::Null);
                }
                if !Self::prepare_read(conn, collection, &read)? {
                    return Ok(Vec::new());
                }
                index::purge_expired(conn, collection)?;
                rows::query_rows(conn, &stmt.sql, &stmt.params, schema.as_ref())
            })
        })();
        record_operation_metrics(BACKEND, "find", start, status_label(&result));
        result
    }

    #[instrument(skip(self, filter), fields(operation = "count", backend = BACKEND))]
    fn count(&self, collection: &str, filter: &Dbm) -> Result<u64> {
        let start = Instant::now();
        let result = (|| {
            let stmt = sql::count(collection, filter)?;
            self.with_conn(|conn| {
                if !Self::prepare_read(conn, collection, filter)? {
                    return Ok(0);
                }
                index::purge_expired(conn, collection)?;
                let n: i64 = conn.query_row(
                    &stmt.sql,
                    params_from_iter(stmt.params.iter()),
                    |r| r.get(0),
                )?;
                Ok(u64::try_from(n).unwrap_or(0))
            })
        })();
        record_operation_metrics(BACKEND, "count", start, status_label(&result));
        result
    }

    #[instrument(skip(self, filter, update), fields(operation = "update", backend = BACKEND))]
    fn update(&self, collection: &str, filter: &Dbm, update: &Dbm, multi: bool) -> Result<u64> {
        let start = Instant::now();
        let result = (|| {
            let stmt = sql::update(collection, filter, update, multi)?;
            self.with_conn(|conn| {
                if !Self::prepare_read(conn, collection, filter)? {
                    return Ok(0);
                }
                let mut columns = BTreeSet::new();
                update_columns(update, &mut columns);
                ensure_columns(conn, collection, columns.iter().map(String::as_str))?;
                let changed = conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
                Ok(u64::try_from(changed).unwrap_or(u64::MAX))
            })
        })();
        record_operation_metrics(BACKEND, "update", start, status_label(&result));
        result
    }

    #[instrument(skip(self, filter, update, seed), fields(operation = "upsert", backend = BACKEND))]
    fn upsert(&self, collection: &str, filter: &Dbm, update: &Dbm, seed: &Dbm) -> Result<Dbm> {
        let start = Instant::now();
        let schema = self.schema(collection);
        let result = self.with_conn(|conn| {
            upsert::upsert(conn, collection, filter, update, seed, schema.as_ref())
        });
        record_operation_metrics(BACKEND, "upsert", start, status_label(&result));
        result
    }

    #[instrument(skip(self, pairs), fields(operation = "bulk_update", backend = BACKEND, count = pairs.len()))]
    fn bulk_update(&self, collection: &str, pairs: &[(Dbm, Dbm)]) -> Result<u64> {
        let start = Instant::now();
        let result = self.with_conn(|conn| upsert::bulk_update(conn, collection, pairs));
        record_operation_metrics(BACKEND, "bulk_update", start, status_label(&result));
        result
    }

    #[instrument(skip(self, filter), fields(operation = "delete", backend = BACKEND))]
    fn delete(&self, collection: &str, filter: &Dbm, multi: bool) -> Result<u64> {
        let start = Instant::now();
        let result = (|| {
            let stmt = sql::delete(collection, filter, multi)?;
            self.with_conn(|conn| {
                if !Self::prepare_read(conn, collection, filter)? {
                    return Ok(0);
                }
                let removed = conn.execute(&stmt.sql, params_from_iter(stmt.params.iter()))?;
                Ok(u64::try_from(removed).unwrap_or(u64::MAX))
            })
        })();
        record_operation_metrics(BACKEND, "delete", start, status_label(&result));
        result
    }

    #[instrument(skip(self, index), fields(operation = "create_index", backend = BACKEND))]
    fn create_index(&self, collection: &str, index: &IndexDescriptor) -> Result<()> {
        let start = Instant::now();
        let result = (|| {
            index.validate()?;
            self.with_conn(|conn| index::create(conn, collection, index))
        })();
        record_operation_metrics(BACKEND, "create_index", start, status_label(&result));
        result
    }

    #[instrument(skip(self), fields(operation = "get_indexes", backend = BACKEND))]
    fn get_indexes(&self, collection: &str) -> Result<Vec<IndexDescriptor>> {
        let start = Instant::now();
        let result = self.with_conn(|conn| index::list(conn, collection));
        record_operation_metrics(BACKEND, "get_indexes", start, status_label(&result));
        result
    }

    fn close(&self) -> Result<()> {
        let conn = acquire_lock(&self.conn).take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, e)| Error::from(e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbm;
    use crate::models::Identifier;

    fn backend() -> SqliteBackend {
        SqliteBackend::in_memory().unwrap()
    }

    fn row(name: &str, age: i64) -> Dbm {
        dbm! { "_id" => Identifier::new(), "name" => name, "age" => age }
    }

    #[test]
    fn test_reads_on_missing_table_are_empty() {
        let b = backend();
        assert!(b.find("nothing", &Query::default()).unwrap().is_empty());
        assert_eq!(b.count("nothing", &Dbm::new()).unwrap(), 0);
        assert_eq!(b.delete("nothing", &Dbm::new(), true).unwrap(), 0);
        assert!(b.get_indexes("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_insert_find_count() {
        let b = backend();
        let jane = row("Jane", 8);
        b.insert("people", &jane).unwrap();
        b.insert("people", &row("Ann", 40)).unwrap();

        let found = b
            .find("people", &Query::parse(&dbm! { "name" => "Jane" }).unwrap())
            .unwrap();
        assert_eq!(found, vec![jane]);
        assert_eq!(
            b.count("people", &dbm! { "age" => dbm! { "$gte" => 18 } }).unwrap(),
            1
        );
    }

    #[test]
    fn test_insert_requires_identifier() {
        let b = backend();
        let err = b.insert("people", &dbm! { "name" => "x" }).unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));
    }

    #[test]
    fn test_filter_on_unknown_field_matches_nothing() {
        let b = backend();
        b.insert("people", &row("Jane", 8)).unwrap();
        let found = b
            .find("people", &Query::parse(&dbm! { "nickname" => "jj" }).unwrap())
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(b.count("people", &dbm! { "nickname" => Value::Null }).unwrap(), 1);
    }

    #[test]
    fn test_sort_limit_offset() {
        let b = backend();
        for (name, age) in [("a", 3), ("b", 1), ("c", 2)] {
            b.insert("t", &row(name, age)).unwrap();
        }
        let q = Query::parse(&dbm! { "_sort" => "-age", "_limit" => 2, "_offset" => 1 }).unwrap();
        let names: Vec<Value> = b
            .find("t", &q)
            .unwrap()
            .into_iter()
            .map(|r| r["name"].clone())
            .collect();
        assert_eq!(names, vec![Value::from("c"), Value::from("b")]);
    }

    #[test]
    fn test_single_and_multi_update_and_delete() {
        let b = backend();
        for i in 0..3 {
            b.insert("t", &row("x", i)).unwrap();
        }
        assert_eq!(b.update("t", &dbm! { "name" => "x" }, &dbm! { "flag" => 1 }, false).unwrap(), 1);
        assert_eq!(b.update("t", &dbm! { "name" => "x" }, &dbm! { "flag" => 2 }, true).unwrap(), 3);
        assert_eq!(b.delete("t", &dbm! { "flag" => 2 }, false).unwrap(), 1);
        assert_eq!(b.delete("t", &Dbm::new(), true).unwrap(), 2);
    }

    #[test]
    fn test_close_then_use() {
        let b = backend();
        b.close().unwrap();
        assert!(matches!(b.ping(), Err(Error::SessionClosed)));
        b.close().unwrap();
    }

    #[test]
    fn test_connector_opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let opts = ClientOpts::new(format!("sqlite://{}", path.display()));
        let session = SqliteConnector.connect(&opts, None).unwrap();
        session.ping().unwrap();
        session.insert("t", &row("Jane", 8)).unwrap();
        session.close().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_only_file_databases_are_reconnectable() {
        assert!(!backend().reconnectable());

        let dir = tempfile::tempdir().unwrap();
        let file = SqliteBackend::open(Some(dir.path().join("r.db")), Duration::from_secs(1)).unwrap();
        assert!(file.reconnectable());
    }
}
