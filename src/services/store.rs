//! Typed store facade.
//!
//! [`Store`] is the entry point applications use. It maps records to query
//! models, parses directives, resolves the target collection and hands the
//! compiled work to the live session through the [`LifecycleManager`], so
//! every call benefits from transient-error reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use polystore::{ClientOpts, Store, dbm};
//!
//! let store = Store::connect(ClientOpts::new("sqlite::memory:"))?;
//! let mut jane = Person { name: "Jane".into(), age: 8, ..Person::default() };
//! let id = store.insert(&mut jane)?;
//! let found: Person = store.find_by_id(id)?;
//! let adults: Vec<Person> = store.find(&dbm! { "age" => dbm! { "$gte" => 18 }, "_sort" => "-age" })?;
//! ```

use super::BackendFactory;
use crate::config::ClientOpts;
use crate::models::{
    Dbm, ID_FIELD, Identifier, IndexDescriptor, Record, Schema, Value, from_dbm, to_dbm,
};
use crate::query::{Query, equality_fields, is_global, resolve_collection};
use crate::storage::{ConnectionState, Connector, DbType, LifecycleManager};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Typed CRUD over one backend session.
#[derive(Debug)]
pub struct Store {
    lifecycle: LifecycleManager,
}

impl Store {
    /// Connects to the backend selected by `opts`.
    ///
    /// # Errors
    ///
    /// Returns option validation, TLS or driver errors; see
    /// [`LifecycleManager::connect`].
    pub fn connect(opts: ClientOpts) -> Result<Self> {
        Ok(Self {
            lifecycle: BackendFactory::lifecycle(opts)?,
        })
    }

    /// Connects through a caller-supplied connector.
    ///
    /// # Errors
    ///
    /// Returns whatever [`LifecycleManager::connect`] returns.
    pub fn with_connector(connector: Arc<dyn Connector>, opts: ClientOpts) -> Result<Self> {
        let lifecycle = LifecycleManager::new(connector);
        lifecycle.connect(opts)?;
        Ok(Self { lifecycle })
    }

    /// Wraps an existing lifecycle manager.
    #[must_use]
    pub const fn from_lifecycle(lifecycle: LifecycleManager) -> Self {
        Self { lifecycle }
    }

    /// Returns the lifecycle manager.
    #[must_use]
    pub const fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Returns the connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Liveness probe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] or the driver error.
    pub fn ping(&self) -> Result<()> {
        self.lifecycle.ping()
    }

    /// Probes the server flavor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] or the driver error.
    pub fn db_type(&self) -> Result<DbType> {
        self.lifecycle.db_type()
    }

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyClosed`] on a second call.
    pub fn close(&self) -> Result<()> {
        self.lifecycle.close()
    }

    /// Inserts a record into its declared table, assigning an identifier
    /// when it has none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCollectionName`] when the record declares no table,
    /// otherwise mapping or driver errors.
    pub fn insert<T: Record>(&self, row: &mut T) -> Result<Identifier> {
        self.insert_into(None, row)
    }

    /// Inserts a record, optionally into an explicit collection.
    ///
    /// # Errors
    ///
    /// See [`Store::insert`].
    #[instrument(skip(self, row), fields(operation = "insert"))]
    pub fn insert_into<T: Record>(
        &self,
        collection: Option<&str>,
        row: &mut T,
    ) -> Result<Identifier> {
        let collection = resolve_collection(collection, row)?;
        let schema = Schema::of::<T>()?;
        let id = row.id().unwrap_or_default();
        let mut dbm = to_dbm(row)?;
        dbm.insert(ID_FIELD.to_string(), Value::Id(id));

        self.lifecycle.run("insert", |b| {
            b.ensure_collection(&collection, &schema)?;
            b.insert(&collection, &dbm)
        })?;
        row.set_id(id);
        debug!(collection = %collection, id = %id, "Inserted row");
        Ok(id)
    }

    /// Returns every record matching `filter`.
    ///
    /// The filter may carry `_sort`, `_limit`, `_offset`, `_collection` and
    /// `_shard` directives.
    ///
    /// # Errors
    ///
    /// Returns directive, translation, mapping or driver errors.
    #[instrument(skip(self, filter), fields(operation = "find"))]
    pub fn find<T: Record>(&self, filter: &Dbm) -> Result<Vec<T>> {
        let query = Query::parse(filter)?;
        self.find_query(&query)
    }

    /// Returns the first record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when nothing matches.
    pub fn find_one<T: Record>(&self, filter: &Dbm) -> Result<T> {
        let mut query = Query::parse(filter)?;
        query.limit = Some(1);
        self.find_query(&query)?
            .into_iter()
            .next()
            .ok_or(Error::NotFound)
    }

    /// Returns the record with identifier `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when no record has that identifier.
    pub fn find_by_id<T: Record>(&self, id: Identifier) -> Result<T> {
        let mut query = Query::by_id(id);
        query.limit = Some(1);
        self.find_query(&query)?
            .into_iter()
            .next()
            .ok_or(Error::NotFound)
    }

    fn find_query<T: Record>(&self, query: &Query) -> Result<Vec<T>> {
        let collection = collection_for::<T>(query)?;
        let schema = Schema::of::<T>()?;
        let rows = self.lifecycle.run("find", |b| {
            b.ensure_collection(&collection, &schema)?;
            let routed = Query {
                filter: b.routed_filter(query),
                ..query.clone()
            };
            b.find(&collection, &routed)
        })?;
        rows.iter().map(from_dbm::<T>).collect()
    }

    /// Counts records matching `filter`; paging directives are ignored.
    ///
    /// # Errors
    ///
    /// Returns directive, translation or driver errors.
    #[instrument(skip(self, filter), fields(operation = "count"))]
    pub fn count<T: Record>(&self, filter: &Dbm) -> Result<u64> {
        let query = Query::parse(filter)?;
        let collection = collection_for::<T>(&query)?;
        self.lifecycle
            .run("count", |b| b.count(&collection, &b.routed_filter(&query)))
    }

    /// Writes every field of `row` to the single row it targets.
    ///
    /// The target is `filters[0]` when given, otherwise the row identifier.
    ///
    /// # Errors
    ///
    /// - [`Error::MultipleFilterForSingleRow`] for more than one filter
    /// - [`Error::NoFilter`] with neither a filter nor an identifier
    /// - [`Error::NotFound`] when nothing matched
    #[instrument(skip(self, row, filters), fields(operation = "update"))]
    pub fn update<T: Record>(&self, row: &T, filters: &[Dbm]) -> Result<()> {
        if filters.len() > 1 {
            return Err(Error::MultipleFilterForSingleRow);
        }
        let query = row_query(row, filters.first())?;
        let collection = resolve_collection(query.collection.as_deref(), row)?;
        let schema = Schema::of::<T>()?;
        let update = row_update(row)?;

        let matched = self.lifecycle.run("update", |b| {
            b.ensure_collection(&collection, &schema)?;
            b.update(&collection, &b.routed_filter(&query), &update, false)
        })?;
        if matched == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Applies `update` to every record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GlobalUpdateNotAllowed`] for an empty filter unless
    /// `allow_global_update` is set.
    #[instrument(skip(self, filter, update), fields(operation = "update_all"))]
    pub fn update_all<T: Record>(
        &self,
        filter: &Dbm,
        update: &Dbm,
        allow_global_update: bool,
    ) -> Result<u64> {
        let query = Query::parse(filter)?;
        if is_global(&query.filter) && !allow_global_update {
            return Err(Error::GlobalUpdateNotAllowed);
        }
        let collection = collection_for::<T>(&query)?;
        let schema = Schema::of::<T>()?;
        self.lifecycle.run("update_all", |b| {
            b.ensure_collection(&collection, &schema)?;
            b.update(&collection, &b.routed_filter(&query), update, true)
        })
    }

    /// Updates the first record matching `filter`, or inserts `row` merged
    /// with the filter's equality fields and `update`. The stored record is
    /// copied back into `row`.
    ///
    /// An identifier already set on `row` is kept on insert.
    ///
    /// # Errors
    ///
    /// Returns directive, translation, mapping or driver errors.
    #[instrument(skip(self, row, filter, update), fields(operation = "upsert"))]
    pub fn upsert<T: Record>(&self, row: &mut T, filter: &Dbm, update: &Dbm) -> Result<()> {
        let query = Query::parse(filter)?;
        let collection = resolve_collection(query.collection.as_deref(), row)?;
        let schema = Schema::of::<T>()?;

        let mut seed = to_dbm(row)?;
        for field in equality_fields(&query.filter).keys() {
            seed.remove(field);
        }
        let id = row.id().unwrap_or_default();
        seed.insert(ID_FIELD.to_string(), Value::Id(id));

        let stored = self.lifecycle.run("upsert", |b| {
            b.ensure_collection(&collection, &schema)?;
            b.upsert(&collection, &b.routed_filter(&query), update, &seed)
        })?;
        *row = from_dbm(&stored)?;
        Ok(())
    }

    /// Writes each row to the record it targets, in one batch.
    ///
    /// With no filters each row targets its identifier; otherwise row `i`
    /// targets `filters[i]`. Relational backends apply the batch atomically.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyRowSet`] when `rows` is empty
    /// - [`Error::RowFilterCountMismatch`] when the filter count is neither
    ///   zero nor `rows.len()`
    /// - [`Error::InvalidIdentifier`] for a row without identifier when no
    ///   filters are given
    #[instrument(skip(self, rows, filters), fields(operation = "bulk_update", rows = rows.len()))]
    pub fn bulk_update<T: Record>(&self, rows: &[T], filters: &[Dbm]) -> Result<u64> {
        if rows.is_empty() {
            return Err(Error::EmptyRowSet);
        }
        if !filters.is_empty() && filters.len() != rows.len() {
            return Err(Error::RowFilterCountMismatch {
                rows: rows.len(),
                filters: filters.len(),
            });
        }

        let mut queries = Vec::with_capacity(rows.len());
        let mut updates = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let query = match filters.get(i) {
                Some(filter) => Query::parse(filter)?,
                None => Query::by_id(row.id().ok_or_else(|| {
                    Error::InvalidIdentifier(format!("row {i} has no identifier"))
                })?),
            };
            queries.push(query);
            updates.push(row_update(row)?);
        }
        let explicit = queries.iter().find_map(|q| q.collection.as_deref());
        let collection = match rows.first() {
            Some(first) => resolve_collection(explicit, first)?,
            None => return Err(Error::EmptyRowSet),
        };
        let schema = Schema::of::<T>()?;

        self.lifecycle.run("bulk_update", |b| {
            b.ensure_collection(&collection, &schema)?;
            let pairs: Vec<(Dbm, Dbm)> = queries
                .iter()
                .zip(updates)
                .map(|(q, u)| (b.routed_filter(q), u))
                .collect();
            b.bulk_update(&collection, &pairs)
        })
    }

    /// Deletes the single record targeted by `filter`, or by the row
    /// identifier when no filter is given.
    ///
    /// # Errors
    ///
    /// - [`Error::NoFilter`] with neither a filter nor an identifier
    /// - [`Error::NotFound`] when nothing matched
    #[instrument(skip(self, row, filter), fields(operation = "delete"))]
    pub fn delete<T: Record>(&self, row: &T, filter: Option<&Dbm>) -> Result<()> {
        let query = row_query(row, filter)?;
        let collection = resolve_collection(query.collection.as_deref(), row)?;
        let removed = self
            .lifecycle
            .run("delete", |b| b.delete(&collection, &b.routed_filter(&query), false))?;
        if removed == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Deletes every record matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GlobalUpdateNotAllowed`] for an empty filter unless
    /// `allow_global_delete` is set.
    #[instrument(skip(self, filter), fields(operation = "delete_all"))]
    pub fn delete_all<T: Record>(&self, filter: &Dbm, allow_global_delete: bool) -> Result<u64> {
        let query = Query::parse(filter)?;
        if is_global(&query.filter) && !allow_global_delete {
            return Err(Error::GlobalUpdateNotAllowed);
        }
        let collection = collection_for::<T>(&query)?;
        self.lifecycle
            .run("delete_all", |b| b.delete(&collection, &b.routed_filter(&query), true))
    }

    /// Creates an index on `collection`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyIndexKeys`] or [`Error::ComposedTtlIndex`]
    /// before contacting the backend, otherwise driver errors.
    #[instrument(skip(self, index), fields(operation = "create_index"))]
    pub fn create_index(&self, collection: &str, index: &IndexDescriptor) -> Result<()> {
        index.validate()?;
        self.lifecycle
            .run("create_index", |b| b.create_index(collection, index))
    }

    /// Lists the indexes of `collection`, excluding the identifier index.
    ///
    /// # Errors
    ///
    /// Returns driver errors.
    pub fn get_indexes(&self, collection: &str) -> Result<Vec<IndexDescriptor>> {
        self.lifecycle
            .run("get_indexes", |b| b.get_indexes(collection))
    }
}

fn collection_for<T: Record>(query: &Query) -> Result<String> {
    resolve_collection(query.collection.as_deref(), &T::default())
}

/// Builds the single-row target: the filter when given, else the identifier.
fn row_query<T: Record>(row: &T, filter: Option<&Dbm>) -> Result<Query> {
    let mut query = filter.map(Query::parse).transpose()?.unwrap_or_default();
    if query.filter.is_empty() {
        let id = row.id().ok_or(Error::NoFilter)?;
        query.filter.insert(ID_FIELD.to_string(), Value::Id(id));
    }
    Ok(query)
}

/// The record's fields as a `$set`, without the identifier.
fn row_update<T: Record>(row: &T) -> Result<Dbm> {
    let mut update = to_dbm(row)?;
    update.remove(ID_FIELD);
    Ok(update)
}
