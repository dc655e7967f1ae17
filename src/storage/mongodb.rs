//! `MongoDB` backend.
//!
//! Also serves API-compatible managed services (Cosmos DB, `DocumentDB`);
//! [`Backend::db_type`] tells them apart.
//!
//! The driver is asynchronous. Each session owns a small multi-threaded
//! `tokio` runtime that hosts the driver's monitor tasks, and every call is
//! driven to completion with `block_on`. Calling into a session from inside
//! another async runtime returns an error instead of blocking it.

#[cfg(feature = "mongodb")]
mod implementation {
    use crate::config::{BackendKind, ClientOpts, Consistency, redact_url};
    use crate::models::{Dbm, ID_FIELD, IndexDescriptor, IndexKey, IndexKind};
    use crate::observability::{record_operation_metrics, status_label};
    use crate::query::document::{
        compile_filter, compile_sort, compile_update, compile_upsert, from_document, to_document,
    };
    use crate::query::{Query, equality_fields};
    use crate::storage::tls::TlsMaterial;
    use crate::storage::traits::{Backend, Connector, DbType};
    use crate::{Error, Result};
    use bson::{Bson, Document, doc};
    use mongodb::error::ErrorKind;
    use mongodb::options::{
        ClientOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReadPreference,
        ReadPreferenceOptions, ReturnDocument, SelectionCriteria, Tls, TlsOptions, UpdateOptions,
    };
    use mongodb::{Client, Collection, Database, IndexModel};
    use std::future::Future;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::NamedTempFile;
    use tokio::runtime::{Handle, Runtime};
    use tracing::{debug, instrument};

    const BACKEND: &str = "mongodb";

    /// Database used when neither the options nor the URL name one.
    const DEFAULT_DATABASE: &str = "test";

    /// Server codes meaning "no such command", reported by managed services
    /// that do not implement `buildInfo`.
    const COMMAND_NOT_FOUND_CODES: [i32; 2] = [59, 115];

    const COSMOS_MARKERS: [&str; 2] = ["cosmos.azure.com", "documents.azure.com"];
    const DOCUMENTDB_MARKER: &str = "docdb.amazonaws.com";

    fn read_preference(consistency: Consistency) -> ReadPreference {
        match consistency {
            Consistency::Strong => ReadPreference::Primary,
            Consistency::Monotonic => ReadPreference::PrimaryPreferred {
                options: ReadPreferenceOptions::default(),
            },
            Consistency::Eventual => ReadPreference::Nearest {
                options: ReadPreferenceOptions::default(),
            },
        }
    }

    /// Builds driver TLS options; a combined client PEM is written to a
    /// temporary file that must outlive the client.
    fn tls_options(material: &TlsMaterial) -> Result<(TlsOptions, Option<NamedTempFile>)> {
        let mut pem_file = None;
        let cert_key_path = match (&material.client_pem_file, &material.client_pem) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(pem)) => {
                let mut file = NamedTempFile::new()?;
                file.write_all(pem.as_bytes())?;
                file.flush()?;
                let path = file.path().to_path_buf();
                pem_file = Some(file);
                Some(path)
            },
            (None, None) => None,
        };
        // The rustls stack has no separate host-name switch.
        let options = TlsOptions::builder()
            .allow_invalid_certificates(material.skip_verify || material.allow_invalid_hostname)
            .ca_file_path(material.ca_file.clone())
            .cert_key_file_path(cert_key_path)
            .build();
        Ok((options, pem_file))
    }

    /// Classifies a managed service from its connection string.
    fn db_type_from_url(url: &str) -> Option<DbType> {
        let lower = url.to_lowercase();
        if COSMOS_MARKERS.iter().any(|m| lower.contains(m)) {
            Some(DbType::CosmosDb)
        } else if lower.contains(DOCUMENTDB_MARKER) {
            Some(DbType::DocumentDb)
        } else {
            None
        }
    }

    fn index_descriptor(model: IndexModel) -> IndexDescriptor {
        let keys = model
            .keys
            .into_iter()
            .map(|(field, value)| {
                let kind = match value {
                    Bson::String(kind) => IndexKind::Special(kind),
                    Bson::Int32(n) => IndexKind::from_ordinal(i64::from(n)),
                    Bson::Int64(n) => IndexKind::from_ordinal(n),
                    #[allow(clippy::cast_possible_truncation)]
                    Bson::Double(n) => IndexKind::from_ordinal(n as i64),
                    _ => IndexKind::Ascending,
                };
                IndexKey { field, kind }
            })
            .collect();
        let options = model.options.unwrap_or_default();
        IndexDescriptor {
            name: options.name,
            keys,
            background: options.background.unwrap_or(false),
            ttl_seconds: options.expire_after.map(|d| d.as_secs()),
        }
    }

    fn index_model(index: &IndexDescriptor) -> IndexModel {
        let keys: Document = index
            .keys
            .iter()
            .map(|k| {
                let value = match &k.kind {
                    IndexKind::Special(kind) => Bson::String(kind.clone()),
                    kind => Bson::Int32(kind.ordinal().unwrap_or(1)),
                };
                (k.field.clone(), value)
            })
            .collect();
        let options = IndexOptions::builder()
            .name(index.resolved_name())
            .background(index.background.then_some(true))
            .expire_after(index.ttl_seconds.map(Duration::from_secs))
            .build();
        IndexModel::builder().keys(keys).options(options).build()
    }

    /// Dials [`MongoBackend`] sessions.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MongoConnector;

    impl Connector for MongoConnector {
        fn kind(&self) -> BackendKind {
            BackendKind::MongoDb
        }

        fn connect(
            &self,
            opts: &ClientOpts,
            tls: Option<&TlsMaterial>,
        ) -> Result<Arc<dyn Backend>> {
            Ok(Arc::new(MongoBackend::connect(opts, tls)?))
        }
    }

    /// `MongoDB` session.
    pub struct MongoBackend {
        runtime: Runtime,
        client: Client,
        database: Database,
        url: String,
        closed: AtomicBool,
        _client_pem: Option<NamedTempFile>,
    }

    impl std::fmt::Debug for MongoBackend {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MongoBackend")
                .field("url", &redact_url(&self.url))
                .field("database", &self.database.name())
                .finish_non_exhaustive()
        }
    }

    impl MongoBackend {
        /// Connects with `opts`, honoring the connect timeout for both the
        /// socket and server selection.
        ///
        /// # Errors
        ///
        /// Returns an error if the runtime cannot start, the URL does not
        /// parse, or the client cannot be created.
        pub fn connect(opts: &ClientOpts, tls: Option<&TlsMaterial>) -> Result<Self> {
            if Handle::try_current().is_ok() {
                return Err(nested_runtime_error("connect"));
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("polystore-mongodb")
                .enable_all()
                .build()?;

            let mut options = runtime.block_on(ClientOptions::parse(&opts.url))?;
            options.connect_timeout = Some(opts.timeout());
            options.server_selection_timeout = Some(opts.timeout());
            if opts.direct {
                options.direct_connection = Some(true);
            }
            options.selection_criteria = Some(SelectionCriteria::ReadPreference(
                read_preference(opts.consistency),
            ));
            options.app_name.get_or_insert_with(|| "polystore".to_string());

            let mut client_pem = None;
            if let Some(material) = tls {
                let (tls_options, pem_file) = tls_options(material)?;
                options.tls = Some(Tls::Enabled(tls_options));
                client_pem = pem_file;
            }

            let database_name = opts
                .database
                .clone()
                .or_else(|| options.default_database.clone())
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

            let client = {
                let _guard = runtime.enter();
                Client::with_options(options)?
            };
            let database = client.database(&database_name);
            debug!(url = %redact_url(&opts.url), database = %database_name, "Created MongoDB client");

            Ok(Self {
                runtime,
                client,
                database,
                url: opts.url.clone(),
                closed: AtomicBool::new(false),
                _client_pem: client_pem,
            })
        }

        fn collection(&self, name: &str) -> Collection<Document> {
            self.database.collection(name)
        }

        /// Drives `f` on the session runtime.
        fn block_on<F, T>(&self, operation: &str, f: F) -> Result<T>
        where
            F: Future<Output = Result<T>>,
        {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::SessionClosed);
            }
            if Handle::try_current().is_ok() {
                return Err(nested_runtime_error(operation));
            }
            self.runtime.block_on(f)
        }

        fn observe<T>(&self, operation: &'static str, f: impl Future<Output = Result<T>>) -> Result<T> {
            let start = Instant::now();
            let result = self.block_on(operation, f);
            record_operation_metrics(BACKEND, operation, start, status_label(&result));
            result
        }
    }

    fn nested_runtime_error(operation: &str) -> Error {
        Error::OperationFailed {
            operation: format!("mongodb_{operation}"),
            cause: "blocking call made from inside an async runtime".to_string(),
        }
    }

    impl Backend for MongoBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::MongoDb
        }

        #[instrument(skip(self), fields(operation = "ping", backend = BACKEND))]
        fn ping(&self) -> Result<()> {
            self.observe("ping", async {
                self.database.run_command(doc! { "ping": 1 }, None).await?;
                Ok(())
            })
        }

        #[instrument(skip(self), fields(operation = "db_type", backend = BACKEND))]
        fn db_type(&self) -> Result<DbType> {
            self.observe("db_type", async {
                match self.database.run_command(doc! { "buildInfo": 1 }, None).await {
                    Ok(_) => Ok(db_type_from_url(&self.url).unwrap_or(DbType::MongoDb)),
                    Err(e) => match e.kind.as_ref() {
                        ErrorKind::Command(c) if COMMAND_NOT_FOUND_CODES.contains(&c.code) => {
                            Ok(DbType::CosmosDb)
                        },
                        _ => Err(e.into()),
                    },
                }
            })
        }

        fn routed_filter(&self, query: &Query) -> Dbm {
            query.routed_filter()
        }

        #[instrument(skip(self, row), fields(operation = "insert", backend = BACKEND))]
        fn insert(&self, collection: &str, row: &Dbm) -> Result<()> {
            let mut document = to_document(row);
            if let Some(id) = row.get(ID_FIELD) {
                document.insert(ID_FIELD, bson::oid::ObjectId::from(id.to_identifier()?));
            }
            self.observe("insert", async {
                self.collection(collection).insert_one(document, None).await?;
                Ok(())
            })
        }

        #[instrument(skip(self, query), fields(operation = "find", backend = BACKEND))]
        fn find(&self, collection: &str, query: &Query) -> Result<Vec<Dbm>> {
            let filter = compile_filter(&self.routed_filter(query))?;
            let sort = compile_sort(&query.sort);
            let options = FindOptions::builder()
                .sort((!sort.is_empty()).then_some(sort))
                .limit(query.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
                .skip(query.offset)
                .build();
            self.observe("find", async {
                let mut cursor = self.collection(collection).find(filter, options).await?;
                let mut rows = Vec::new();
                while cursor.advance().await? {
                    rows.push(from_document(cursor.deserialize_current()?));
                }
                Ok(rows)
            })
        }

        #[instrument(skip(self, filter), fields(operation = "count", backend = BACKEND))]
        fn count(&self, collection: &str, filter: &Dbm) -> Result<u64> {
            let filter = compile_filter(filter)?;
            self.observe("count", async {
                Ok(self
                    .collection(collection)
                    .count_documents(filter, None)
                    .await?)
            })
        }

        #[instrument(skip(self, filter, update), fields(operation = "update", backend = BACKEND))]
        fn update(&self, collection: &str, filter: &Dbm, update: &Dbm, multi: bool) -> Result<u64> {
            let filter = compile_filter(filter)?;
            let update = compile_update(update)?;
            self.observe("update", async {
                let coll = self.collection(collection);
                let result = if multi {
                    coll.update_many(filter, update, None).await?
                } else {
                    coll.update_one(filter, update, None).await?
                };
                Ok(result.matched_count)
            })
        }

        #[instrument(skip(self, filter, update, seed), fields(operation = "upsert", backend = BACKEND))]
        fn upsert(&self, collection: &str, filter: &Dbm, update: &Dbm, seed: &Dbm) -> Result<Dbm> {
            let mut seed = seed.clone();
            if equality_fields(filter).contains_key(ID_FIELD) {
                seed.remove(ID_FIELD);
            }
            let compiled_filter = compile_filter(filter)?;
            let mut compiled_update = compile_upsert(update, &seed)?;
            if let Some(Bson::Document(on_insert)) = compiled_update.get_mut("$setOnInsert") {
                if let Some(id) = seed.get(ID_FIELD) {
                    on_insert.insert(ID_FIELD, bson::oid::ObjectId::from(id.to_identifier()?));
                }
            }
            let options = FindOneAndUpdateOptions::builder()
                .upsert(true)
                .return_document(ReturnDocument::After)
                .build();
            self.observe("upsert", async {
                let stored = self
                    .collection(collection)
                    .find_one_and_update(compiled_filter, compiled_update, options)
                    .await?
                    .ok_or(Error::NotFound)?;
                Ok(from_document(stored))
            })
        }

        #[instrument(skip(self, pairs), fields(operation = "bulk_update", backend = BACKEND, count = pairs.len()))]
        fn bulk_update(&self, collection: &str, pairs: &[(Dbm, Dbm)]) -> Result<u64> {
            let compiled = pairs
                .iter()
                .map(|(filter, update)| Ok((compile_filter(filter)?, compile_update(update)?)))
                .collect::<Result<Vec<_>>>()?;
            self.observe("bulk_update", async {
                let coll = self.collection(collection);
                let mut matched = 0;
                for (filter, update) in compiled {
                    let options = UpdateOptions::builder().upsert(false).build();
                    matched += coll.update_one(filter, update, options).await?.matched_count;
                }
                Ok(matched)
            })
        }

        #[instrument(skip(self, filter), fields(operation = "delete", backend = BACKEND))]
        fn delete(&self, collection: &str, filter: &Dbm, multi: bool) -> Result<u64> {
            let filter = compile_filter(filter)?;
            self.observe("delete", async {
                let coll = self.collection(collection);
                let result = if multi {
                    coll.delete_many(filter, None).await?
                } else {
                    coll.delete_one(filter, None).await?
                };
                Ok(result.deleted_count)
            })
        }

        #[instrument(skip(self, index), fields(operation = "create_index", backend = BACKEND))]
        fn create_index(&self, collection: &str, index: &IndexDescriptor) -> Result<()> {
            index.validate()?;
            let model = index_model(index);
            self.observe("create_index", async {
                self.collection(collection).create_index(model, None).await?;
                Ok(())
            })
        }

        #[instrument(skip(self), fields(operation = "get_indexes", backend = BACKEND))]
        fn get_indexes(&self, collection: &str) -> Result<Vec<IndexDescriptor>> {
            self.observe("get_indexes", async {
                let mut cursor = match self.collection(collection).list_indexes(None).await {
                    Ok(cursor) => cursor,
                    // NamespaceNotFound: the collection does not exist yet.
                    Err(e) if matches!(e.kind.as_ref(), ErrorKind::Command(c) if c.code == 26) => {
                        return Ok(Vec::new());
                    },
                    Err(e) => return Err(e.into()),
                };
                let mut out = Vec::new();
                while cursor.advance().await? {
                    let descriptor = index_descriptor(cursor.deserialize_current()?);
                    if descriptor.name.as_deref() != Some("_id_") {
                        out.push(descriptor);
                    }
                }
                out.sort_by_key(IndexDescriptor::resolved_name);
                Ok(out)
            })
        }

        fn close(&self) -> Result<()> {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            if Handle::try_current().is_ok() {
                return Err(nested_runtime_error("close"));
            }
            self.runtime.block_on(self.client.clone().shutdown());
            debug!("Closed MongoDB client");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_db_type_from_url() {
            assert_eq!(
                db_type_from_url("mongodb://u:p@acct.mongo.cosmos.azure.com:10255/"),
                Some(DbType::CosmosDb)
            );
            assert_eq!(
                db_type_from_url("mongodb://cluster.docdb.amazonaws.com:27017"),
                Some(DbType::DocumentDb)
            );
            assert_eq!(db_type_from_url("mongodb://localhost"), None);
        }

        #[test]
        fn test_index_model_roundtrip() {
            let idx = IndexDescriptor::from_keys(&["name", "-age", "$text:bio"]).unwrap();
            let back = index_descriptor(index_model(&idx));
            assert_eq!(back.keys, idx.keys);
            assert_eq!(back.name.as_deref(), Some("name_1_age_-1_bio_text"));

            let ttl = IndexDescriptor::from_keys(&["at"]).unwrap().with_ttl(30);
            assert_eq!(index_descriptor(index_model(&ttl)).ttl_seconds, Some(30));
        }

        #[test]
        fn test_read_preference_mapping() {
            assert!(matches!(
                read_preference(Consistency::Strong),
                ReadPreference::Primary
            ));
            assert!(matches!(
                read_preference(Consistency::Eventual),
                ReadPreference::Nearest { .. }
            ));
        }

        #[test]
        fn test_combined_pem_is_written_to_temp_file() {
            let material = TlsMaterial {
                client_pem: Some("-----BEGIN CERTIFICATE-----\n".to_string()),
                ..TlsMaterial::default()
            };
            let (options, file) = tls_options(&material).unwrap();
            let file = file.unwrap();
            assert_eq!(options.cert_key_file_path.as_deref(), Some(file.path()));
        }
    }
}

#[cfg(feature = "mongodb")]
pub use implementation::{MongoBackend, MongoConnector};

#[cfg(not(feature = "mongodb"))]
mod stub {
    use crate::Result;
    use crate::config::{BackendKind, ClientOpts};
    use crate::storage::tls::TlsMaterial;
    use crate::storage::traits::{Backend, Connector};
    use crate::Error;
    use std::sync::Arc;

    /// Stub connector when the `mongodb` feature is not enabled.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MongoConnector;

    impl Connector for MongoConnector {
        fn kind(&self) -> BackendKind {
            BackendKind::MongoDb
        }

        fn connect(
            &self,
            _opts: &ClientOpts,
            _tls: Option<&TlsMaterial>,
        ) -> Result<Arc<dyn Backend>> {
            Err(Error::OperationFailed {
                operation: "mongodb_connect".to_string(),
                cause: "built without the `mongodb` feature".to_string(),
            })
        }
    }
}

#[cfg(not(feature = "mongodb"))]
pub use stub::MongoConnector;
