//! Backend factory for storage layer initialization.
//!
//! This module centralizes connector selection so the store, tests and
//! embedding applications pick backends the same way:
//!
//! ```text
//! BackendFactory
//!   ├── connector(kind) → Arc<dyn Connector>
//!   └── lifecycle(opts) → LifecycleManager (connected)
//! ```

use crate::Result;
use crate::config::{BackendKind, ClientOpts};
use crate::storage::{Connector, LifecycleManager, MongoConnector, SqliteConnector};
use std::sync::Arc;
use tracing::info;

/// Factory for creating storage backends.
pub struct BackendFactory;

impl BackendFactory {
    /// Returns the connector for a backend kind.
    ///
    /// The `MongoDB` connector is always returned; without the `mongodb`
    /// feature it fails on connect.
    #[must_use]
    pub fn connector(kind: BackendKind) -> Arc<dyn Connector> {
        match kind {
            BackendKind::Sqlite => Arc::new(SqliteConnector),
            BackendKind::MongoDb => Arc::new(MongoConnector),
        }
    }

    /// Builds a lifecycle manager for `opts` and connects it.
    ///
    /// # Errors
    ///
    /// Returns option validation errors or the connect failure.
    pub fn lifecycle(opts: ClientOpts) -> Result<LifecycleManager> {
        let kind = opts.backend_kind()?;
        let manager = LifecycleManager::new(Self::connector(kind));
        manager.connect(opts)?;
        info!(backend = %kind, "Storage backend ready");
        Ok(manager)
    }
}
