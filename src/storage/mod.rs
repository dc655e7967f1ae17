//! Storage layer abstraction.
//!
//! This module provides the pieces between the typed store and a driver:
//! - **Traits**: [`Backend`] sessions dialed by a [`Connector`]
//! - **Lifecycle**: [`LifecycleManager`] owns the live session and reconnects
//!   after transient failures classified by [`is_transient_error`]
//! - **Backends**: `SQLite` (always built) and `MongoDB` (the `mongodb` feature)

// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]
// Allow match_same_arms for explicit enum handling.
#![allow(clippy::match_same_arms)]
// Allow redundant_closure_call - metrics wrap closures invoked in place.
#![allow(clippy::redundant_closure_call)]

pub mod lifecycle;
pub mod mongodb;
pub mod resilience;
pub mod sqlite;
pub mod tls;
pub mod traits;

pub use self::mongodb::MongoConnector;
#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoBackend;
pub use lifecycle::{ConnectionState, LifecycleManager};
pub use resilience::{is_transient_error, is_transient_message};
pub use sqlite::{SqliteBackend, SqliteConnector};
pub use tls::TlsMaterial;
pub use traits::{Backend, Connector, DbType};
