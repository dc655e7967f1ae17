//! `SQLite` backend.
//!
//! ## Module Structure
//!
//! - [`connection`]: opening, pragmas, lock acquisition and the `regexp` function
//! - `backend`: the [`SqliteConnector`] and the [`SqliteBackend`] session
//! - `rows`: column decoding and on-demand column creation
//! - `upsert`: update-or-insert and multi-row update inside one transaction
//! - `index`: index creation and listing, TTL metadata and expiry
//!
//! Tables are created lazily: the first write to a collection creates a
//! table keyed by `_id`, and columns are added as new fields appear. Column
//! types are left open, so values keep the storage class they were bound with.

mod backend;
pub mod connection;
mod index;
mod rows;
mod upsert;

pub use backend::{SqliteBackend, SqliteConnector};
pub use connection::{acquire_lock, configure_connection};

use std::path::PathBuf;

/// Backend label used in logs and metrics.
pub(crate) const BACKEND: &str = "sqlite";

/// Resolves a connection string to a database file; `None` is in-memory.
///
/// Accepted forms: `sqlite::memory:`, `:memory:`, `sqlite://<path>`,
/// `sqlite:<path>`, `file:<uri>` and bare paths.
#[must_use]
pub fn database_path(url: &str) -> Option<PathBuf> {
    let url = url.trim();
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    if rest.is_empty() || rest == ":memory:" {
        return None;
    }
    Some(PathBuf::from(rest))
}
