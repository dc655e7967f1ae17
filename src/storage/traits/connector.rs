//! Connector trait.

use super::Backend;
use crate::config::{BackendKind, ClientOpts};
use crate::storage::tls::TlsMaterial;
use crate::Result;
use std::sync::Arc;

/// Dials new sessions for one backend kind.
///
/// The lifecycle manager owns a connector and calls it on connect and on
/// every reconnect with the same options.
pub trait Connector: Send + Sync {
    /// Returns the backend kind this connector dials.
    fn kind(&self) -> BackendKind;

    /// Opens a session. Implementations must honor `opts.timeout()`.
    ///
    /// # Errors
    ///
    /// Returns the driver error when the session cannot be established.
    fn connect(&self, opts: &ClientOpts, tls: Option<&TlsMaterial>) -> Result<Arc<dyn Backend>>;
}
