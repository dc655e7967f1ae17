//! Connection lifecycle.
//!
//! ```text
//! Disconnected ──connect──> Connecting ──ok──> Connected ──close──> Closed
//!       ^                        │                 │  ^
//!       └────────failure─────────┘       transient │  │ redial ok
//!       ^                                          v  │
//!       └──────────redial failed─────────── Reconnecting
//! ```
//!
//! The live session is an `Arc<dyn Backend>` behind an `RwLock`. Operations
//! clone the `Arc` and release the lock before touching the driver, so a
//! reconnect never waits on in-flight calls.

use super::resilience::is_transient_error;
use super::tls::TlsMaterial;
use super::traits::{Backend, Connector, DbType};
use crate::config::ClientOpts;
use crate::observability::record_reconnect;
use crate::{Error, Result};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, instrument, warn};

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; `connect` may be called.
    Disconnected,
    /// Dialing.
    Connecting,
    /// A live session is available.
    Connected,
    /// The session broke and is being replaced.
    Reconnecting,
    /// Closed by the caller.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct Inner {
    state: ConnectionState,
    session: Option<Arc<dyn Backend>>,
    opts: Option<ClientOpts>,
}

/// Owns the live session and replaces it after transient failures.
pub struct LifecycleManager {
    connector: Arc<dyn Connector>,
    inner: RwLock<Inner>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("backend", &self.connector.kind())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a disconnected manager around a connector.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                session: None,
                opts: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.read().state
    }

    /// Connects with `opts`.
    ///
    /// Any failure leaves the manager [`ConnectionState::Disconnected`] and
    /// returns the cause unchanged.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for bad options or when already connected
    /// - [`Error::TlsConfig`] for unusable TLS files
    /// - driver errors from dialing or the liveness probe
    #[instrument(skip(self, opts), fields(backend = %self.connector.kind()))]
    pub fn connect(&self, opts: ClientOpts) -> Result<()> {
        {
            let mut inner = self.write();
            match inner.state {
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    inner.state = ConnectionState::Connecting;
                },
                state => {
                    return Err(Error::InvalidInput(format!(
                        "cannot connect while {state}"
                    )));
                },
            }
        }

        match self.dial(&opts) {
            Ok(session) => {
                let mut inner = self.write();
                inner.session = Some(session);
                inner.opts = Some(opts);
                inner.state = ConnectionState::Connected;
                info!("Connected");
                Ok(())
            },
            Err(e) => {
                self.write().state = ConnectionState::Disconnected;
                warn!(error = %e, "Connect failed");
                Err(e)
            },
        }
    }

    fn dial(&self, opts: &ClientOpts) -> Result<Arc<dyn Backend>> {
        opts.validate()?;
        let tls = TlsMaterial::load(&opts.tls)?;
        let session = self.connector.connect(opts, tls.as_ref())?;
        if let Err(e) = session.ping() {
            let _ = session.close();
            return Err(e);
        }
        Ok(session)
    }

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyClosed`] when there is nothing to close
    /// - the driver error raised while shutting down; the manager is
    ///   [`ConnectionState::Closed`] either way
    #[instrument(skip(self), fields(backend = %self.connector.kind()))]
    pub fn close(&self) -> Result<()> {
        let session = {
            let mut inner = self.write();
            if matches!(
                inner.state,
                ConnectionState::Disconnected | ConnectionState::Closed
            ) {
                return Err(Error::AlreadyClosed);
            }
            inner.state = ConnectionState::Closed;
            inner.session.take()
        };
        info!("Closed");
        session.map_or(Ok(()), |s| s.close())
    }

    /// Returns the live session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] when there is none.
    pub fn session(&self) -> Result<Arc<dyn Backend>> {
        self.read().session.clone().ok_or(Error::SessionClosed)
    }

    /// Runs `f` against the live session.
    ///
    /// A transient failure replaces the session before returning; the
    /// original error is returned either way. Only the caller whose session
    /// is still current redials, and sessions that are not
    /// [`Backend::reconnectable`] are kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] without a session, otherwise whatever
    /// `f` returns.
    pub fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&dyn Backend) -> Result<T>,
    {
        let session = self.session()?;
        let result = f(session.as_ref());
        if let Err(e) = &result {
            if is_transient_error(e) && session.reconnectable() {
                warn!(
                    operation,
                    backend = %self.connector.kind(),
                    error = %e,
                    "Transient storage error, reconnecting"
                );
                self.reconnect(&session);
            } else if is_transient_error(e) {
                warn!(
                    operation,
                    backend = %self.connector.kind(),
                    error = %e,
                    "Transient storage error on a session that cannot be redialed"
                );
            }
        }
        result
    }

    fn reconnect(&self, failed: &Arc<dyn Backend>) {
        let opts = {
            let mut inner = self.write();
            let current = inner
                .session
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, failed));
            if !current || inner.state != ConnectionState::Connected {
                return;
            }
            let Some(opts) = inner.opts.clone() else {
                return;
            };
            inner.state = ConnectionState::Reconnecting;
            opts
        };

        let _ = failed.close();
        let outcome = self.dial(&opts);
        let backend = self.connector.kind().as_str();

        let mut inner = self.write();
        if inner.state != ConnectionState::Reconnecting {
            // Closed while redialing.
            drop(inner);
            if let Ok(session) = outcome {
                let _ = session.close();
            }
            return;
        }
        match outcome {
            Ok(session) => {
                inner.session = Some(session);
                inner.state = ConnectionState::Connected;
                drop(inner);
                record_reconnect(backend, "success");
                info!(backend, "Reconnected");
            },
            Err(e) => {
                inner.session = None;
                inner.state = ConnectionState::Disconnected;
                drop(inner);
                record_reconnect(backend, "error");
                warn!(backend, error = %e, "Reconnect failed");
            },
        }
    }

    /// Liveness probe against the live session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] or the probe's error.
    pub fn ping(&self) -> Result<()> {
        self.run("ping", |b| b.ping())
    }

    /// Probes the server flavor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionClosed`] or the probe's error.
    pub fn db_type(&self) -> Result<DbType> {
        self.run("db_type", |b| b.db_type())
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = inner.session.take() {
            let _ = session.close();
        }
    }
}
