//! TLS material loading.
//!
//! Files are read and sanity-checked once at connect time so a bad path or a
//! non-PEM file fails fast with [`Error::TlsConfig`] instead of surfacing as
//! an opaque handshake error. Chain validation is left to the driver.

use crate::config::TlsSettings;
use crate::{Error, Result};
use std::path::{Path, PathBuf};

const PEM_BEGIN: &str = "-----BEGIN ";
const PEM_PRIVATE_KEY: &str = "PRIVATE KEY-----";

/// Validated TLS material handed to network connectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    /// Trusted CA bundle.
    pub ca_file: Option<PathBuf>,
    /// Client certificate and private key as one PEM document.
    pub client_pem: Option<String>,
    /// Path the client certificate came from, when it already held the key.
    pub client_pem_file: Option<PathBuf>,
    /// Accept any server certificate.
    pub skip_verify: bool,
    /// Accept a host-name mismatch.
    pub allow_invalid_hostname: bool,
}

impl TlsMaterial {
    /// Loads material for enabled settings; returns `None` when TLS is off.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TlsConfig`] when a file is unreadable, is not PEM, or
    /// no private key accompanies the client certificate.
    pub fn load(settings: &TlsSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }

        let ca_file = match &settings.ca_file {
            Some(path) => {
                read_pem(path, "CA")?;
                Some(path.clone())
            },
            None => None,
        };

        let (client_pem, client_pem_file) = match (&settings.cert_file, &settings.key_file) {
            (None, None) => (None, None),
            (None, Some(_)) => {
                return Err(Error::TlsConfig(
                    "key file given without a certificate file".to_string(),
                ));
            },
            (Some(cert_path), None) => {
                let cert = read_pem(cert_path, "certificate")?;
                if !cert.contains(PEM_PRIVATE_KEY) {
                    return Err(Error::TlsConfig(format!(
                        "certificate file {} holds no private key and no key file was given",
                        cert_path.display()
                    )));
                }
                (Some(cert), Some(cert_path.clone()))
            },
            (Some(cert_path), Some(key_path)) => {
                let cert = read_pem(cert_path, "certificate")?;
                let key = read_pem(key_path, "key")?;
                if !key.contains(PEM_PRIVATE_KEY) {
                    return Err(Error::TlsConfig(format!(
                        "key file {} holds no private key",
                        key_path.display()
                    )));
                }
                (Some(format!("{}\n{}", cert.trim_end(), key)), None)
            },
        };

        Ok(Some(Self {
            ca_file,
            client_pem,
            client_pem_file,
            skip_verify: settings.skip_verify,
            allow_invalid_hostname: settings.allow_invalid_hostname,
        }))
    }
}

fn read_pem(path: &Path, what: &str) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::TlsConfig(format!("cannot read {what} file {}: {e}", path.display()))
    })?;
    if !contents.contains(PEM_BEGIN) {
        return Err(Error::TlsConfig(format!(
            "{what} file {} is not PEM encoded",
            path.display()
        )));
    }
    Ok(contents)
}
