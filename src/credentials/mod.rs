//! Transport credentials for the RPC listener.
//!
//! Two variants are selected at startup and thereafter opaque to the rest of
//! the server: a static certificate/key pair loaded once, or managed issuance
//! with transparent background renewal. Either way the listener reads the
//! current certificate through [`CredentialHandle`], an atomically swapped
//! read-only handle consulted once per TLS handshake — a handshake never
//! observes a missing credential and never blocks on renewal I/O.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;

pub mod managed;
pub mod static_files;

pub use managed::{CertificateAuthority, ManagedCredentials, SelfSignedAuthority};

/// Failure to obtain or interpret credential material.
///
/// Fatal at startup; after startup, renewal failures are retried by the
/// managed provider while the last-known-good credential keeps serving.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Reading or writing credential files failed
    #[error("could not access {}: {source}", path.display())]
    Io {
        /// The file involved
        path: PathBuf,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
    },
    /// PEM input contained no certificate
    #[error("no certificate found in the provided pem data")]
    MissingCertificate,
    /// PEM input contained no private key
    #[error("no private key found in the provided pem data")]
    MissingKey,
    /// The private key is not usable for signing
    #[error("unusable private key: {0}")]
    InvalidKey(String),
    /// The certificate authority refused or failed to issue
    #[error("certificate issuance failed: {0}")]
    Issuance(String),
}

/// Atomically swapped server certificate, read once per TLS handshake.
pub struct CredentialHandle {
    current: RwLock<Arc<CertifiedKey>>,
}

impl CredentialHandle {
    /// Wraps an initial credential.
    pub fn new(initial: CertifiedKey) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(initial)),
        })
    }

    /// Replaces the served credential. In-flight handshakes keep the
    /// certificate they already resolved.
    pub fn swap(&self, next: CertifiedKey) {
        let mut slot = self.current.write().expect("credential lock poisoned");
        *slot = Arc::new(next);
    }

    /// The credential currently being served.
    pub fn current(&self) -> Arc<CertifiedKey> {
        self.current
            .read()
            .expect("credential lock poisoned")
            .clone()
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialHandle")
    }
}

impl ResolvesServerCert for CredentialHandle {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

/// The provider variant chosen at startup.
pub enum Credentials {
    /// Certificate/key pair loaded from disk, never rotated
    Static(Arc<CredentialHandle>),
    /// Managed issuance with background renewal
    Managed(ManagedCredentials),
}

impl Credentials {
    /// The handle the listener resolves certificates through.
    pub fn handle(&self) -> Arc<CredentialHandle> {
        match self {
            Credentials::Static(handle) => handle.clone(),
            Credentials::Managed(managed) => managed.handle(),
        }
    }

    /// Stops any background renewal activity.
    pub async fn shutdown(self) {
        if let Credentials::Managed(managed) = self {
            managed.shutdown().await;
        }
    }
}

/// Builds a rustls server config serving certificates from the handle,
/// restricted to HTTP/2 for the gRPC listener.
pub fn server_config(
    handle: Arc<CredentialHandle>,
) -> Result<Arc<rustls::ServerConfig>, CredentialError> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(handle);

    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}

/// Assembles a [`CertifiedKey`] from PEM-encoded certificate chain and key.
pub(crate) fn certified_key_from_pem(
    cert_pem: &str,
    key_pem: &str,
) -> Result<CertifiedKey, CredentialError> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| CredentialError::MissingCertificate)?;

    if certs.is_empty() {
        return Err(CredentialError::MissingCertificate);
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|_| CredentialError::MissingKey)?
        .ok_or(CredentialError::MissingKey)?;

    let signer = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

    Ok(CertifiedKey::new(certs, signer))
}

pub(crate) fn read_pem(path: &Path) -> Result<String, CredentialError> {
    std::fs::read_to_string(path).map_err(|source| CredentialError::Io {
        path: path.to_owned(),
        source,
    })
}
