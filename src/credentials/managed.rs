//! Managed certificate issuance with transparent renewal.
//!
//! The managed provider obtains a certificate for the configured domain from
//! a [`CertificateAuthority`], persists it to a cache directory so restarts
//! do not re-enroll, and swaps the served credential through the shared
//! [`CredentialHandle`] from a background task. A renewal failure is logged
//! and retried while the last-known-good certificate keeps serving.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{certified_key_from_pem, CredentialError, CredentialHandle};

/// Delay before retrying a failed renewal.
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// A PEM-encoded certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate chain.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Issues certificates for the listener domain.
///
/// The enrollment protocol behind an implementation is its own concern; the
/// built-in [`SelfSignedAuthority`] covers clusters that trust a private CA.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Obtains a fresh certificate/key pair valid for `domain`.
    async fn issue(&self, domain: &str) -> Result<CertKeyPair, CredentialError>;
}

/// Self-signing authority for private clusters.
#[derive(Debug, Default)]
pub struct SelfSignedAuthority;

impl SelfSignedAuthority {
    /// Creates a new authority.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CertificateAuthority for SelfSignedAuthority {
    async fn issue(&self, domain: &str) -> Result<CertKeyPair, CredentialError> {
        issue_self_signed(domain)
    }
}

fn issue_self_signed(domain: &str) -> Result<CertKeyPair, CredentialError> {
    let issuance = |e: &dyn std::fmt::Display| CredentialError::Issuance(e.to_string());

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "envgrid");
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    params.subject_alt_names.push(SanType::DnsName(
        domain.to_owned().try_into().map_err(|e| issuance(&e))?,
    ));

    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key_pair = KeyPair::generate().map_err(|e| issuance(&e))?;
    let cert = params.self_signed(&key_pair).map_err(|e| issuance(&e))?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Credential provider with background renewal.
pub struct ManagedCredentials {
    handle: Arc<CredentialHandle>,
    shutdown: watch::Sender<bool>,
    renewal: JoinHandle<()>,
}

impl ManagedCredentials {
    /// Loads cached material or performs the initial issuance, then starts
    /// the renewal task. Failure to produce an initial credential is fatal.
    pub async fn start(
        authority: Arc<dyn CertificateAuthority>,
        domain: &str,
        cache_dir: &Path,
        renew_interval: Duration,
    ) -> Result<Self, CredentialError> {
        let key = match load_cached(cache_dir, domain) {
            Some(pair) => match certified_key_from_pem(&pair.cert_pem, &pair.key_pem) {
                Ok(key) => {
                    info!("Reusing cached certificate for {}", domain);
                    key
                }
                Err(e) => {
                    warn!("Cached certificate for {} is unusable ({}), reissuing", domain, e);
                    obtain(authority.as_ref(), domain, cache_dir).await?
                }
            },
            None => obtain(authority.as_ref(), domain, cache_dir).await?,
        };

        let handle = CredentialHandle::new(key);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let renewal = {
            let authority = authority.clone();
            let handle = handle.clone();
            let domain = domain.to_owned();
            let cache_dir = cache_dir.to_owned();

            tokio::spawn(async move {
                let mut wait = renew_interval;

                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            match renew(authority.as_ref(), &domain, &cache_dir, &handle).await {
                                Ok(()) => {
                                    info!("Renewed certificate for {}", domain);
                                    wait = renew_interval;
                                }
                                Err(e) => {
                                    warn!("Certificate renewal for {} failed ({}), retrying", domain, e);
                                    wait = RETRY_DELAY;
                                }
                            }
                        }
                        _ = shutdown_rx.changed() => break,
                    }
                }
            })
        };

        Ok(Self {
            handle,
            shutdown,
            renewal,
        })
    }

    /// The handle the listener resolves certificates through.
    pub fn handle(&self) -> Arc<CredentialHandle> {
        self.handle.clone()
    }

    /// Stops the renewal task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.renewal.await;
    }
}

async fn obtain(
    authority: &dyn CertificateAuthority,
    domain: &str,
    cache_dir: &Path,
) -> Result<rustls::sign::CertifiedKey, CredentialError> {
    let pair = authority.issue(domain).await?;
    persist(cache_dir, domain, &pair)?;

    certified_key_from_pem(&pair.cert_pem, &pair.key_pem)
}

/// One renewal cycle: issue, persist durably, then swap the served credential.
/// The previous certificate serves until the new one is safely cached.
async fn renew(
    authority: &dyn CertificateAuthority,
    domain: &str,
    cache_dir: &Path,
    handle: &CredentialHandle,
) -> Result<(), CredentialError> {
    let key = obtain(authority, domain, cache_dir).await?;
    handle.swap(key);

    Ok(())
}

fn cache_paths(cache_dir: &Path, domain: &str) -> (PathBuf, PathBuf) {
    (
        cache_dir.join(format!("{}.crt", domain)),
        cache_dir.join(format!("{}.key", domain)),
    )
}

fn load_cached(cache_dir: &Path, domain: &str) -> Option<CertKeyPair> {
    let (cert_path, key_path) = cache_paths(cache_dir, domain);

    let cert_pem = std::fs::read_to_string(cert_path).ok()?;
    let key_pem = std::fs::read_to_string(key_path).ok()?;

    Some(CertKeyPair { cert_pem, key_pem })
}

fn persist(cache_dir: &Path, domain: &str, pair: &CertKeyPair) -> Result<(), CredentialError> {
    let io = |path: &Path, source| CredentialError::Io {
        path: path.to_owned(),
        source,
    };

    std::fs::create_dir_all(cache_dir).map_err(|e| io(cache_dir, e))?;

    let (cert_path, key_path) = cache_paths(cache_dir, domain);

    std::fs::write(&cert_path, &pair.cert_pem).map_err(|e| io(&cert_path, e))?;
    std::fs::write(&key_path, &pair.key_pem).map_err(|e| io(&key_path, e))?;

    Ok(())
}

#[cfg(test)]
pub mod test_support {
    //! Helpers shared by credential tests.

    use super::*;

    /// Generates a throwaway self-signed pair.
    pub fn generate_pair(domain: &str) -> CertKeyPair {
        issue_self_signed(domain).expect("self-signed issuance failed")
    }
}
