//! Static certificate/key pair loaded once at startup, never rotated.

use std::path::Path;
use std::sync::Arc;

use log::info;

use super::{certified_key_from_pem, read_pem, CredentialError, CredentialHandle};

/// Loads a PEM certificate chain and private key from disk.
///
/// Missing or invalid files are fatal — the caller aborts startup.
pub fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<CredentialHandle>, CredentialError> {
    let cert_pem = read_pem(cert_path)?;
    let key_pem = read_pem(key_path)?;

    let key = certified_key_from_pem(&cert_pem, &key_pem)?;

    info!("Loaded TLS credential from {}", cert_path.display());

    Ok(CredentialHandle::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::managed::test_support::generate_pair;

    #[test]
    fn loads_a_valid_pair() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_pair("envgrid.local");

        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");
        std::fs::write(&cert_path, &pair.cert_pem).unwrap();
        std::fs::write(&key_path, &pair.key_pem).unwrap();

        let handle = load(&cert_path, &key_path).unwrap();
        assert!(!handle.current().cert.is_empty());
    }

    #[test]
    fn missing_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();

        let result = load(&dir.path().join("absent.crt"), &dir.path().join("absent.key"));
        assert!(matches!(result, Err(CredentialError::Io { .. })));
    }

    #[test]
    fn swapped_cert_and_key_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_pair("envgrid.local");

        let cert_path = dir.path().join("tls.crt");
        let key_path = dir.path().join("tls.key");
        std::fs::write(&cert_path, &pair.key_pem).unwrap();
        std::fs::write(&key_path, &pair.cert_pem).unwrap();

        assert!(load(&cert_path, &key_path).is_err());
    }
}
