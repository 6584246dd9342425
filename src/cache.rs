//! Shared build cache claim management.
//!
//! One ReadWriteMany claim per namespace, mounted read-write by every
//! environment workload. This component only guarantees that the claim exists
//! and is sized as configured — write isolation inside the volume is handled
//! by the per-environment `subPath` convention (see [`crate::resources`]),
//! and the claim is never deleted by this service.

use std::sync::Arc;

use log::info;

use crate::constants::CACHE_CLAIM_NAME;
use crate::resources::{self, CacheClaimInput};
use crate::store::{ResourceStore, StoreError};

/// Lookup reference to the shared cache claim.
#[derive(Debug, Clone)]
pub struct VolumeRef {
    /// Namespace the claim lives in
    pub namespace: String,
    /// Claim name
    pub name: String,
}

/// Idempotent provisioner of the shared cache claim.
pub struct CacheVolume {
    store: Arc<dyn ResourceStore>,
}

impl CacheVolume {
    /// Creates a manager backed by the given store.
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Ensures the claim exists, creating it when absent.
    pub async fn ensure(&self, namespace: &str, storage: &str) -> Result<VolumeRef, StoreError> {
        let claim = resources::cache_claim(&CacheClaimInput {
            namespace,
            name: CACHE_CLAIM_NAME,
            storage,
        });

        match self.store.create_volume_claim(claim).await {
            Ok(()) => info!("Created shared cache claim {} ({})", CACHE_CLAIM_NAME, storage),
            Err(StoreError::AlreadyExists) => {
                info!("Reusing existing shared cache claim {}", CACHE_CLAIM_NAME)
            }
            Err(e) => return Err(e),
        }

        Ok(VolumeRef {
            namespace: namespace.to_owned(),
            name: CACHE_CLAIM_NAME.to_owned(),
        })
    }
}
