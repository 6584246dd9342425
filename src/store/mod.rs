//! Typed seam over the cluster resource store.
//!
//! The orchestrator only ever performs declarative create/get/delete calls
//! keyed by namespace and name. `AlreadyExists` is a distinct condition rather
//! than a generic failure because the store's duplicate-name rejection is the
//! authoritative deduplication mechanism for concurrent builds.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use thiserror::Error;

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

/// Failure talking to the resource store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A resource with the same namespace and name already exists
    #[error("resource already exists")]
    AlreadyExists,
    /// No resource with the given namespace and name
    #[error("resource not found")]
    NotFound,
    /// Any other cluster API failure
    #[error("cluster api failure: {0}")]
    Api(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Declarative access to the cluster resources this service manages.
///
/// Backed by the Kubernetes API in production ([`KubeStore`]) and by an
/// in-process map for local runs and tests ([`MemoryStore`]).
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Creates a workload; [`StoreError::AlreadyExists`] when the name is taken.
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError>;

    /// Fetches a workload, `None` when absent.
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError>;

    /// Deletes a workload; [`StoreError::NotFound`] when absent.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Creates a network route.
    async fn create_service(&self, service: Service) -> Result<(), StoreError>;

    /// Deletes a network route.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Creates a secret.
    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError>;

    /// Deletes a secret.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Creates a volume claim.
    async fn create_volume_claim(&self, claim: PersistentVolumeClaim) -> Result<(), StoreError>;

    /// Fetches a volume claim, `None` when absent.
    async fn get_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError>;
}
