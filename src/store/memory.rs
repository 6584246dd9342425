//! Map-backed resource store for local runs and tests.
//!
//! Mirrors the API server's semantics where the orchestrator depends on them:
//! creates are atomic and reject duplicate names, gets report absence as
//! `None` and deletes report absence as [`StoreError::NotFound`].

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::api::Resource;

use super::{ResourceStore, StoreError};

type Shelf<T> = Mutex<HashMap<(String, String), T>>;

/// In-process resource store.
#[derive(Default)]
pub struct MemoryStore {
    deployments: Shelf<Deployment>,
    services: Shelf<Service>,
    secrets: Shelf<Secret>,
    claims: Shelf<PersistentVolumeClaim>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workloads currently held, across all namespaces.
    pub fn deployment_count(&self) -> usize {
        self.deployments.lock().expect("store mutex poisoned").len()
    }

    /// Number of routes currently held, across all namespaces.
    pub fn service_count(&self) -> usize {
        self.services.lock().expect("store mutex poisoned").len()
    }

    /// Number of secrets currently held, across all namespaces.
    pub fn secret_count(&self) -> usize {
        self.secrets.lock().expect("store mutex poisoned").len()
    }

    /// Number of volume claims currently held, across all namespaces.
    pub fn claim_count(&self) -> usize {
        self.claims.lock().expect("store mutex poisoned").len()
    }
}

fn key<T: Resource<DynamicType = ()>>(value: &T) -> (String, String) {
    let meta = value.meta();

    let namespace = meta.namespace.clone().unwrap_or_else(|| "default".into());
    let name = meta.name.clone().unwrap_or_default();

    (namespace, name)
}

fn insert<T: Resource<DynamicType = ()>>(shelf: &Shelf<T>, value: T) -> Result<(), StoreError> {
    let mut map = shelf.lock().expect("store mutex poisoned");
    let key = key(&value);

    if map.contains_key(&key) {
        return Err(StoreError::AlreadyExists);
    }

    map.insert(key, value);
    Ok(())
}

fn get<T: Clone>(shelf: &Shelf<T>, namespace: &str, name: &str) -> Result<Option<T>, StoreError> {
    let map = shelf.lock().expect("store mutex poisoned");

    Ok(map.get(&(namespace.to_owned(), name.to_owned())).cloned())
}

fn remove<T>(shelf: &Shelf<T>, namespace: &str, name: &str) -> Result<(), StoreError> {
    let mut map = shelf.lock().expect("store mutex poisoned");

    map.remove(&(namespace.to_owned(), name.to_owned()))
        .map(|_| ())
        .ok_or(StoreError::NotFound)
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        insert(&self.deployments, deployment)
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        get(&self.deployments, namespace, name)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        remove(&self.deployments, namespace, name)
    }

    async fn create_service(&self, service: Service) -> Result<(), StoreError> {
        insert(&self.services, service)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        remove(&self.services, namespace, name)
    }

    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError> {
        insert(&self.secrets, secret)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        remove(&self.secrets, namespace, name)
    }

    async fn create_volume_claim(&self, claim: PersistentVolumeClaim) -> Result<(), StoreError> {
        insert(&self.claims, claim)
    }

    async fn get_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        get(&self.claims, namespace, name)
    }
}
