//! Environment lifecycle orchestration.
//!
//! The orchestrator serializes operations per identity, tracks lifecycle
//! records in process memory and treats the store's duplicate-name rejection
//! as the authoritative deduplication for builds racing across instances.
//! Records lost to a restart are synthesized back from the expiry metadata
//! stamped on the workload, so Status and Destroy keep working statelessly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::addons::{AddonDescriptor, AddonKind};
use crate::cache::VolumeRef;
use crate::environment::{EnvironmentId, EnvironmentRecord, EnvironmentState, Ttl};
use crate::metadata::ExpiryMetadata;
use crate::metrics::Metrics;
use crate::resources::{self, registry_secret_name, RouteInput, WorkloadInput};
use crate::store::{ResourceStore, StoreError};

/// Caller-supplied parameters of one build.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// Container image reference to deploy
    pub image: String,
    /// Docker config JSON for pulling private images
    pub registry_credential: Option<String>,
    /// Requested time-to-live
    pub ttl: Ttl,
    /// Publish the environment through the ingress addon
    pub expose_ingress: bool,
    /// Publish the environment through the remote-shell gateway
    pub expose_ssh: bool,
}

/// What a destroy call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// Resources were deleted (tolerating ones already gone)
    Destroyed,
    /// Nothing by that identity exists, in memory or in the cluster
    NotFound,
}

enum ProvisionError {
    /// The workload name is already taken in the cluster
    Duplicate,
    Store(StoreError),
}

/// Lifecycle driver for all environments this instance manages.
pub struct Orchestrator {
    store: Arc<dyn ResourceStore>,
    cache: VolumeRef,
    ingress_port: Option<i32>,
    ssh_port: Option<i32>,
    metrics: Arc<Metrics>,
    records: Mutex<HashMap<EnvironmentId, EnvironmentRecord>>,
    locks: Mutex<HashMap<EnvironmentId, Arc<AsyncMutex<()>>>>,
}

impl Orchestrator {
    /// Creates an orchestrator; exposure ports are read off the addon set
    /// fixed at bootstrap.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        cache: VolumeRef,
        addons: &[AddonDescriptor],
        metrics: Arc<Metrics>,
    ) -> Self {
        let port_of = |kind: AddonKind| {
            addons
                .iter()
                .find(|descriptor| descriptor.kind == kind)
                .and_then(|descriptor| descriptor.port)
        };

        Self {
            ingress_port: port_of(AddonKind::Ingress),
            ssh_port: port_of(AddonKind::SshGateway),
            store,
            cache,
            metrics,
            records: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Provisions an environment, or returns the record already occupying
    /// the identity. Provisioning failures are reported through the record's
    /// `Failed` state, not as an `Err`.
    pub async fn build(
        &self,
        id: EnvironmentId,
        spec: BuildSpec,
    ) -> Result<EnvironmentRecord, StoreError> {
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.lookup(&id) {
            info!("Environment {} already occupies its identity ({})", id, existing.state);
            return Ok(existing);
        }

        let mut record = EnvironmentRecord {
            id: id.clone(),
            state: EnvironmentState::Requested,
            message: None,
            created_at: Utc::now(),
            ttl: spec.ttl.clone(),
        };
        self.remember(record.clone());

        info!("Provisioning environment {} from image {}", id, spec.image);
        record.state = EnvironmentState::Provisioning;
        self.remember(record.clone());

        match self.provision(&id, &spec, &record).await {
            Ok(()) => {
                record.state = EnvironmentState::Ready;
                self.remember(record.clone());
                self.metrics.record_build();

                info!("Environment {} is ready", id);
                Ok(record)
            }
            Err(ProvisionError::Duplicate) => {
                // Another instance created the workload, or it survived a
                // restart of this one. Adopt the existing environment.
                self.forget(&id);
                info!("Environment {} already exists in the cluster, adopting it", id);

                self.from_store(&id).await?.ok_or(StoreError::NotFound)
            }
            Err(ProvisionError::Store(source)) => {
                record.state = EnvironmentState::Failed;
                record.message = Some(source.to_string());
                self.remember(record.clone());
                self.metrics.record_build();
                self.metrics.record_build_failure();

                warn!("Provisioning environment {} failed: {}", id, source);
                Ok(record)
            }
        }
    }

    /// Read-only lookup, consulting the cluster when the identity is not in
    /// process memory.
    pub async fn status(
        &self,
        id: &EnvironmentId,
    ) -> Result<Option<EnvironmentRecord>, StoreError> {
        if let Some(record) = self.lookup(id) {
            return Ok(Some(record));
        }

        self.from_store(id).await
    }

    /// Deletes everything belonging to an environment. Resources already
    /// gone are tolerated so a half-failed destroy can be retried; the
    /// shared cache claim is never touched.
    pub async fn destroy(&self, id: &EnvironmentId) -> Result<DestroyOutcome, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let known = self.lookup(id);
        let retired = known.is_some();

        if known.is_none() {
            let in_cluster = self.store.get_deployment(&id.namespace, &id.name).await?;

            if in_cluster.is_none() {
                return Ok(DestroyOutcome::NotFound);
            }
        }

        if let Some(mut record) = known {
            record.state = EnvironmentState::Destroying;
            self.remember(record);
        }

        info!("Destroying environment {}", id);

        tolerate_absence(self.store.delete_deployment(&id.namespace, &id.name).await)?;
        tolerate_absence(self.store.delete_service(&id.namespace, &id.name).await)?;
        tolerate_absence(
            self.store
                .delete_secret(&id.namespace, &registry_secret_name(&id.name))
                .await,
        )?;

        self.forget(id);
        self.release_lock(id);
        self.metrics.record_destroy(retired);

        info!("Environment {} destroyed, identity is free again", id);
        Ok(DestroyOutcome::Destroyed)
    }

    async fn provision(
        &self,
        id: &EnvironmentId,
        spec: &BuildSpec,
        record: &EnvironmentRecord,
    ) -> Result<(), ProvisionError> {
        let secret_name = spec
            .registry_credential
            .as_ref()
            .map(|_| registry_secret_name(&id.name));

        if let Some(payload) = &spec.registry_credential {
            let secret = resources::registry_secret(id, payload);

            match self.store.create_secret(secret).await {
                Ok(()) | Err(StoreError::AlreadyExists) => {}
                Err(source) => return Err(ProvisionError::Store(source)),
            }
        }

        let metadata = ExpiryMetadata::new(&id.name, spec.ttl.clone(), record.created_at);
        let workload = resources::environment_workload(&WorkloadInput {
            id,
            image: &spec.image,
            metadata: &metadata,
            cache: &self.cache,
            registry_secret: secret_name.as_deref(),
        });

        match self.store.create_deployment(workload).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => return Err(ProvisionError::Duplicate),
            Err(source) => return Err(ProvisionError::Store(source)),
        }

        let route = resources::environment_route(&RouteInput {
            id,
            ingress_port: if spec.expose_ingress { self.ingress_port } else { None },
            ssh_port: if spec.expose_ssh { self.ssh_port } else { None },
        });

        match self.store.create_service(route).await {
            Ok(()) | Err(StoreError::AlreadyExists) => {}
            Err(source) => return Err(ProvisionError::Store(source)),
        }

        Ok(())
    }

    /// Synthesizes a record from the expiry metadata stamped on the cluster
    /// workload. A workload that exists is reported `Ready`; its transient
    /// provisioning states did not survive whatever lost the record.
    async fn from_store(
        &self,
        id: &EnvironmentId,
    ) -> Result<Option<EnvironmentRecord>, StoreError> {
        let workload = match self.store.get_deployment(&id.namespace, &id.name).await? {
            Some(workload) => workload,
            None => return Ok(None),
        };

        let meta = workload.metadata;
        let annotations = meta.annotations.unwrap_or_default();
        let labels = meta.labels.unwrap_or_default();

        let (created_at, ttl) = match ExpiryMetadata::from_workload_metadata(&annotations, &labels)
        {
            Ok(stamp) => (stamp.created_at, stamp.ttl),
            Err(source) => {
                warn!("Workload for {} has no usable expiry stamp: {}", id, source);

                let created_at = meta
                    .creation_timestamp
                    .map(|time| time.0)
                    .unwrap_or_else(Utc::now);

                (created_at, Ttl::from_secs(0))
            }
        };

        Ok(Some(EnvironmentRecord {
            id: id.clone(),
            state: EnvironmentState::Ready,
            message: None,
            created_at,
            ttl,
        }))
    }

    fn lock_for(&self, id: &EnvironmentId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("identity lock table poisoned");

        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release_lock(&self, id: &EnvironmentId) {
        let mut locks = self.locks.lock().expect("identity lock table poisoned");
        locks.remove(id);
    }

    fn lookup(&self, id: &EnvironmentId) -> Option<EnvironmentRecord> {
        let records = self.records.lock().expect("record table poisoned");
        records.get(id).cloned()
    }

    fn remember(&self, record: EnvironmentRecord) {
        let mut records = self.records.lock().expect("record table poisoned");
        records.insert(record.id.clone(), record);
    }

    fn forget(&self, id: &EnvironmentId) {
        let mut records = self.records.lock().expect("record table poisoned");
        records.remove(id);
    }
}

fn tolerate_absence(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Ok(()) | Err(StoreError::NotFound) => Ok(()),
        Err(source) => Err(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};

    fn addons() -> Vec<AddonDescriptor> {
        vec![
            AddonDescriptor {
                kind: AddonKind::Ingress,
                image: "traefik".to_owned(),
                version: "1.7".to_owned(),
                port: Some(80),
            },
            AddonDescriptor {
                kind: AddonKind::SshGateway,
                image: "envgrid/ssh-gateway".to_owned(),
                version: "0.1.0".to_owned(),
                port: Some(2222),
            },
        ]
    }

    fn orchestrator(store: Arc<dyn ResourceStore>) -> Orchestrator {
        let cache = VolumeRef {
            namespace: "default".to_owned(),
            name: "envgrid-cache".to_owned(),
        };

        Orchestrator::new(store, cache, &addons(), Metrics::new())
    }

    fn build_spec() -> BuildSpec {
        BuildSpec {
            image: "app:1.0".to_owned(),
            registry_credential: Some("{\"auths\":{}}".to_owned()),
            ttl: "24h".parse().unwrap(),
            expose_ingress: true,
            expose_ssh: false,
        }
    }

    #[tokio::test]
    async fn build_provisions_workload_route_and_secret() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());

        let record = orchestrator
            .build(EnvironmentId::new("default", "pr-42"), build_spec())
            .await
            .unwrap();

        assert_eq!(record.state, EnvironmentState::Ready);
        assert_eq!(store.deployment_count(), 1);
        assert_eq!(store.service_count(), 1);
        assert_eq!(store.secret_count(), 1);
    }

    #[tokio::test]
    async fn repeated_build_returns_the_existing_record() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let id = EnvironmentId::new("default", "pr-42");

        let first = orchestrator.build(id.clone(), build_spec()).await.unwrap();
        let second = orchestrator.build(id, build_spec()).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.deployment_count(), 1);
    }

    #[tokio::test]
    async fn destroy_removes_everything_but_frees_the_identity() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store.clone());
        let id = EnvironmentId::new("default", "pr-42");

        orchestrator.build(id.clone(), build_spec()).await.unwrap();
        let outcome = orchestrator.destroy(&id).await.unwrap();

        assert_eq!(outcome, DestroyOutcome::Destroyed);
        assert_eq!(store.deployment_count(), 0);
        assert_eq!(store.service_count(), 0);
        assert_eq!(store.secret_count(), 0);
        assert!(orchestrator.status(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn destroy_of_an_unknown_identity_reports_not_found() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = orchestrator(store);

        let outcome = orchestrator
            .destroy(&EnvironmentId::new("default", "absent"))
            .await
            .unwrap();

        assert_eq!(outcome, DestroyOutcome::NotFound);
    }

    #[tokio::test]
    async fn status_survives_a_restart_via_the_expiry_stamp() {
        let store = Arc::new(MemoryStore::new());
        let id = EnvironmentId::new("default", "pr-42");

        let before = orchestrator(store.clone());
        let original = before.build(id.clone(), build_spec()).await.unwrap();

        // A fresh instance has no in-memory record of the environment.
        let after = orchestrator(store);
        let recovered = after.status(&id).await.unwrap().unwrap();

        assert_eq!(recovered.state, EnvironmentState::Ready);
        assert_eq!(recovered.ttl.as_str(), "24h");
        assert_eq!(recovered.created_at, original.created_at);
    }

    #[tokio::test]
    async fn destroy_works_without_an_in_memory_record() {
        let store = Arc::new(MemoryStore::new());
        let id = EnvironmentId::new("default", "pr-42");

        orchestrator(store.clone())
            .build(id.clone(), build_spec())
            .await
            .unwrap();

        let after = orchestrator(store.clone());
        let outcome = after.destroy(&id).await.unwrap();

        assert_eq!(outcome, DestroyOutcome::Destroyed);
        assert_eq!(store.deployment_count(), 0);
    }

    #[tokio::test]
    async fn destroying_an_adopted_environment_leaves_the_gauge_balanced() {
        let store = Arc::new(MemoryStore::new());
        let id = EnvironmentId::new("default", "pr-42");

        orchestrator(store.clone())
            .build(id.clone(), build_spec())
            .await
            .unwrap();

        // A fresh instance never counted the environment active.
        let metrics = Metrics::new();
        let cache = VolumeRef {
            namespace: "default".to_owned(),
            name: "envgrid-cache".to_owned(),
        };
        let after = Orchestrator::new(store, cache, &addons(), metrics.clone());

        let outcome = after.destroy(&id).await.unwrap();
        assert_eq!(outcome, DestroyOutcome::Destroyed);

        let rendered = metrics.render();
        assert!(rendered.contains("envgrid_destroys_total 1"));
        assert!(rendered.contains("envgrid_active_environments 0"));
    }

    #[tokio::test]
    async fn concurrent_builds_of_one_identity_provision_once() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(orchestrator(store.clone()));
        let id = EnvironmentId::new("default", "pr-42");

        let left = {
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            tokio::spawn(async move { orchestrator.build(id, build_spec()).await })
        };
        let right = {
            let orchestrator = orchestrator.clone();
            let id = id.clone();
            tokio::spawn(async move { orchestrator.build(id, build_spec()).await })
        };

        let left = left.await.unwrap().unwrap();
        let right = right.await.unwrap().unwrap();

        assert_eq!(store.deployment_count(), 1);
        assert_eq!(left.created_at, right.created_at);
    }

    struct BrokenRouteStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ResourceStore for BrokenRouteStore {
        async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
            self.inner.create_deployment(deployment).await
        }

        async fn get_deployment(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Deployment>, StoreError> {
            self.inner.get_deployment(namespace, name).await
        }

        async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_deployment(namespace, name).await
        }

        async fn create_service(&self, _service: Service) -> Result<(), StoreError> {
            Err(StoreError::Api("route rejected".into()))
        }

        async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_service(namespace, name).await
        }

        async fn create_secret(&self, secret: Secret) -> Result<(), StoreError> {
            self.inner.create_secret(secret).await
        }

        async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_secret(namespace, name).await
        }

        async fn create_volume_claim(
            &self,
            claim: PersistentVolumeClaim,
        ) -> Result<(), StoreError> {
            self.inner.create_volume_claim(claim).await
        }

        async fn get_volume_claim(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<PersistentVolumeClaim>, StoreError> {
            self.inner.get_volume_claim(namespace, name).await
        }
    }

    #[tokio::test]
    async fn a_failed_build_keeps_its_partial_resources_until_destroyed() {
        let store = Arc::new(BrokenRouteStore {
            inner: MemoryStore::new(),
        });
        let orchestrator = orchestrator(store.clone());
        let id = EnvironmentId::new("default", "pr-42");

        let record = orchestrator.build(id.clone(), build_spec()).await.unwrap();

        assert_eq!(record.state, EnvironmentState::Failed);
        assert!(record.message.is_some());
        // The workload stays for inspection until an explicit destroy.
        assert_eq!(store.inner.deployment_count(), 1);

        let status = orchestrator.status(&id).await.unwrap().unwrap();
        assert_eq!(status.state, EnvironmentState::Failed);

        let outcome = orchestrator.destroy(&id).await.unwrap();
        assert_eq!(outcome, DestroyOutcome::Destroyed);
        assert_eq!(store.inner.deployment_count(), 0);
    }
}
