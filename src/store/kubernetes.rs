//! Kubernetes-backed implementation of the resource store seam.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams, PropagationPolicy, Resource};
use kube::{error::Error as KubeError, Client};
use log::{debug, error};
use serde::{de::DeserializeOwned, ser::Serialize};

use super::{ResourceStore, StoreError};

/// Resource store talking to the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Connects using the ambient environment, either the in-cluster service
    /// account or the local kubeconfig.
    pub async fn connect() -> Result<Self, KubeError> {
        let client = Client::try_default().await?;

        Ok(Self { client })
    }

    fn api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_resource<T>(&self, value: &T) -> Result<(), StoreError>
    where
        T: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
    {
        let namespace = namespace_of(value.meta());
        let api: Api<T> = self.api(&namespace);

        match api.create(&PostParams::default(), value).await {
            Ok(created) => {
                debug!("Created {} {}", T::kind(&()), name_of(created.meta()));
                Ok(())
            }
            Err(e) => {
                error!("Failed to create {} {:?}", T::kind(&()), e);
                Err(classify(e))
            }
        }
    }

    async fn get_resource<T>(&self, namespace: &str, name: &str) -> Result<Option<T>, StoreError>
    where
        T: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
    {
        let api: Api<T> = self.api(namespace);

        match api.get(name).await {
            Ok(value) => Ok(Some(value)),
            Err(e) => match classify(e) {
                StoreError::NotFound => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn delete_resource<T>(&self, namespace: &str, name: &str) -> Result<(), StoreError>
    where
        T: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
    {
        let api: Api<T> = self.api(namespace);

        let params = DeleteParams {
            dry_run: false,
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Foreground),
            preconditions: None,
        };

        match api.delete(name, &params).await {
            Ok(o) => {
                if o.is_left() {
                    debug!("Deletion of {} {} scheduled", T::kind(&()), name);
                } else {
                    debug!("Deleted {} {}", T::kind(&()), name);
                }

                Ok(())
            }
            Err(e) => Err(classify(e)),
        }
    }
}

fn namespace_of(meta: &ObjectMeta) -> String {
    meta.namespace.clone().unwrap_or_else(|| "default".into())
}

fn name_of(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

/// Maps the API server's conflict and absence responses onto the distinct
/// conditions the orchestrator dispatches on.
fn classify(err: KubeError) -> StoreError {
    match err {
        KubeError::Api(ref response) if response.code == 409 => StoreError::AlreadyExists,
        KubeError::Api(ref response) if response.code == 404 => StoreError::NotFound,
        other => StoreError::Api(Box::new(other)),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        self.create_resource(&deployment).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        self.get_resource(namespace, name).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_resource::<Deployment>(namespace, name).await
    }

    async fn create_service(&self, service: Service) -> Result<(), StoreError> {
        self.create_resource(&service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_resource::<Service>(namespace, name).await
    }

    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError> {
        self.create_resource(&secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_resource::<Secret>(namespace, name).await
    }

    async fn create_volume_claim(&self, claim: PersistentVolumeClaim) -> Result<(), StoreError> {
        self.create_resource(&claim).await
    }

    async fn get_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        self.get_resource(namespace, name).await
    }
}
