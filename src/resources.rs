//! Construction of the cluster resources this service creates.
//!
//! Per environment: one workload, one route, and optionally one registry
//! secret. Per namespace: the shared build cache claim. Per addon: one
//! workload. Expiry metadata is stamped here so a workload cannot be built
//! without it.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, LocalObjectReference, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::addons::AddonDescriptor;
use crate::cache::VolumeRef;
use crate::constants::*;
use crate::environment::EnvironmentId;
use crate::metadata::ExpiryMetadata;

/// Everything needed to produce an environment's primary workload.
pub struct WorkloadInput<'a> {
    /// Identity of the environment
    pub id: &'a EnvironmentId,
    /// Container image reference to run
    pub image: &'a str,
    /// Expiry stamp for the sweeper
    pub metadata: &'a ExpiryMetadata,
    /// Shared build cache to mount
    pub cache: &'a VolumeRef,
    /// Name of the registry secret to pull with, if any
    pub registry_secret: Option<&'a str>,
}

/// Everything needed to produce an environment's network route.
pub struct RouteInput<'a> {
    /// Identity of the environment
    pub id: &'a EnvironmentId,
    /// Ingress addon port to publish through, when ingress was requested
    pub ingress_port: Option<i32>,
    /// Remote-shell gateway port, when shell access was requested
    pub ssh_port: Option<i32>,
}

/// Parameters of the shared build cache claim (one per namespace).
pub struct CacheClaimInput<'a> {
    /// Namespace the claim lives in
    pub namespace: &'a str,
    /// Claim name
    pub name: &'a str,
    /// Requested storage size, e.g. `100Gi`
    pub storage: &'a str,
}

/// Name of the registry secret belonging to an environment.
pub fn registry_secret_name(environment: &str) -> String {
    format!("{}-registry", environment)
}

fn environment_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_owned(), name.to_owned());
    labels.insert(
        COMPONENT_LABEL.to_owned(),
        COMPONENT_ENVIRONMENT.to_owned(),
    );
    labels
}

/// The primary workload backing an environment, stamped with expiry metadata.
pub fn environment_workload(input: &WorkloadInput<'_>) -> Deployment {
    let name = &input.id.name;

    let mut labels = environment_labels(name);
    labels.append(&mut input.metadata.labels());

    let mut selector = BTreeMap::new();
    selector.insert(APP_LABEL.to_owned(), name.clone());

    let image_pull_secrets = input.registry_secret.map(|secret| {
        vec![LocalObjectReference {
            name: Some(secret.to_owned()),
        }]
    });

    Deployment {
        metadata: ObjectMeta {
            namespace: Some(input.id.namespace.clone()),
            name: Some(name.clone()),
            labels: Some(labels.clone()),
            annotations: Some(input.metadata.annotations()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(input.image.to_owned()),
                        ports: Some(vec![ContainerPort {
                            container_port: ENVIRONMENT_HTTP_PORT,
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: "cache".to_owned(),
                            mount_path: CACHE_MOUNT_PATH.to_owned(),
                            // Builds share one claim; each environment writes
                            // beneath its own subdirectory.
                            sub_path: Some(name.clone()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    image_pull_secrets,
                    volumes: Some(vec![Volume {
                        name: "cache".to_owned(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: input.cache.name.clone(),
                            read_only: Some(false),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The route exposing an environment inside the cluster.
///
/// Ingress and remote-shell exposure are annotations the respective addons
/// pick up; the orchestrator only records which bootstrap-time port applies.
pub fn environment_route(input: &RouteInput<'_>) -> Service {
    let name = &input.id.name;

    let mut annotations = BTreeMap::new();

    if let Some(port) = input.ingress_port {
        annotations.insert(INGRESS_PORT_ANNOTATION.to_owned(), port.to_string());
    }

    if let Some(port) = input.ssh_port {
        annotations.insert(SSH_PORT_ANNOTATION.to_owned(), port.to_string());
    }

    let mut selector = BTreeMap::new();
    selector.insert(APP_LABEL.to_owned(), name.clone());

    Service {
        metadata: ObjectMeta {
            namespace: Some(input.id.namespace.clone()),
            name: Some(name.clone()),
            labels: Some(environment_labels(name)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: ENVIRONMENT_HTTP_PORT,
                target_port: Some(IntOrString::Int(ENVIRONMENT_HTTP_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The image pull secret for an environment's registry credential.
pub fn registry_secret(id: &EnvironmentId, payload: &str) -> Secret {
    let mut string_data = BTreeMap::new();
    string_data.insert(".dockerconfigjson".to_owned(), payload.to_owned());

    Secret {
        metadata: ObjectMeta {
            namespace: Some(id.namespace.clone()),
            name: Some(registry_secret_name(&id.name)),
            labels: Some(environment_labels(&id.name)),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_owned()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

/// The shared build cache claim.
///
/// Requested ReadWriteMany so every environment in the namespace can mount it
/// concurrently. The storage class annotation lets cluster admins register any
/// backend for cache claims.
pub fn cache_claim(input: &CacheClaimInput<'_>) -> PersistentVolumeClaim {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        STORAGE_CLASS_ANNOTATION.to_owned(),
        CACHE_STORAGE_CLASS.to_owned(),
    );

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_owned(), Quantity(input.storage.to_owned()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            namespace: Some(input.namespace.to_owned()),
            name: Some(input.name.to_owned()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_owned()]),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A cluster-level addon workload.
///
/// Carries the addon component label but deliberately no expiry metadata, so
/// the sweeper never reaps its own plumbing.
pub fn addon_workload(descriptor: &AddonDescriptor, namespace: &str) -> Deployment {
    let name = descriptor.workload_name();

    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_owned(), name.to_owned());
    labels.insert(COMPONENT_LABEL.to_owned(), COMPONENT_ADDON.to_owned());

    let mut selector = BTreeMap::new();
    selector.insert(APP_LABEL.to_owned(), name.to_owned());

    let ports = descriptor.port.map(|port| {
        vec![ContainerPort {
            container_port: port,
            host_port: Some(port),
            ..Default::default()
        }]
    });

    Deployment {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_owned()),
            name: Some(name.to_owned()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_owned(),
                        image: Some(descriptor.image_ref()),
                        ports,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::AddonKind;
    use crate::constants::{CREATED_AT_ANNOTATION, TTL_ANNOTATION};
    use chrono::Utc;

    fn sample_workload() -> Deployment {
        let id = EnvironmentId::new("default", "pr-42");
        let metadata = ExpiryMetadata::new("pr-42", "24h".parse().unwrap(), Utc::now());
        let cache = VolumeRef {
            namespace: "default".to_owned(),
            name: "envgrid-cache".to_owned(),
        };

        environment_workload(&WorkloadInput {
            id: &id,
            image: "app:1.0",
            metadata: &metadata,
            cache: &cache,
            registry_secret: Some("pr-42-registry"),
        })
    }

    #[test]
    fn workload_is_stamped_with_expiry_metadata() {
        let workload = sample_workload();
        let meta = workload.metadata;
        let annotations = meta.annotations.unwrap();
        let labels = meta.labels.unwrap();

        assert!(annotations.contains_key(CREATED_AT_ANNOTATION));
        assert_eq!(annotations.get(TTL_ANNOTATION).unwrap(), "24h");
        assert_eq!(labels.get(OWNER_LABEL).unwrap(), "pr-42");
    }

    #[test]
    fn workload_mounts_the_cache_under_its_own_subdirectory() {
        let workload = sample_workload();
        let pod = workload.spec.unwrap().template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();

        assert_eq!(mounts[0].mount_path, CACHE_MOUNT_PATH);
        assert_eq!(mounts[0].sub_path.as_deref(), Some("pr-42"));

        let volumes = pod.volumes.unwrap();
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "envgrid-cache"
        );
    }

    #[test]
    fn workload_pulls_through_the_registry_secret() {
        let workload = sample_workload();
        let pod = workload.spec.unwrap().template.spec.unwrap();
        let pull_secrets = pod.image_pull_secrets.unwrap();

        assert_eq!(pull_secrets[0].name.as_deref(), Some("pr-42-registry"));
    }

    #[test]
    fn route_records_requested_exposure() {
        let id = EnvironmentId::new("default", "pr-42");
        let route = environment_route(&RouteInput {
            id: &id,
            ingress_port: Some(80),
            ssh_port: None,
        });

        let annotations = route.metadata.annotations.unwrap();
        assert_eq!(annotations.get(INGRESS_PORT_ANNOTATION).unwrap(), "80");
        assert!(!annotations.contains_key(SSH_PORT_ANNOTATION));
    }

    #[test]
    fn cache_claim_requests_shared_access() {
        let claim = cache_claim(&CacheClaimInput {
            namespace: "default",
            name: "envgrid-cache",
            storage: "100Gi",
        });

        let spec = claim.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteMany".to_owned()]);
        assert_eq!(
            spec.resources.unwrap().requests.unwrap().get("storage"),
            Some(&Quantity("100Gi".to_owned()))
        );

        let annotations = claim.metadata.annotations.unwrap();
        assert_eq!(
            annotations.get(STORAGE_CLASS_ANNOTATION).unwrap(),
            CACHE_STORAGE_CLASS
        );
    }

    #[test]
    fn addon_workload_carries_no_expiry_metadata() {
        let descriptor = AddonDescriptor {
            kind: AddonKind::Ingress,
            image: "traefik".to_owned(),
            version: "1.7".to_owned(),
            port: Some(80),
        };

        let workload = addon_workload(&descriptor, "default");
        let meta = workload.metadata;

        assert!(meta.annotations.is_none());
        assert_eq!(
            meta.labels.unwrap().get(COMPONENT_LABEL).unwrap(),
            COMPONENT_ADDON
        );
    }
}
