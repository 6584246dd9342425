//! Bootstrap of cluster-level singleton addons.
//!
//! Before the listener accepts traffic, the server reconciles the three
//! addons every environment depends on: the ingress proxy, the remote-shell
//! gateway and the garbage-collecting sweeper. Bootstrap is get-then-create
//! and never updates in place — a later restart with a changed addon version
//! leaves the running addon untouched.

use std::fmt;
use std::sync::Arc;

use log::info;
use thiserror::Error;

use crate::resources;
use crate::store::{ResourceStore, StoreError};

/// The closed set of addon kinds this service bootstraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonKind {
    /// HTTP ingress proxy routing hostnames to environment routes
    Ingress,
    /// Remote-shell gateway for interactive access to environments
    SshGateway,
    /// Sweeper deleting workloads whose expiry metadata has lapsed
    GarbageCollector,
}

impl AddonKind {
    /// Workload name of the addon's singleton deployment.
    pub fn workload_name(self) -> &'static str {
        match self {
            AddonKind::Ingress => "envgrid-ingress",
            AddonKind::SshGateway => "envgrid-ssh-gateway",
            AddonKind::GarbageCollector => "envgrid-sweeper",
        }
    }
}

impl fmt::Display for AddonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AddonKind::Ingress => "ingress",
            AddonKind::SshGateway => "ssh-gateway",
            AddonKind::GarbageCollector => "garbage-collector",
        };

        write!(f, "{}", label)
    }
}

/// Declarative spec for one addon, immutable once loaded from configuration.
#[derive(Debug, Clone)]
pub struct AddonDescriptor {
    /// Which addon this describes
    pub kind: AddonKind,
    /// Container image without tag
    pub image: String,
    /// Image tag to deploy
    pub version: String,
    /// Host port the addon listens on, if it exposes one
    pub port: Option<i32>,
}

impl AddonDescriptor {
    /// Workload name of the addon's singleton deployment.
    pub fn workload_name(&self) -> &'static str {
        self.kind.workload_name()
    }

    /// Full image reference, `image:version`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }
}

/// Outcome of reconciling one addon.
#[derive(Debug, PartialEq, Eq)]
pub enum Ensure {
    /// The addon workload was created by this call
    Created,
    /// A workload with the addon's name already existed and was left untouched
    AlreadyPresent,
}

/// Irrecoverable cluster API failure during addon reconciliation.
///
/// Fatal by contract: there is no partial-addon-degraded mode, the process
/// exits before accepting traffic.
#[derive(Debug, Error)]
#[error("addon {kind} could not be reconciled: {source}")]
pub struct BootstrapError {
    /// The addon that failed
    pub kind: AddonKind,
    /// The underlying store failure
    #[source]
    pub source: StoreError,
}

/// Reconciles singleton addons at startup.
pub struct Bootstrapper {
    store: Arc<dyn ResourceStore>,
    namespace: String,
}

impl Bootstrapper {
    /// Creates a bootstrapper operating in the given namespace.
    pub fn new(store: Arc<dyn ResourceStore>, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_owned(),
        }
    }

    /// Ensures one addon is present, creating it when absent.
    pub async fn ensure(&self, descriptor: &AddonDescriptor) -> Result<Ensure, BootstrapError> {
        let fail = |source| BootstrapError {
            kind: descriptor.kind,
            source,
        };

        let existing = self
            .store
            .get_deployment(&self.namespace, descriptor.workload_name())
            .await
            .map_err(fail)?;

        if existing.is_some() {
            return Ok(Ensure::AlreadyPresent);
        }

        let workload = resources::addon_workload(descriptor, &self.namespace);

        match self.store.create_deployment(workload).await {
            Ok(()) => Ok(Ensure::Created),
            // A sibling instance created it between our get and create.
            Err(StoreError::AlreadyExists) => Ok(Ensure::AlreadyPresent),
            Err(source) => Err(fail(source)),
        }
    }

    /// Reconciles all configured addons sequentially, in declaration order,
    /// so later addons can assume earlier ones are reachable.
    pub async fn ensure_all(&self, descriptors: &[AddonDescriptor]) -> Result<(), BootstrapError> {
        for descriptor in descriptors {
            info!("Installing addon: {}", descriptor.kind);

            match self.ensure(descriptor).await? {
                Ensure::Created => info!("Created addon workload {}", descriptor.workload_name()),
                Ensure::AlreadyPresent => {
                    info!("Addon {} already present, leaving it untouched", descriptor.kind)
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn descriptors() -> Vec<AddonDescriptor> {
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
            AddonDescriptor {
                kind: AddonKind::GarbageCollector,
                image: "envgrid/sweeper".to_owned(),
                version: "0.1.0".to_owned(),
                port: None,
            },
        ]
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let bootstrapper = Bootstrapper::new(store.clone(), "default");
        let descriptors = descriptors();

        bootstrapper.ensure_all(&descriptors).await.unwrap();
        bootstrapper.ensure_all(&descriptors).await.unwrap();

        assert_eq!(store.deployment_count(), 3);
    }

    #[tokio::test]
    async fn second_ensure_reports_already_present() {
        let store = Arc::new(MemoryStore::new());
        let bootstrapper = Bootstrapper::new(store, "default");
        let descriptor = descriptors().remove(0);

        assert_eq!(
            bootstrapper.ensure(&descriptor).await.unwrap(),
            Ensure::Created
        );
        assert_eq!(
            bootstrapper.ensure(&descriptor).await.unwrap(),
            Ensure::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn changed_version_does_not_mutate_a_running_addon() {
        let store = Arc::new(MemoryStore::new());
        let bootstrapper = Bootstrapper::new(store.clone(), "default");
        let mut descriptor = descriptors().remove(0);

        bootstrapper.ensure(&descriptor).await.unwrap();

        descriptor.version = "2.0".to_owned();
        bootstrapper.ensure(&descriptor).await.unwrap();

        let workload = store
            .get_deployment("default", descriptor.workload_name())
            .await
            .unwrap()
            .unwrap();
        let image = workload.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone()
            .unwrap();

        assert_eq!(image, "traefik:1.7");
    }
}
