//! Shared label, annotation and naming conventions.
//!
//! Everything the external sweeper and the ingress addon read off created
//! resources is defined here so the contract lives in one place.

/// Annotation carrying the RFC 3339 creation timestamp of an environment.
pub const CREATED_AT_ANNOTATION: &str = "envgrid.io/created-at";

/// Annotation carrying the requested time-to-live, verbatim (e.g. `24h`).
pub const TTL_ANNOTATION: &str = "envgrid.io/ttl";

/// Label naming the environment that owns a resource.
pub const OWNER_LABEL: &str = "envgrid.io/owner";

/// Label distinguishing environments from bootstrap-managed addons.
pub const COMPONENT_LABEL: &str = "envgrid.io/component";

/// [`COMPONENT_LABEL`] value for environment resources.
pub const COMPONENT_ENVIRONMENT: &str = "environment";

/// [`COMPONENT_LABEL`] value for addon workloads.
pub const COMPONENT_ADDON: &str = "addon";

/// Selector label wiring an environment's route to its workload pods.
pub const APP_LABEL: &str = "app";

/// Annotation on a route naming the ingress addon port to publish through.
pub const INGRESS_PORT_ANNOTATION: &str = "envgrid.io/ingress-port";

/// Annotation on a route naming the remote-shell gateway port.
pub const SSH_PORT_ANNOTATION: &str = "envgrid.io/ssh-port";

/// Storage class annotation understood by cache-capable storage backends.
pub const STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

/// Storage class requested for the shared build cache.
pub const CACHE_STORAGE_CLASS: &str = "cache";

/// Name of the shared build cache claim, one per namespace.
pub const CACHE_CLAIM_NAME: &str = "envgrid-cache";

/// Mount point of the shared build cache inside environment containers.
pub const CACHE_MOUNT_PATH: &str = "/cache";

/// Port environment containers are expected to serve HTTP on.
pub const ENVIRONMENT_HTTP_PORT: i32 = 80;
