//! This library crate contains all the necessities to run an envgrid instance.
//!
//! The server provisions short-lived, isolated preview environments on a shared
//! Kubernetes cluster and stamps every workload with the expiry metadata that the
//! cluster-resident sweeper addon relies on for cleanup. Submodules have been
//! introduced to split responsibilities: the [`store`] seam over the cluster
//! resource API, the startup-time [`addons`] and [`cache`] reconcilers, the
//! [`credentials`] serving the TLS listener and the [`server`] hosting the
//! authenticated RPC surface.

#![deny(missing_docs)]

pub mod addons;
pub mod cache;
pub mod constants;
pub mod credentials;
pub mod environment;
pub mod metadata;
pub mod metrics;
pub mod resources;
pub mod server;
pub mod store;

mod options;
pub use options::SharedOptions;

/// Generated wire types for the `envgrid.v1` RPC surface.
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("envgrid.v1");
}
