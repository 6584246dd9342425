//! Server startup and the TLS-terminated RPC listener.
//!
//! Startup is strictly ordered: connect to the cluster, reconcile the addon
//! set, ensure the shared cache claim, obtain a TLS credential, then accept
//! traffic. A failure in any of these steps aborts the process before the
//! listener binds.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::stream;
use log::{debug, info, warn};
use structopt::StructOpt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tonic::transport::Server;

use crate::addons::{AddonDescriptor, AddonKind, Bootstrapper};
use crate::cache::CacheVolume;
use crate::credentials::{
    self, static_files, Credentials, ManagedCredentials, SelfSignedAuthority,
};
use crate::environment::Ttl;
use crate::metrics::{self, Metrics};
use crate::proto::environments_server::EnvironmentsServer;
use crate::store::{KubeStore, ResourceStore};

mod orchestrator;
mod rpc;

pub use orchestrator::{BuildSpec, DestroyOutcome, Orchestrator};
pub use rpc::EnvironmentsService;

/// Options for the server subcommand
#[derive(Debug, StructOpt)]
pub struct Options {
    /// Port the RPC listener binds
    #[structopt(long, env = "ENVGRID_PORT", default_value = "443")]
    port: u16,

    /// Shared token every RPC call has to present
    #[structopt(long, env = "ENVGRID_TOKEN", hide_env_values = true)]
    token: String,

    /// Namespace environments are provisioned in when the request names none
    #[structopt(long, env = "ENVGRID_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Storage request for the shared build cache claim
    #[structopt(long, env = "ENVGRID_CACHE_SIZE", default_value = "100Gi")]
    cache_size: String,

    #[structopt(flatten)]
    tls: TlsOptions,

    #[structopt(flatten)]
    addons: AddonOptions,

    #[structopt(flatten)]
    metrics: MetricsOptions,
}

/// TLS credential selection
///
/// A static certificate/key pair takes precedence; without one the server
/// manages its own credential, cached on disk and renewed in the background.
#[derive(Debug, StructOpt)]
pub struct TlsOptions {
    /// PEM certificate chain, requires --tls-key
    #[structopt(long = "tls-cert", env = "ENVGRID_TLS_CERT")]
    cert: Option<PathBuf>,

    /// PEM private key, requires --tls-cert
    #[structopt(long = "tls-key", env = "ENVGRID_TLS_KEY")]
    key: Option<PathBuf>,

    /// Domain managed certificates are issued for
    #[structopt(long = "tls-domain", env = "ENVGRID_TLS_DOMAIN", default_value = "envgrid.local")]
    domain: String,

    /// Directory managed certificates are cached in
    #[structopt(
        long = "tls-cache",
        env = "ENVGRID_TLS_CACHE",
        default_value = "/var/lib/envgrid/tls"
    )]
    cache: PathBuf,

    /// Interval between certificate renewals
    #[structopt(
        long = "tls-renew-interval",
        env = "ENVGRID_TLS_RENEW_INTERVAL",
        default_value = "720h"
    )]
    renew_interval: Ttl,
}

impl TlsOptions {
    async fn provide(&self) -> Result<Credentials> {
        match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => Ok(Credentials::Static(static_files::load(cert, key)?)),
            (None, None) => {
                let authority = Arc::new(SelfSignedAuthority::new());
                let managed = ManagedCredentials::start(
                    authority,
                    &self.domain,
                    &self.cache,
                    self.renew_interval.duration(),
                )
                .await?;

                Ok(Credentials::Managed(managed))
            }
            _ => bail!("--tls-cert and --tls-key have to be provided together"),
        }
    }
}

/// Addon images deployed at bootstrap
#[derive(Debug, StructOpt)]
pub struct AddonOptions {
    /// Image of the ingress proxy addon
    #[structopt(long, env = "ENVGRID_INGRESS_IMAGE", default_value = "traefik")]
    ingress_image: String,

    /// Version of the ingress proxy addon
    #[structopt(long, env = "ENVGRID_INGRESS_VERSION", default_value = "1.7")]
    ingress_version: String,

    /// Host port the ingress proxy listens on
    #[structopt(long, env = "ENVGRID_INGRESS_PORT", default_value = "80")]
    ingress_port: i32,

    /// Image of the remote-shell gateway addon
    #[structopt(long, env = "ENVGRID_SSH_IMAGE", default_value = "envgrid/ssh-gateway")]
    ssh_image: String,

    /// Version of the remote-shell gateway addon
    #[structopt(long, env = "ENVGRID_SSH_VERSION", default_value = "0.1.0")]
    ssh_version: String,

    /// Host port the remote-shell gateway listens on
    #[structopt(long, env = "ENVGRID_SSH_PORT", default_value = "2222")]
    ssh_port: i32,

    /// Image of the sweeper addon
    #[structopt(long, env = "ENVGRID_SWEEPER_IMAGE", default_value = "envgrid/sweeper")]
    sweeper_image: String,

    /// Version of the sweeper addon
    #[structopt(long, env = "ENVGRID_SWEEPER_VERSION", default_value = "0.1.0")]
    sweeper_version: String,
}

impl AddonOptions {
    /// The addon set in bootstrap order. The ingress proxy comes first so the
    /// gateway and sweeper can rely on cluster networking being routable.
    pub fn descriptors(&self) -> Vec<AddonDescriptor> {
        vec![
            AddonDescriptor {
                kind: AddonKind::Ingress,
                image: self.ingress_image.clone(),
                version: self.ingress_version.clone(),
                port: Some(self.ingress_port),
            },
            AddonDescriptor {
                kind: AddonKind::SshGateway,
                image: self.ssh_image.clone(),
                version: self.ssh_version.clone(),
                port: Some(self.ssh_port),
            },
            AddonDescriptor {
                kind: AddonKind::GarbageCollector,
                image: self.sweeper_image.clone(),
                version: self.sweeper_version.clone(),
                port: None,
            },
        ]
    }
}

/// Metrics endpoint configuration
#[derive(Debug, StructOpt)]
pub struct MetricsOptions {
    /// Port the plain-HTTP metrics endpoint binds
    #[structopt(long, env = "ENVGRID_METRICS_PORT", default_value = "9000")]
    metrics_port: u16,

    /// Path the metrics are served under
    #[structopt(long, env = "ENVGRID_METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,
}

/// Runs the server until a shutdown signal arrives.
pub async fn run(options: Options) -> Result<()> {
    let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::connect().await?);

    let descriptors = options.addons.descriptors();
    Bootstrapper::new(store.clone(), &options.namespace)
        .ensure_all(&descriptors)
        .await?;

    let cache = CacheVolume::new(store.clone())
        .ensure(&options.namespace, &options.cache_size)
        .await?;

    let tls = options.tls.provide().await?;
    let tls_config = credentials::server_config(tls.handle())?;

    let metrics = Metrics::new();
    {
        let metrics = metrics.clone();
        let port = options.metrics.metrics_port;
        let path = options.metrics.metrics_path.clone();

        tokio::spawn(async move {
            metrics::serve(port, &path, metrics).await;
        });
    }

    let orchestrator = Arc::new(Orchestrator::new(store, cache, &descriptors, metrics));
    let service = EnvironmentsService::new(orchestrator, &options.token, &options.namespace);

    serve(service, tls_config, options.port).await?;

    tls.shutdown().await;

    Ok(())
}

/// Accepts TLS connections and feeds the handshaken streams into the RPC
/// server. Handshakes run concurrently so one slow client cannot hold up the
/// accept loop.
async fn serve(
    service: EnvironmentsService,
    tls_config: Arc<rustls::ServerConfig>,
    port: u16,
) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls_config);

    info!("Listening at {:?}", addr);

    let (connections, incoming) = mpsc::channel::<std::io::Result<TlsStream<TcpStream>>>(16);

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Could not accept connection: {}", e);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let connections = connections.clone();

            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let _ = connections.send(Ok(tls_stream)).await;
                    }
                    Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                }
            });
        }
    });

    let incoming = stream::unfold(incoming, |mut incoming| async move {
        incoming.recv().await.map(|connection| (connection, incoming))
    });

    Server::builder()
        .add_service(EnvironmentsServer::new(service))
        .serve_with_incoming_shutdown(incoming, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, draining connections");
        })
        .await?;

    Ok(())
}
