//! The authenticated RPC surface.
//!
//! Thin translation layer between the wire types and the orchestrator: every
//! call is authenticated against the shared token before anything else, and
//! input validation failures map to `INVALID_ARGUMENT` without touching the
//! cluster.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::environment::{EnvironmentId, Ttl};
use crate::proto::environments_server::Environments;
use crate::proto::{
    destroy_response, BuildRequest, BuildResponse, Credentials, DestroyRequest, DestroyResponse,
    EnvironmentState as WireState, EnvironmentStatus, StatusRequest, StatusResponse,
};
use crate::server::orchestrator::{BuildSpec, DestroyOutcome, Orchestrator};
use crate::store::StoreError;

/// gRPC service implementation backed by the orchestrator.
pub struct EnvironmentsService {
    orchestrator: Arc<Orchestrator>,
    token: String,
    default_namespace: String,
}

impl EnvironmentsService {
    /// Creates the service. `token` is the shared secret every call must carry.
    pub fn new(orchestrator: Arc<Orchestrator>, token: &str, default_namespace: &str) -> Self {
        Self {
            orchestrator,
            token: token.to_owned(),
            default_namespace: default_namespace.to_owned(),
        }
    }

    fn authenticate(&self, credentials: Option<&Credentials>) -> Result<(), Status> {
        let presented = credentials.map(|credentials| credentials.token.as_str());

        if presented != Some(self.token.as_str()) {
            return Err(Status::unauthenticated("invalid or missing token"));
        }

        Ok(())
    }

    fn identity(&self, name: &str, namespace: &str) -> Result<EnvironmentId, Status> {
        if name.is_empty() {
            return Err(Status::invalid_argument("name must not be empty"));
        }

        let namespace = if namespace.is_empty() {
            &self.default_namespace
        } else {
            namespace
        };

        Ok(EnvironmentId::new(namespace, name))
    }
}

fn wire_state(state: crate::environment::EnvironmentState) -> WireState {
    use crate::environment::EnvironmentState::*;

    match state {
        Requested => WireState::Requested,
        Provisioning => WireState::Provisioning,
        Ready => WireState::Ready,
        Failed => WireState::Failed,
        Destroying => WireState::Destroying,
        Destroyed => WireState::Destroyed,
    }
}

fn wire_status(record: &crate::environment::EnvironmentRecord) -> EnvironmentStatus {
    EnvironmentStatus {
        name: record.id.name.clone(),
        namespace: record.id.namespace.clone(),
        state: wire_state(record.state) as i32,
        message: record.message.clone().unwrap_or_default(),
        created_at: record.created_at.to_rfc3339(),
        ttl: record.ttl.as_str().to_owned(),
    }
}

fn store_status(error: StoreError) -> Status {
    match error {
        StoreError::NotFound => Status::not_found("environment vanished mid-operation"),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl Environments for EnvironmentsService {
    async fn build(
        &self,
        request: Request<BuildRequest>,
    ) -> Result<Response<BuildResponse>, Status> {
        let request = request.into_inner();
        self.authenticate(request.credentials.as_ref())?;

        let id = self.identity(&request.name, &request.namespace)?;

        if request.image.is_empty() {
            return Err(Status::invalid_argument("image must not be empty"));
        }

        let ttl = request
            .ttl
            .parse::<Ttl>()
            .map_err(|source| Status::invalid_argument(source.to_string()))?;

        let registry_credential = if request.registry_credential.is_empty() {
            None
        } else {
            // The payload lands verbatim in a dockerconfigjson secret, so
            // reject anything the kubelet would choke on later.
            serde_json::from_str::<serde_json::Value>(&request.registry_credential)
                .map_err(|_| Status::invalid_argument("registry credential is not valid JSON"))?;

            Some(request.registry_credential)
        };

        let spec = BuildSpec {
            image: request.image,
            registry_credential,
            ttl,
            expose_ingress: request.expose_ingress,
            expose_ssh: request.expose_ssh,
        };

        let record = self
            .orchestrator
            .build(id, spec)
            .await
            .map_err(store_status)?;

        Ok(Response::new(BuildResponse {
            status: Some(wire_status(&record)),
        }))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let request = request.into_inner();
        self.authenticate(request.credentials.as_ref())?;

        let id = self.identity(&request.name, &request.namespace)?;

        let record = self.orchestrator.status(&id).await.map_err(store_status)?;

        Ok(Response::new(StatusResponse {
            found: record.is_some(),
            status: record.as_ref().map(wire_status),
        }))
    }

    async fn destroy(
        &self,
        request: Request<DestroyRequest>,
    ) -> Result<Response<DestroyResponse>, Status> {
        let request = request.into_inner();
        self.authenticate(request.credentials.as_ref())?;

        let id = self.identity(&request.name, &request.namespace)?;

        let outcome = self.orchestrator.destroy(&id).await.map_err(store_status)?;

        let outcome = match outcome {
            DestroyOutcome::Destroyed => destroy_response::Outcome::Destroyed,
            DestroyOutcome::NotFound => destroy_response::Outcome::NotFound,
        };

        Ok(Response::new(DestroyResponse {
            outcome: outcome as i32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::{AddonDescriptor, AddonKind};
    use crate::cache::VolumeRef;
    use crate::metrics::Metrics;
    use crate::store::MemoryStore;
    use tonic::Code;

    fn service() -> EnvironmentsService {
        let store = Arc::new(MemoryStore::new());
        let cache = VolumeRef {
            namespace: "default".to_owned(),
            name: "envgrid-cache".to_owned(),
        };
        let addons = vec![AddonDescriptor {
            kind: AddonKind::Ingress,
            image: "traefik".to_owned(),
            version: "1.7".to_owned(),
            port: Some(80),
        }];

        let orchestrator = Arc::new(Orchestrator::new(store, cache, &addons, Metrics::new()));

        EnvironmentsService::new(orchestrator, "sesame", "default")
    }

    fn credentials(token: &str) -> Option<Credentials> {
        Some(Credentials {
            token: token.to_owned(),
        })
    }

    fn build_request(token: &str) -> BuildRequest {
        BuildRequest {
            credentials: credentials(token),
            name: "pr-42".to_owned(),
            namespace: String::new(),
            image: "app:1.0".to_owned(),
            ttl: "24h".to_owned(),
            registry_credential: String::new(),
            expose_ingress: true,
            expose_ssh: false,
        }
    }

    #[tokio::test]
    async fn calls_without_the_token_are_rejected() {
        let service = service();

        let err = service
            .build(Request::new(build_request("wrong")))
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn build_reports_ready_and_fills_the_default_namespace() {
        let service = service();

        let response = service
            .build(Request::new(build_request("sesame")))
            .await
            .unwrap()
            .into_inner();

        let status = response.status.unwrap();
        assert_eq!(status.state, WireState::Ready as i32);
        assert_eq!(status.namespace, "default");
        assert_eq!(status.ttl, "24h");
    }

    #[tokio::test]
    async fn malformed_ttl_is_an_invalid_argument() {
        let service = service();
        let mut request = build_request("sesame");
        request.ttl = "soon".to_owned();

        let err = service.build(Request::new(request)).await.unwrap_err();

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn a_registry_credential_has_to_be_json() {
        let service = service();
        let mut request = build_request("sesame");
        request.registry_credential = "not json".to_owned();

        let err = service.build(Request::new(request)).await.unwrap_err();

        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn status_distinguishes_absence_from_presence() {
        let service = service();

        let absent = service
            .status(Request::new(StatusRequest {
                credentials: credentials("sesame"),
                name: "pr-42".to_owned(),
                namespace: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!absent.found);
        assert!(absent.status.is_none());

        service
            .build(Request::new(build_request("sesame")))
            .await
            .unwrap();

        let present = service
            .status(Request::new(StatusRequest {
                credentials: credentials("sesame"),
                name: "pr-42".to_owned(),
                namespace: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(present.found);
        assert_eq!(
            present.status.unwrap().state,
            WireState::Ready as i32
        );
    }

    #[tokio::test]
    async fn destroy_reports_what_it_accomplished() {
        let service = service();

        let missing = service
            .destroy(Request::new(DestroyRequest {
                credentials: credentials("sesame"),
                name: "pr-42".to_owned(),
                namespace: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(missing.outcome, destroy_response::Outcome::NotFound as i32);

        service
            .build(Request::new(build_request("sesame")))
            .await
            .unwrap();

        let destroyed = service
            .destroy(Request::new(DestroyRequest {
                credentials: credentials("sesame"),
                name: "pr-42".to_owned(),
                namespace: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            destroyed.outcome,
            destroy_response::Outcome::Destroyed as i32
        );
    }
}
