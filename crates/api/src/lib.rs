#![forbid(unsafe_code)]

mod forward;
mod pipeline;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use delegation_proxy_auth::{ProofOfPossessionVerifier, ProofSigner, TokenSource};
use delegation_proxy_policy::PolicyEvaluator;
use delegation_proxy_provenance::ProvenanceLogger;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

pub use forward::{ForwardError, ForwardRequest, ForwardingGateway, OutboundCredentials};
pub use pipeline::{handle, PipelineOutcome, TargetError, UpstreamTarget, MAX_BODY_SIZE};

pub const DEFAULT_UPSTREAM_SCHEME: &str = "https";

#[derive(Clone)]
pub struct ApiState {
    pub(crate) verifier: Arc<ProofOfPossessionVerifier>,
    pub(crate) policy: Arc<PolicyEvaluator>,
    pub(crate) tokens: Arc<dyn TokenSource>,
    pub(crate) signer: Arc<ProofSigner>,
    pub(crate) gateway: Arc<ForwardingGateway>,
    pub(crate) logger: ProvenanceLogger,
    pub(crate) delegator: Arc<str>,
    pub(crate) upstream_scheme: Arc<str>,
}

impl ApiState {
    #[must_use]
    pub fn new(
        verifier: Arc<ProofOfPossessionVerifier>,
        policy: Arc<PolicyEvaluator>,
        tokens: Arc<dyn TokenSource>,
        signer: Arc<ProofSigner>,
        gateway: Arc<ForwardingGateway>,
        logger: ProvenanceLogger,
        delegator: &str,
    ) -> Self {
        Self {
            verifier,
            policy,
            tokens,
            signer,
            gateway,
            logger,
            delegator: Arc::from(delegator),
            upstream_scheme: Arc::from(DEFAULT_UPSTREAM_SCHEME),
        }
    }

    /// Scheme used to rebuild upstream URIs. Only tests and local setups
    /// need anything other than https.
    #[must_use]
    pub fn with_upstream_scheme(mut self, scheme: &str) -> Self {
        self.upstream_scheme = Arc::from(scheme);
        self
    }

    #[must_use]
    pub fn delegator(&self) -> &str {
        &self.delegator
    }
}

/// Every method and path goes through the proxy pipeline.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .fallback(proxy)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn proxy(State(state): State<ApiState>, request: Request) -> Response {
    let rid = request_id();
    let span = tracing::info_span!("request", rid = %rid);
    async move {
        tracing::debug!(method = %request.method(), uri = %request.uri(), "incoming request");
        let outcome = pipeline::handle(&state, &rid, request).await;
        tracing::info!(
            decision = %outcome.decision,
            status = outcome.response.status().as_u16(),
            "request finished"
        );
        outcome.response
    }
    .instrument(span)
    .await
}

fn request_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
