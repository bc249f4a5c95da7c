use axum::body::Bytes;
use axum::extract::Request;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use delegation_proxy_core::graph::parse_iri;
use delegation_proxy_core::vocab::FOAF_AGENT;
use delegation_proxy_core::{DenialReason, ErrorKind, ProxyDecision};
use delegation_proxy_provenance::ProvenanceRecord;
use time::OffsetDateTime;

use crate::forward::{ForwardRequest, OutboundCredentials};
use crate::ApiState;

pub const MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

const MISSING_HOST: &str = "No \"host\" query parameter specified!";
const INVALID_HOST: &str = "Invalid \"host\" query parameter!";
const INVALID_PATH: &str = "Invalid request path!";
const UNREADABLE_BODY: &str = "Could not read request body!";
const POLICY_DENIED: &str = "Access denied by policies!";
const NO_CREDENTIALS: &str = "Could not obtain delegator credentials!";
const UPSTREAM_FAILED: &str = "Upstream request failed!";

/// What the pipeline decided and the response to send for it.
pub struct PipelineOutcome {
    pub decision: ProxyDecision,
    pub response: Response,
}

impl PipelineOutcome {
    fn new(decision: ProxyDecision, response: Response) -> Self {
        Self { decision, response }
    }

    fn plain(decision: ProxyDecision, status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(decision, (status, message.into()).into_response())
    }
}

/// Where a request goes upstream. `proof_uri` is what proofs are bound to;
/// `forward_uri` additionally carries the query parameters other than `host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub proof_uri: String,
    pub forward_uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetError {
    MissingHost,
    InvalidHost,
    InvalidPath,
}

impl UpstreamTarget {
    pub fn from_uri(scheme: &str, uri: &Uri) -> Result<Self, TargetError> {
        let mut host = None;
        let mut rest = Vec::new();
        for segment in uri.query().unwrap_or_default().split('&') {
            if segment.is_empty() {
                continue;
            }
            match url::form_urlencoded::parse(segment.as_bytes()).next() {
                Some((key, value)) if key == "host" && host.is_none() => {
                    host = Some(value.into_owned());
                }
                _ => rest.push(segment),
            }
        }

        let host = host
            .filter(|host| !host.is_empty())
            .ok_or(TargetError::MissingHost)?;
        if host
            .chars()
            .any(|c| matches!(c, '/' | '?' | '#' | '@' | '\\') || c.is_whitespace())
        {
            return Err(TargetError::InvalidHost);
        }

        let proof_uri = format!("{scheme}://{host}{}", uri.path());
        let parsed = url::Url::parse(&proof_uri).map_err(|_| TargetError::InvalidHost)?;
        if parsed.host_str().is_none() {
            return Err(TargetError::InvalidHost);
        }
        // The proof URI is logged as an IRI term.
        if parse_iri(&proof_uri).is_err() {
            return Err(TargetError::InvalidPath);
        }

        let forward_uri = if rest.is_empty() {
            proof_uri.clone()
        } else {
            format!("{proof_uri}?{}", rest.join("&"))
        };
        Ok(Self {
            proof_uri,
            forward_uri,
        })
    }
}

/// `Authorization: DPoP <token>` together with `DPoP: <proof>`.
fn dpop_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let token = headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("DPoP ")?
        .trim();
    let proof = headers.get("dpop")?.to_str().ok()?.trim();
    if token.is_empty() || proof.is_empty() {
        return None;
    }
    Some((token.to_owned(), proof.to_owned()))
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn flush(state: &ApiState, record: ProvenanceRecord, decision: ProxyDecision) {
    if decision.has_decision() != record.has_complete_decision() {
        tracing::warn!(
            rid = record.rid(),
            %decision,
            "provenance record does not bracket the decision"
        );
    }
    state.logger.flush(record);
}

pub async fn handle(state: &ApiState, rid: &str, request: Request) -> PipelineOutcome {
    let received_at = now();
    let (parts, body) = request.into_parts();
    let method = parts.method;

    let target = match UpstreamTarget::from_uri(&state.upstream_scheme, &parts.uri) {
        Ok(target) => target,
        Err(error) => {
            tracing::warn!(uri = %parts.uri, ?error, "client did not specify a usable host");
            let message = match error {
                TargetError::MissingHost => MISSING_HOST,
                TargetError::InvalidHost => INVALID_HOST,
                TargetError::InvalidPath => INVALID_PATH,
            };
            return PipelineOutcome::plain(
                ProxyDecision::Error(ErrorKind::MissingHost),
                StatusCode::BAD_REQUEST,
                message,
            );
        }
    };

    let body: Bytes = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(%error, "failed to read request body");
            return PipelineOutcome::plain(
                ProxyDecision::Error(ErrorKind::UnreadableBody),
                StatusCode::BAD_REQUEST,
                UNREADABLE_BODY,
            );
        }
    };

    let mut record = ProvenanceRecord::new(rid);

    let Some((access_token, proof)) = dpop_credentials(&parts.headers) else {
        tracing::info!(
            uri = %target.forward_uri,
            "no proof-of-possession headers, forwarding unauthenticated"
        );
        record.record_incoming(method.as_str(), &target.proof_uri, FOAF_AGENT, received_at);
        flush(state, record, ProxyDecision::PassThroughUnauthenticated);

        let forwarded = state
            .gateway
            .forward(ForwardRequest {
                method,
                uri: &target.forward_uri,
                headers: &parts.headers,
                body,
                credentials: None,
            })
            .await;
        let response = match forwarded {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "upstream request failed");
                (StatusCode::BAD_GATEWAY, UPSTREAM_FAILED).into_response()
            }
        };
        return PipelineOutcome::new(ProxyDecision::PassThroughUnauthenticated, response);
    };

    let identity = match state
        .verifier
        .verify(&access_token, &proof, method.as_str(), &target.proof_uri)
        .await
    {
        Ok(identity) => identity,
        Err(error) => {
            tracing::warn!(%error, "rejecting request");
            let incoming =
                record.record_incoming(method.as_str(), &target.proof_uri, FOAF_AGENT, received_at);
            record.record_decision_activity(FOAF_AGENT, now(), &incoming, false);
            record.record_decision_end(now());
            let decision = ProxyDecision::Denied(DenialReason::Verification);
            flush(state, record, decision);
            return PipelineOutcome::plain(
                decision,
                StatusCode::FORBIDDEN,
                error.to_string(),
            );
        }
    };

    let delegate = identity.web_id;
    tracing::info!(
        %delegate,
        method = %method,
        uri = %target.proof_uri,
        "delegate wants to send a request"
    );
    let incoming =
        record.record_incoming(method.as_str(), &target.proof_uri, &delegate, received_at);

    let decision_started = now();
    let allowed = state
        .policy
        .is_authorized(&state.delegator, &delegate, &target.proof_uri, method.as_str())
        .await;
    record.record_decision_activity(&delegate, decision_started, &incoming, allowed);
    if !allowed {
        tracing::warn!(%delegate, "{POLICY_DENIED}");
        record.record_decision_end(now());
        let decision = ProxyDecision::Denied(DenialReason::Policy);
        flush(state, record, decision);
        return PipelineOutcome::plain(
            decision,
            StatusCode::FORBIDDEN,
            POLICY_DENIED,
        );
    }

    let token = match state.tokens.token(&state.delegator).await {
        Ok(token) => token,
        Err(error) => {
            tracing::error!(
                delegator = %state.delegator,
                %error,
                "could not obtain outbound token"
            );
            record.record_decision_end(now());
            let decision = ProxyDecision::Error(ErrorKind::CredentialExchangeFailed);
            flush(state, record, decision);
            return PipelineOutcome::plain(
                decision,
                StatusCode::INTERNAL_SERVER_ERROR,
                NO_CREDENTIALS,
            );
        }
    };
    let outbound_proof = match state.signer.sign_proof(
        method.as_str(),
        &target.proof_uri,
        Some(&token.value),
    ) {
        Ok(proof) => proof,
        Err(error) => {
            tracing::error!(%error, "could not sign outbound proof");
            record.record_decision_end(now());
            let decision = ProxyDecision::Error(ErrorKind::CredentialExchangeFailed);
            flush(state, record, decision);
            return PipelineOutcome::plain(
                decision,
                StatusCode::INTERNAL_SERVER_ERROR,
                NO_CREDENTIALS,
            );
        }
    };

    let sent_at = now();
    let forwarded = state
        .gateway
        .forward(ForwardRequest {
            method: method.clone(),
            uri: &target.forward_uri,
            headers: &parts.headers,
            body,
            credentials: Some(OutboundCredentials {
                access_token: &token.value,
                proof: &outbound_proof,
            }),
        })
        .await;

    match forwarded {
        Ok(response) => {
            tracing::info!(status = response.status().as_u16(), "forwarded request");
            record.record_outbound_request(
                method.as_str(),
                &target.proof_uri,
                &state.delegator,
                sent_at,
            );
            record.record_decision_end(now());
            flush(state, record, ProxyDecision::Forwarded);
            PipelineOutcome::new(ProxyDecision::Forwarded, response)
        }
        Err(error) => {
            tracing::warn!(%error, "upstream request failed");
            record.record_decision_end(now());
            let decision = ProxyDecision::Error(ErrorKind::UpstreamFetchError);
            flush(state, record, decision);
            PipelineOutcome::new(
                decision,
                (StatusCode::BAD_GATEWAY, UPSTREAM_FAILED).into_response(),
            )
        }
    }
}
