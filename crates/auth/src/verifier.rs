#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use serde::Deserialize;

use delegation_proxy_core::graph::parse_iri;

use crate::dpop::{access_token_hash, unix_now, ProofClaims, DPOP_JWT_TYPE};
use crate::jwt::{normalize_issuer, parse_jwk, IssuerKeyResolver, JwksError, JWK};
use crate::replay::ReplayCache;

pub const DEFAULT_PROOF_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub web_id: String,
    pub issuer: String,
    pub client_id: Option<String>,
    pub thumbprint: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Auth token invalid: {0}")]
    MalformedToken(&'static str),
    #[error("Auth token invalid: Issuer is not trusted!")]
    UntrustedIssuer,
    #[error("Auth token invalid: Could not resolve issuer keys!")]
    IssuerUnreachable,
    #[error("Auth token invalid: Signature verification failed!")]
    InvalidSignature,
    #[error("Auth token invalid: Token expired!")]
    ExpiredToken,
    #[error("DPoP invalid: Thumbprint not matching signing key!")]
    ThumbprintMismatch,
    #[error("DPoP invalid: Signature verification failed!")]
    InvalidProofSignature,
    #[error("DPoP invalid: Proof is not fresh!")]
    StaleProof,
    #[error("Auth token invalid: Requested method or URI does not match!")]
    RequestMismatch,
    #[error("DPoP invalid: Proof was already used!")]
    ReplayedProof,
}

#[derive(Debug, Clone, Default)]
pub struct VerifierConfig {
    /// Accepted token issuers. Empty accepts any issuer.
    pub trusted_issuers: Vec<String>,
    pub proof_max_age: Duration,
}

#[derive(Debug, Deserialize)]
struct AccessTokenClaims {
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    webid: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    cnf: Option<Confirmation>,
    #[serde(default)]
    exp: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    #[serde(default)]
    jkt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProofHeader {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
    #[serde(default)]
    jwk: Option<JWK>,
}

#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: Option<String>,
}

/// Checks an inbound access token against the possession proof sent with it
/// and the request it was sent for.
pub struct ProofOfPossessionVerifier {
    resolver: Arc<dyn IssuerKeyResolver>,
    trusted_issuers: HashSet<String>,
    proof_max_age: Duration,
    replay: ReplayCache,
}

impl ProofOfPossessionVerifier {
    #[must_use]
    pub fn new(resolver: Arc<dyn IssuerKeyResolver>, config: VerifierConfig) -> Self {
        let proof_max_age = if config.proof_max_age.is_zero() {
            DEFAULT_PROOF_MAX_AGE
        } else {
            config.proof_max_age
        };
        Self {
            resolver,
            trusted_issuers: config
                .trusted_issuers
                .iter()
                .map(|issuer| normalize_issuer(issuer))
                .collect(),
            proof_max_age,
            // iat may lie up to max_age ahead, so a proof stays fresh for
            // twice that after its first use.
            replay: ReplayCache::new(proof_max_age * 2),
        }
    }

    pub async fn verify(
        &self,
        access_token: &str,
        proof: &str,
        method: &str,
        uri: &str,
    ) -> Result<VerifiedIdentity, VerifyError> {
        let issuer = extract_unverified_issuer(access_token)?;
        if !self.trusted_issuers.is_empty()
            && !self.trusted_issuers.contains(&normalize_issuer(&issuer))
        {
            return Err(VerifyError::UntrustedIssuer);
        }

        let header = decode_header(access_token)
            .map_err(|_| VerifyError::MalformedToken("Not a signed JWT!"))?;
        let keys = self
            .resolver
            .resolve_keys(&issuer, header.kid.as_deref())
            .await
            .map_err(|error| match error {
                JwksError::KeyNotFound(_) | JwksError::NoKeys => VerifyError::InvalidSignature,
                error => {
                    tracing::warn!(%issuer, %error, "failed to resolve issuer keys");
                    VerifyError::IssuerUnreachable
                }
            })?;

        let claims = verify_access_token(access_token, &header, &keys)?;
        let exp = claims
            .exp
            .ok_or(VerifyError::MalformedToken("No expiry!"))?;
        let now = unix_now().map_err(|_| VerifyError::ExpiredToken)?;
        if now > exp {
            return Err(VerifyError::ExpiredToken);
        }
        if claims.iss.as_deref().map(normalize_issuer) != Some(normalize_issuer(&issuer)) {
            return Err(VerifyError::InvalidSignature);
        }
        let web_id = claims
            .webid
            .filter(|web_id| !web_id.is_empty())
            .ok_or(VerifyError::MalformedToken("No WebID!"))?;
        if !is_http_iri(&web_id) {
            return Err(VerifyError::MalformedToken("Invalid WebID!"));
        }
        let expected_thumbprint = claims
            .cnf
            .and_then(|cnf| cnf.jkt)
            .ok_or(VerifyError::ThumbprintMismatch)?;

        let proof_header = decode_proof_header(proof)?;
        if proof_header.typ.as_deref() != Some(DPOP_JWT_TYPE) {
            return Err(VerifyError::InvalidProofSignature);
        }
        let proof_jwk = proof_header.jwk.ok_or(VerifyError::InvalidProofSignature)?;
        let thumbprint = proof_jwk
            .thumbprint()
            .map_err(|_| VerifyError::InvalidProofSignature)?;
        if thumbprint != expected_thumbprint {
            return Err(VerifyError::ThumbprintMismatch);
        }

        let algorithm = Algorithm::from_str(&proof_header.alg)
            .map_err(|_| VerifyError::InvalidProofSignature)?;
        let proof_key = parse_jwk(&proof_jwk).map_err(|_| VerifyError::InvalidProofSignature)?;
        let proof_claims = decode::<ProofClaims>(proof, &proof_key, &validation(algorithm)?)
            .map_err(|_| VerifyError::InvalidProofSignature)?
            .claims;
        if proof_claims
            .ath
            .as_deref()
            .is_some_and(|ath| ath != access_token_hash(access_token))
        {
            return Err(VerifyError::InvalidProofSignature);
        }

        if proof_claims.htm != method || proof_claims.htu != uri {
            tracing::debug!(
                htm = %proof_claims.htm,
                htu = %proof_claims.htu,
                method,
                uri,
                "proof bound to a different request"
            );
            return Err(VerifyError::RequestMismatch);
        }

        let now = unix_now().map_err(|_| VerifyError::StaleProof)?;
        if now.abs_diff(proof_claims.iat) > self.proof_max_age.as_secs() {
            return Err(VerifyError::StaleProof);
        }
        if !self.replay.check_and_record(&thumbprint, &proof_claims.jti) {
            return Err(VerifyError::ReplayedProof);
        }

        Ok(VerifiedIdentity {
            web_id,
            issuer,
            client_id: claims.client_id,
            thumbprint,
        })
    }
}

fn verify_access_token(
    token: &str,
    header: &Header,
    keys: &[Arc<DecodingKey>],
) -> Result<AccessTokenClaims, VerifyError> {
    let validation = validation(header.alg).map_err(|_| VerifyError::InvalidSignature)?;
    for key in keys {
        if let Ok(token_data) = decode::<AccessTokenClaims>(token, key, &validation) {
            return Ok(token_data.claims);
        }
    }
    Err(VerifyError::InvalidSignature)
}

fn validation(algorithm: Algorithm) -> Result<Validation, VerifyError> {
    if matches!(
        algorithm,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    ) {
        return Err(VerifyError::InvalidProofSignature);
    }
    let mut validation = Validation::new(algorithm);
    validation.validate_aud = false;
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    Ok(validation)
}

fn extract_unverified_issuer(token: &str) -> Result<String, VerifyError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or(VerifyError::MalformedToken("No issuer!"))?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload.as_bytes())
        .map_err(|_| VerifyError::MalformedToken("No issuer!"))?;
    let claims: UnverifiedClaims =
        serde_json::from_slice(&payload).map_err(|_| VerifyError::MalformedToken("No issuer!"))?;
    claims
        .iss
        .filter(|issuer| !issuer.is_empty())
        .ok_or(VerifyError::MalformedToken("No issuer!"))
}

fn decode_proof_header(proof: &str) -> Result<ProofHeader, VerifyError> {
    let header = proof
        .split('.')
        .next()
        .ok_or(VerifyError::InvalidProofSignature)?;
    let header = URL_SAFE_NO_PAD
        .decode(header.as_bytes())
        .map_err(|_| VerifyError::InvalidProofSignature)?;
    serde_json::from_slice(&header).map_err(|_| VerifyError::InvalidProofSignature)
}

fn is_http_iri(value: &str) -> bool {
    parse_iri(value).is_ok() && (value.starts_with("https://") || value.starts_with("http://"))
}
