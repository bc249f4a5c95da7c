#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use delegation_proxy_core::graph::object_iris;
use delegation_proxy_core::vocab::SOLID_OIDC_ISSUER;
use delegation_proxy_core::{DocumentError, DocumentFetcher};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::dpop::{ProofError, ProofSigner};
use crate::jwt::{discover, JwksError};

/// Default lead time before expiry at which a cached token is replaced.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(9 * 60);

#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// An access token the proxy holds for a delegator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundToken {
    pub value: String,
    pub delegator: String,
    pub expires_at: SystemTime,
}

impl OutboundToken {
    fn outlives(&self, margin: Duration) -> bool {
        SystemTime::now()
            .checked_add(margin)
            .is_some_and(|deadline| self.expires_at > deadline)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("failed to fetch delegator profile: {0}")]
    Profile(#[from] DocumentError),
    #[error("found {0} OIDC issuers in the delegator profile, needed exactly one")]
    IssuerCount(usize),
    #[error("failed to discover token endpoint: {0}")]
    Discovery(#[from] JwksError),
    #[error("issuer does not advertise a token endpoint")]
    MissingTokenEndpoint,
    #[error("failed to sign proof: {0}")]
    Proof(#[from] ProofError),
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned status {0}")]
    Status(StatusCode),
    #[error("token response carries no expiry")]
    MissingExpiry,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no client credentials configured for {0}")]
    UnknownDelegator(String),
    #[error("credential exchange failed: {0}")]
    CredentialExchangeFailed(#[from] ExchangeError),
}

/// Supplies outbound access tokens for delegators.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, delegator: &str) -> Result<OutboundToken, CredentialError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExpiryClaims {
    #[serde(default)]
    exp: Option<u64>,
}

#[derive(Default)]
struct SlotState {
    token: Option<OutboundToken>,
    token_endpoint: Option<String>,
}

struct Slot {
    credentials: ClientCredentials,
    state: Mutex<SlotState>,
}

/// One cached outbound token per delegator. Each delegator has its own lock,
/// held across a refresh so that concurrent callers share one exchange.
pub struct DelegatorCredentialManager {
    documents: Arc<dyn DocumentFetcher>,
    signer: Arc<ProofSigner>,
    http_client: reqwest::Client,
    safety_margin: Duration,
    slots: HashMap<String, Slot>,
}

impl DelegatorCredentialManager {
    #[must_use]
    pub fn new(documents: Arc<dyn DocumentFetcher>, signer: Arc<ProofSigner>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            documents,
            signer,
            http_client,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            slots: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    #[must_use]
    pub fn with_delegator(
        mut self,
        delegator: impl Into<String>,
        credentials: ClientCredentials,
    ) -> Self {
        self.slots.insert(
            delegator.into(),
            Slot {
                credentials,
                state: Mutex::new(SlotState::default()),
            },
        );
        self
    }

    pub async fn get_token(&self, delegator: &str) -> Result<OutboundToken, CredentialError> {
        let slot = self
            .slots
            .get(delegator)
            .ok_or_else(|| CredentialError::UnknownDelegator(delegator.to_owned()))?;
        let mut state = slot.state.lock().await;

        if let Some(token) = state.token.as_ref() {
            if token.outlives(self.safety_margin) {
                tracing::debug!(delegator, "reusing cached outbound token");
                return Ok(token.clone());
            }
        }

        let token_endpoint = match state.token_endpoint.clone() {
            Some(endpoint) => endpoint,
            None => {
                let endpoint = self.discover_token_endpoint(delegator).await?;
                state.token_endpoint = Some(endpoint.clone());
                endpoint
            }
        };

        let token = self
            .exchange(delegator, &slot.credentials, &token_endpoint)
            .await?;
        tracing::info!(delegator, "obtained outbound token");
        state.token = Some(token.clone());
        Ok(token)
    }

    async fn discover_token_endpoint(&self, delegator: &str) -> Result<String, ExchangeError> {
        let issuer = self.delegator_issuer(delegator).await?;
        let configuration = discover(&self.http_client, &issuer).await?;
        let endpoint = configuration
            .token_endpoint
            .ok_or(ExchangeError::MissingTokenEndpoint)?;
        tracing::debug!(delegator, %endpoint, "found token endpoint");
        Ok(endpoint)
    }

    /// The single OIDC issuer named in the delegator's profile.
    pub async fn delegator_issuer(&self, delegator: &str) -> Result<String, ExchangeError> {
        let profile = self.documents.fetch_graph(delegator).await?;
        let mut issuers = object_iris(&profile, delegator, SOLID_OIDC_ISSUER);
        if issuers.len() != 1 {
            return Err(ExchangeError::IssuerCount(issuers.len()));
        }
        Ok(issuers.remove(0))
    }

    async fn exchange(
        &self,
        delegator: &str,
        credentials: &ClientCredentials,
        token_endpoint: &str,
    ) -> Result<OutboundToken, ExchangeError> {
        let proof = self.signer.sign_proof("POST", token_endpoint, None)?;
        let response = self
            .http_client
            .post(token_endpoint)
            .header("DPoP", proof)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ExchangeError::Status(response.status()));
        }
        let response: TokenResponse = response.json().await?;

        let expires_at = token_expiry(&response.access_token)
            .or_else(|| {
                response
                    .expires_in
                    .and_then(|expires_in| {
                        SystemTime::now().checked_add(Duration::from_secs(expires_in))
                    })
            })
            .ok_or(ExchangeError::MissingExpiry)?;

        Ok(OutboundToken {
            value: response.access_token,
            delegator: delegator.to_owned(),
            expires_at,
        })
    }
}

#[async_trait]
impl TokenSource for DelegatorCredentialManager {
    async fn token(&self, delegator: &str) -> Result<OutboundToken, CredentialError> {
        self.get_token(delegator).await
    }
}

/// The `exp` claim of a JWT access token, read without verification.
fn token_expiry(token: &str) -> Option<SystemTime> {
    let payload = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    let claims: ExpiryClaims = serde_json::from_slice(&payload).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_secs(claims.exp?))
}
