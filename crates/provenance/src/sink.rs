use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use delegation_proxy_auth::{CredentialError, ProofError, ProofSigner, TokenSource};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("no outbound token: {0}")]
    Token(#[from] CredentialError),
    #[error("failed to sign proof: {0}")]
    Proof(#[from] ProofError),
    #[error("log request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("log container returned status {0}")]
    Status(StatusCode),
}

/// Destination for serialized provenance records.
#[async_trait]
pub trait ProvenanceSink: Send + Sync {
    async fn submit(&self, rid: &str, document: String) -> Result<(), SinkError>;
}

/// Creates one log resource per record in the delegator's logging
/// container, authenticated as the delegator.
pub struct ContainerSink {
    container: String,
    delegator: String,
    tokens: Arc<dyn TokenSource>,
    signer: Arc<ProofSigner>,
    http_client: reqwest::Client,
}

impl ContainerSink {
    #[must_use]
    pub fn new(
        container: impl Into<String>,
        delegator: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        signer: Arc<ProofSigner>,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            container: container.into(),
            delegator: delegator.into(),
            tokens,
            signer,
            http_client,
        }
    }

    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }
}

#[async_trait]
impl ProvenanceSink for ContainerSink {
    async fn submit(&self, rid: &str, document: String) -> Result<(), SinkError> {
        let token = self.tokens.token(&self.delegator).await?;
        let proof = self
            .signer
            .sign_proof("POST", &self.container, Some(&token.value))?;
        let response = self
            .http_client
            .post(&self.container)
            .header("DPoP", proof)
            .header(AUTHORIZATION, format!("DPoP {}", token.value))
            .header(CONTENT_TYPE, "text/turtle")
            .body(document)
            .send()
            .await?;

        if response.status() != StatusCode::CREATED {
            return Err(SinkError::Status(response.status()));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        tracing::debug!(rid, location, "created log entry");
        Ok(())
    }
}

/// Used when the delegator has no logging container.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl ProvenanceSink for DiscardSink {
    async fn submit(&self, rid: &str, _document: String) -> Result<(), SinkError> {
        tracing::warn!(rid, "no logging container configured, dropping provenance record");
        Ok(())
    }
}
