#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::DecodingKey;
use moka::sync::Cache;
use reqwest::StatusCode;
use serde::Deserialize;

use super::jwks::{JwksClient, JwksError, MAX_JWKS_SIZE};

const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(60 * 60);
pub const MAX_CACHED_ISSUERS: u64 = 256;

/// The subset of an OpenID Provider configuration the proxy uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OidcConfiguration {
    pub issuer: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

pub fn normalize_issuer(issuer: &str) -> String {
    issuer.trim_end_matches('/').to_owned()
}

#[must_use]
pub fn discovery_url(issuer: &str) -> String {
    format!("{}/.well-known/openid-configuration", normalize_issuer(issuer))
}

pub async fn discover(
    http_client: &reqwest::Client,
    issuer: &str,
) -> Result<OidcConfiguration, JwksError> {
    let url = discovery_url(issuer);
    tracing::debug!(%url, "fetching openid configuration");
    let response = http_client.get(&url).send().await?;
    if response.status() != StatusCode::OK {
        return Err(JwksError::Status(response.status()));
    }
    let payload = response.bytes().await?;
    if payload.len() > MAX_JWKS_SIZE {
        return Err(JwksError::PayloadTooLarge(payload.len()));
    }
    Ok(serde_json::from_slice(&payload)?)
}

/// Resolves an issuer to the keys its tokens may be verified with.
#[async_trait]
pub trait IssuerKeyResolver: Send + Sync {
    async fn resolve_keys(
        &self,
        issuer: &str,
        kid: Option<&str>,
    ) -> Result<Vec<Arc<DecodingKey>>, JwksError>;
}

/// Discovers each issuer's key set on first use and keeps one
/// [`JwksClient`] per issuer afterwards. At most [`MAX_CACHED_ISSUERS`]
/// issuers are kept, each for one refresh TTL.
pub struct OidcKeyResolver {
    http_client: reqwest::Client,
    refresh_ttl: Duration,
    clients: Cache<String, Arc<JwksClient>>,
}

impl OidcKeyResolver {
    #[must_use]
    pub fn new(refresh_ttl: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let refresh_ttl = if refresh_ttl.is_zero() {
            DEFAULT_REFRESH_TTL
        } else {
            refresh_ttl
        };

        Self {
            http_client,
            refresh_ttl,
            clients: Cache::builder()
                .max_capacity(MAX_CACHED_ISSUERS)
                .time_to_live(refresh_ttl)
                .build(),
        }
    }

    async fn client_for(&self, issuer: &str) -> Result<Arc<JwksClient>, JwksError> {
        let issuer = normalize_issuer(issuer);
        if let Some(client) = self.clients.get(&issuer) {
            return Ok(client);
        }

        let configuration = discover(&self.http_client, &issuer).await?;
        tracing::debug!(%issuer, jwks_uri = %configuration.jwks_uri, "discovered issuer key set");
        let mut client = JwksClient::new(configuration.jwks_uri, self.refresh_ttl);
        client.set_http_client(self.http_client.clone());

        let client = Arc::new(client);
        self.clients.insert(issuer, Arc::clone(&client));
        Ok(client)
    }
}

impl Default for OidcKeyResolver {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_TTL)
    }
}

#[async_trait]
impl IssuerKeyResolver for OidcKeyResolver {
    async fn resolve_keys(
        &self,
        issuer: &str,
        kid: Option<&str>,
    ) -> Result<Vec<Arc<DecodingKey>>, JwksError> {
        self.client_for(issuer).await?.get_keys(kid).await
    }
}
