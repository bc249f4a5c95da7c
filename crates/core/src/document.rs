use std::time::Duration;

use async_trait::async_trait;
use oxrdf::Graph;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;

use crate::graph::{parse_turtle, GraphError};

pub const MAX_DOCUMENT_SIZE: usize = 4 << 20;

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("failed to fetch document: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("document endpoint returned status {0}")]
    Status(StatusCode),
    #[error("document too large: {0} bytes")]
    TooLarge(usize),
    #[error("document is not valid UTF-8")]
    Encoding,
    #[error(transparent)]
    Parse(#[from] GraphError),
}

/// Fetches a linked-data document and exposes it as a triple set.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_graph(&self, url: &str) -> Result<Graph, DocumentError>;
}

pub struct HttpDocumentFetcher {
    http_client: reqwest::Client,
}

impl HttpDocumentFetcher {
    #[must_use]
    pub fn new() -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http_client }
    }

    #[must_use]
    pub fn with_http_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

impl Default for HttpDocumentFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch_graph(&self, url: &str) -> Result<Graph, DocumentError> {
        let response = self
            .http_client
            .get(crate::graph::document_iri(url))
            .header(ACCEPT, "text/turtle")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DocumentError::Status(response.status()));
        }

        let payload = response.bytes().await?;
        if payload.len() > MAX_DOCUMENT_SIZE {
            return Err(DocumentError::TooLarge(payload.len()));
        }
        let document = std::str::from_utf8(&payload).map_err(|_| DocumentError::Encoding)?;
        tracing::debug!(url, bytes = payload.len(), "fetched document");
        Ok(parse_turtle(document, url)?)
    }
}
