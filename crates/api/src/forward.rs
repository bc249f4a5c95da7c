use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{AUTHORIZATION, CONNECTION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::Response;

/// Request headers never replayed upstream.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "x-forwarded-host",
    "x-forwarded-proto",
    "server",
    "set-cookie",
    "host",
    "content-length",
];

/// Credentials the caller presented; replaced by the proxy's own when it
/// forwards on a delegator's behalf.
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "dpop"];

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("invalid outbound credentials header")]
    InvalidCredentials,
    #[error("failed to build response: {0}")]
    Response(#[from] axum::http::Error),
}

/// Outbound credentials minted for one forwarded request.
#[derive(Debug, Clone, Copy)]
pub struct OutboundCredentials<'a> {
    pub access_token: &'a str,
    pub proof: &'a str,
}

#[derive(Debug)]
pub struct ForwardRequest<'a> {
    pub method: Method,
    pub uri: &'a str,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
    /// `None` relays the caller's own credentials untouched.
    pub credentials: Option<OutboundCredentials<'a>>,
}

pub struct ForwardingGateway {
    http_client: reqwest::Client,
}

impl ForwardingGateway {
    #[must_use]
    pub fn new() -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http_client }
    }

    #[must_use]
    pub fn with_http_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    /// Sends the request upstream and relays the response. The body is
    /// streamed back as it arrives.
    pub async fn forward(&self, request: ForwardRequest<'_>) -> Result<Response, ForwardError> {
        let mut headers = forwardable_headers(request.headers, request.credentials.is_some());
        if let Some(credentials) = request.credentials {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::try_from(format!("DPoP {}", credentials.access_token))
                    .map_err(|_| ForwardError::InvalidCredentials)?,
            );
            headers.insert(
                HeaderName::from_static("dpop"),
                HeaderValue::try_from(credentials.proof)
                    .map_err(|_| ForwardError::InvalidCredentials)?,
            );
        }

        let mut outbound = self
            .http_client
            .request(request.method.clone(), request.uri)
            .headers(headers);
        if !request.body.is_empty() {
            outbound = outbound.body(request.body);
        }
        let upstream = outbound.send().await?;
        tracing::debug!(
            method = %request.method,
            uri = request.uri,
            status = upstream.status().as_u16(),
            "received upstream response"
        );

        let mut builder = Response::builder().status(upstream.status());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop(name.as_str()) {
                    headers.append(name.clone(), value.clone());
                }
            }
        }
        Ok(builder.body(Body::from_stream(upstream.bytes_stream()))?)
    }
}

impl Default for ForwardingGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Copies `headers` minus routing, hop-by-hop and (when `strip_credentials`)
/// the caller's credential headers. Headers named in `Connection` are
/// hop-by-hop as well.
fn forwardable_headers(headers: &HeaderMap, strip_credentials: bool) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if STRIPPED_REQUEST_HEADERS.contains(&name_str)
            || is_hop_by_hop(name_str)
            || (strip_credentials && CREDENTIAL_HEADERS.contains(&name_str))
            || connection_listed.iter().any(|listed| listed == name_str)
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}
