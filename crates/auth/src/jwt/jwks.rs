#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::DecodingKey;
use p256::PublicKey;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

pub const MAX_JWKS_SIZE: usize = 1 << 20;
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct JWKS {
    pub keys: Vec<JWK>,
}

/// Public JSON Web Key. Only the members needed for verification and
/// thumbprints are kept; private members are never read.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct JWK {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    #[error("failed to fetch JWKS: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("JWKS endpoint returned status {0}")]
    Status(StatusCode),
    #[error("JWKS payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("failed to decode JWKS: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("key {0:?} not found in JWKS")]
    KeyNotFound(String),
    #[error("JWKS contains no usable keys")]
    NoKeys,
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("unsupported curve: {0}")]
    UnsupportedCurve(String),
    #[error("missing key member {0:?}")]
    MissingMember(&'static str),
    #[error("failed to decode X coordinate: {0}")]
    InvalidXCoordinate(#[source] base64::DecodeError),
    #[error("failed to decode Y coordinate: {0}")]
    InvalidYCoordinate(#[source] base64::DecodeError),
    #[error("invalid EC point: coordinate larger than 32 bytes")]
    CoordinateTooLarge,
    #[error("invalid EC point: not on curve")]
    PointNotOnCurve,
    #[error("failed to construct decoding key: {0}")]
    InvalidDecodingKey(#[source] jsonwebtoken::errors::Error),
}

impl JWK {
    /// RFC 7638 thumbprint: SHA-256 over the required members in
    /// lexicographic order, base64url without padding.
    pub fn thumbprint(&self) -> Result<String, JwksError> {
        let canonical = match self.kty.as_str() {
            "EC" => format!(
                r#"{{"crv":{},"kty":"EC","x":{},"y":{}}}"#,
                json_string(required(&self.crv, "crv")?),
                json_string(required(&self.x, "x")?),
                json_string(required(&self.y, "y")?),
            ),
            "RSA" => format!(
                r#"{{"e":{},"kty":"RSA","n":{}}}"#,
                json_string(required(&self.e, "e")?),
                json_string(required(&self.n, "n")?),
            ),
            "OKP" => format!(
                r#"{{"crv":{},"kty":"OKP","x":{}}}"#,
                json_string(required(&self.crv, "crv")?),
                json_string(required(&self.x, "x")?),
            ),
            other => return Err(JwksError::UnsupportedKeyType(other.to_owned())),
        };
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }
}

#[derive(Default)]
struct JwksCacheState {
    keys: Vec<(Option<String>, Arc<DecodingKey>)>,
    last_fetch: Option<Instant>,
}

impl JwksCacheState {
    fn select(&self, kid: Option<&str>) -> Vec<Arc<DecodingKey>> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .filter(|(key_id, _)| key_id.as_deref() == Some(kid))
                .map(|(_, key)| Arc::clone(key))
                .collect(),
            None => self.keys.iter().map(|(_, key)| Arc::clone(key)).collect(),
        }
    }
}

pub struct JwksClient {
    url: String,
    http_client: reqwest::Client,
    refresh_ttl: Duration,
    min_refresh_interval: Duration,
    cache: RwLock<JwksCacheState>,
    refresh_lock: Mutex<()>,
}

impl JwksClient {
    #[must_use]
    pub fn new(url: impl Into<String>, refresh_ttl: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            url: url.into(),
            http_client,
            refresh_ttl,
            min_refresh_interval: MIN_REFRESH_INTERVAL,
            cache: RwLock::new(JwksCacheState::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    pub fn set_http_client(&mut self, http_client: reqwest::Client) {
        self.http_client = http_client;
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Candidate keys for a token: the key named by `kid`, or every key in
    /// the set when the token does not name one. An unknown `kid` triggers a
    /// refetch at most once per minimum refresh interval.
    pub async fn get_keys(&self, kid: Option<&str>) -> Result<Vec<Arc<DecodingKey>>, JwksError> {
        if let Some(keys) = self.cached_keys(kid).await {
            return keys;
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(keys) = self.cached_keys(kid).await {
            return keys;
        }

        if let Err(error) = self.refresh().await {
            let fallback = self.cache.read().await.select(kid);
            if !fallback.is_empty() {
                tracing::warn!(url = %self.url, %error, "JWKS refresh failed, using cached keys");
                return Ok(fallback);
            }
            return Err(error);
        }

        found(self.cache.read().await.select(kid), kid)
    }

    /// Answers from the cache unless the set is stale, or the key is missing
    /// and the last fetch is old enough to try again.
    async fn cached_keys(
        &self,
        kid: Option<&str>,
    ) -> Option<Result<Vec<Arc<DecodingKey>>, JwksError>> {
        let cache = self.cache.read().await;
        if is_stale(cache.last_fetch, self.refresh_ttl) {
            return None;
        }
        let keys = cache.select(kid);
        let recently_fetched = cache
            .last_fetch
            .is_some_and(|fetched| fetched.elapsed() < self.min_refresh_interval);
        if keys.is_empty() && !recently_fetched {
            return None;
        }
        Some(found(keys, kid))
    }

    async fn refresh(&self) -> Result<(), JwksError> {
        let response = self.http_client.get(&self.url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(JwksError::Status(response.status()));
        }

        let payload = response.bytes().await?;
        if payload.len() > MAX_JWKS_SIZE {
            return Err(JwksError::PayloadTooLarge(payload.len()));
        }

        let jwks: JWKS = serde_json::from_slice(&payload)?;
        let mut keys = Vec::with_capacity(jwks.keys.len());
        for jwk in jwks.keys {
            if jwk.use_.as_deref().is_some_and(|use_| use_ != "sig") {
                continue;
            }
            match parse_jwk(&jwk) {
                Ok(key) => keys.push((jwk.kid, Arc::new(key))),
                Err(error) => {
                    tracing::debug!(
                        url = %self.url,
                        kid = ?jwk.kid,
                        %error,
                        "skipping unusable JWK"
                    );
                }
            }
        }

        let mut cache = self.cache.write().await;
        cache.keys = keys;
        cache.last_fetch = Some(Instant::now());
        Ok(())
    }
}

fn found(
    keys: Vec<Arc<DecodingKey>>,
    kid: Option<&str>,
) -> Result<Vec<Arc<DecodingKey>>, JwksError> {
    if keys.is_empty() {
        return Err(match kid {
            Some(kid) => JwksError::KeyNotFound(kid.to_owned()),
            None => JwksError::NoKeys,
        });
    }
    Ok(keys)
}

pub fn parse_jwk(jwk: &JWK) -> Result<DecodingKey, JwksError> {
    match jwk.kty.as_str() {
        "EC" => parse_ec_jwk(jwk),
        "RSA" => DecodingKey::from_rsa_components(required(&jwk.n, "n")?, required(&jwk.e, "e")?)
            .map_err(JwksError::InvalidDecodingKey),
        "OKP" => {
            let crv = required(&jwk.crv, "crv")?;
            if crv != "Ed25519" {
                return Err(JwksError::UnsupportedCurve(crv.to_owned()));
            }
            DecodingKey::from_ed_components(required(&jwk.x, "x")?)
                .map_err(JwksError::InvalidDecodingKey)
        }
        other => Err(JwksError::UnsupportedKeyType(other.to_owned())),
    }
}

fn parse_ec_jwk(jwk: &JWK) -> Result<DecodingKey, JwksError> {
    let crv = required(&jwk.crv, "crv")?;
    let x = required(&jwk.x, "x")?;
    let y = required(&jwk.y, "y")?;
    match crv {
        "P-256" => {
            let x_bytes = URL_SAFE_NO_PAD
                .decode(x.as_bytes())
                .map_err(JwksError::InvalidXCoordinate)?;
            let y_bytes = URL_SAFE_NO_PAD
                .decode(y.as_bytes())
                .map_err(JwksError::InvalidYCoordinate)?;
            let x_bytes = pad_coordinate(&x_bytes)?;
            let y_bytes = pad_coordinate(&y_bytes)?;

            let mut sec1 = [0_u8; 65];
            sec1[0] = 0x04;
            sec1[1..33].copy_from_slice(&x_bytes);
            sec1[33..65].copy_from_slice(&y_bytes);
            PublicKey::from_sec1_bytes(&sec1).map_err(|_| JwksError::PointNotOnCurve)?;
        }
        "P-384" => {}
        other => return Err(JwksError::UnsupportedCurve(other.to_owned())),
    }

    DecodingKey::from_ec_components(x, y).map_err(JwksError::InvalidDecodingKey)
}

fn required<'a>(member: &'a Option<String>, name: &'static str) -> Result<&'a str, JwksError> {
    member.as_deref().ok_or(JwksError::MissingMember(name))
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_owned()).to_string()
}

fn is_stale(last_fetch: Option<Instant>, refresh_ttl: Duration) -> bool {
    if let Some(last_fetch) = last_fetch {
        last_fetch.elapsed() > refresh_ttl
    } else {
        true
    }
}

fn pad_coordinate(coord: &[u8]) -> Result<[u8; 32], JwksError> {
    if coord.len() > 32 {
        return Err(JwksError::CoordinateTooLarge);
    }
    let mut out = [0_u8; 32];
    let offset = 32 - coord.len();
    out[offset..].copy_from_slice(coord);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::{routing::get, Json, Router};
    use tokio::net::TcpListener;

    use super::*;
    use crate::dpop::ProofSigner;

    fn ec_jwk(kid: &str) -> JWK {
        JWK {
            kid: Some(kid.to_owned()),
            alg: Some("ES256".to_owned()),
            use_: Some("sig".to_owned()),
            ..ProofSigner::generate()
                .expect("signer")
                .public_jwk()
                .clone()
        }
    }

    async fn spawn_server(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    async fn mock_jwks_server(keys: Vec<JWK>) -> String {
        let app = Router::new().route(
            "/",
            get(move || {
                let keys = keys.clone();
                async move { Json(JWKS { keys }) }
            }),
        );
        spawn_server(app).await
    }

    #[test]
    fn thumbprint_matches_rfc7638_example() {
        // RFC 7638 section 3.1.
        let jwk = JWK {
            kty: "RSA".to_owned(),
            n: Some("0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_owned()),
            e: Some("AQAB".to_owned()),
            alg: Some("RS256".to_owned()),
            kid: Some("2011-04-29".to_owned()),
            ..JWK::default()
        };

        assert_eq!(
            jwk.thumbprint().expect("thumbprint"),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn thumbprint_ignores_optional_members() {
        let jwk = ec_jwk("key-1");
        let stripped = JWK {
            kid: None,
            alg: None,
            use_: None,
            ..jwk.clone()
        };
        assert_eq!(
            jwk.thumbprint().expect("thumbprint"),
            stripped.thumbprint().expect("thumbprint")
        );
    }

    #[test]
    fn thumbprint_changes_with_key_material() {
        let jwk = ec_jwk("key-1");
        let mut x = jwk.x.clone().expect("x");
        let flipped = if x.starts_with('A') { "B" } else { "A" };
        x.replace_range(0..1, flipped);
        let tampered = JWK {
            x: Some(x),
            ..jwk.clone()
        };
        assert_ne!(
            jwk.thumbprint().expect("thumbprint"),
            tampered.thumbprint().expect("thumbprint")
        );
    }

    #[test]
    fn thumbprint_requires_members() {
        let jwk = JWK {
            kty: "EC".to_owned(),
            crv: Some("P-256".to_owned()),
            ..JWK::default()
        };
        assert!(matches!(
            jwk.thumbprint(),
            Err(JwksError::MissingMember("x"))
        ));
    }

    #[test]
    fn parse_jwk_invalid_key_type() {
        let jwk = JWK {
            kty: "oct".to_owned(),
            ..JWK::default()
        };
        assert!(matches!(
            parse_jwk(&jwk),
            Err(JwksError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn parse_jwk_invalid_curve() {
        let jwk = JWK {
            crv: Some("secp256k1".to_owned()),
            ..ec_jwk("key-1")
        };
        assert!(matches!(parse_jwk(&jwk), Err(JwksError::UnsupportedCurve(_))));
    }

    #[test]
    fn parse_jwk_invalid_base64() {
        let jwk = JWK {
            x: Some("!!!invalid-base64!!!".to_owned()),
            ..ec_jwk("key-1")
        };
        assert!(parse_jwk(&jwk).is_err());
    }

    #[test]
    fn parse_jwk_point_not_on_curve() {
        let jwk = JWK {
            x: Some(URL_SAFE_NO_PAD.encode([1_u8; 32])),
            y: Some(URL_SAFE_NO_PAD.encode([1_u8; 32])),
            ..ec_jwk("key-1")
        };
        let error = parse_jwk(&jwk)
            .err()
            .expect("expected point-not-on-curve error");
        assert!(error.to_string().contains("not on curve"), "{error}");
    }

    #[tokio::test]
    async fn get_keys_selects_by_kid() {
        let url = mock_jwks_server(vec![ec_jwk("key-1"), ec_jwk("key-2")]).await;
        let client = JwksClient::new(url, Duration::from_secs(60));

        assert_eq!(client.get_keys(Some("key-2")).await.expect("key-2").len(), 1);
        assert_eq!(client.get_keys(None).await.expect("all keys").len(), 2);
        assert!(matches!(
            client.get_keys(Some("unknown")).await,
            Err(JwksError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_keys_skips_encryption_keys() {
        let mut enc = ec_jwk("enc-1");
        enc.use_ = Some("enc".to_owned());
        let url = mock_jwks_server(vec![enc]).await;
        let client = JwksClient::new(url, Duration::from_secs(60));

        assert!(matches!(
            client.get_keys(None).await,
            Err(JwksError::NoKeys)
        ));
    }

    #[tokio::test]
    async fn get_keys_falls_back_to_cache_on_refresh_error() {
        #[derive(Clone)]
        struct AppState {
            calls: Arc<AtomicUsize>,
            keys: Arc<Vec<JWK>>,
        }

        async fn handler(State(state): State<AppState>) -> impl IntoResponse {
            if state.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Json(JWKS {
                    keys: (*state.keys).clone(),
                })
                .into_response()
            } else {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route("/", get(handler)).with_state(AppState {
            calls: Arc::clone(&calls),
            keys: Arc::new(vec![ec_jwk("key-1")]),
        });
        let url = spawn_server(app).await;
        let client = JwksClient::new(url, Duration::from_millis(10));

        client.get_keys(Some("key-1")).await.expect("first fetch");
        tokio::time::sleep(Duration::from_millis(20)).await;
        client
            .get_keys(Some("key-1"))
            .await
            .expect("cached key should still be served");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn get_keys_reports_server_errors() {
        let app = Router::new().route("/", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let url = spawn_server(app).await;
        let client = JwksClient::new(url, Duration::from_secs(60));

        assert!(matches!(
            client.get_keys(None).await,
            Err(JwksError::Status(status)) if status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
        ));
    }

    async fn counting_jwks_server(keys: Vec<JWK>) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let app = Router::new().route(
            "/",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let keys = keys.clone();
                async move { Json(JWKS { keys }) }
            }),
        );
        (spawn_server(app).await, calls)
    }

    #[tokio::test]
    async fn get_keys_does_not_refetch_for_unknown_kid_right_away() {
        let (url, calls) = counting_jwks_server(vec![ec_jwk("key-1")]).await;
        let client = JwksClient::new(url, Duration::from_secs(60));

        client.get_keys(Some("key-1")).await.expect("known key");
        for _ in 0..5 {
            assert!(matches!(
                client.get_keys(Some("rotated")).await,
                Err(JwksError::KeyNotFound(kid)) if kid == "rotated"
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_keys_refetches_unknown_kid_after_interval() {
        let (url, calls) = counting_jwks_server(vec![ec_jwk("key-1")]).await;
        let client = JwksClient::new(url, Duration::from_secs(60))
            .with_min_refresh_interval(Duration::from_millis(10));

        client.get_keys(Some("key-1")).await.expect("known key");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.get_keys(Some("rotated")).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
