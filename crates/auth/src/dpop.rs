#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::jwt::{JwksError, JWK};

pub const DPOP_JWT_TYPE: &str = "dpop+jwt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofClaims {
    pub jti: String,
    pub htm: String,
    pub htu: String,
    pub iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ath: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProofError {
    #[error("failed to encode proof: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("system clock is before the unix epoch")]
    Clock,
    #[error("invalid signing key: {0}")]
    Key(#[from] JwksError),
}

/// The proxy's own proof-of-possession key. Generated once per process and
/// used for every outbound proof.
pub struct ProofSigner {
    key: SigningKey,
    jwk: JWK,
    thumbprint: String,
}

impl std::fmt::Debug for ProofSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProofSigner")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

impl ProofSigner {
    pub fn generate() -> Result<Self, ProofError> {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_signing_key(key: SigningKey) -> Result<Self, ProofError> {
        let public = key.verifying_key().to_encoded_point(false);
        let public_bytes = public.as_bytes();
        let jwk = JWK {
            kty: "EC".to_owned(),
            crv: Some("P-256".to_owned()),
            x: Some(URL_SAFE_NO_PAD.encode(&public_bytes[1..33])),
            y: Some(URL_SAFE_NO_PAD.encode(&public_bytes[33..65])),
            ..JWK::default()
        };
        let thumbprint = jwk.thumbprint()?;
        Ok(Self {
            key,
            jwk,
            thumbprint,
        })
    }

    #[must_use]
    pub fn public_jwk(&self) -> &JWK {
        &self.jwk
    }

    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Signs a proof for one request. `access_token` binds the proof to the
    /// token it accompanies through the `ath` claim.
    pub fn sign_proof(
        &self,
        method: &str,
        uri: &str,
        access_token: Option<&str>,
    ) -> Result<String, ProofError> {
        let claims = ProofClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            htm: method.to_owned(),
            htu: uri.to_owned(),
            iat: unix_now()?,
            ath: access_token.map(access_token_hash),
        };
        let header = json!({
            "alg": "ES256",
            "typ": DPOP_JWT_TYPE,
            "jwk": self.jwk,
        });
        self.sign_compact(&header, &claims)
    }

    /// Compact-serialized ES256 JWS over arbitrary header and claims.
    pub fn sign_compact<C: Serialize>(
        &self,
        header: &serde_json::Value,
        claims: &C,
    ) -> Result<String, ProofError> {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
        let claims = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{header}.{claims}");
        let signature: Signature = self.key.sign(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(signature.to_bytes());
        Ok(format!("{signing_input}.{signature}"))
    }
}

pub fn access_token_hash(access_token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()))
}

pub(crate) fn unix_now() -> Result<u64, ProofError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .map_err(|_| ProofError::Clock)
}
