#![forbid(unsafe_code)]

mod discovery;
mod jwks;

pub use discovery::{
    discover, discovery_url, normalize_issuer, IssuerKeyResolver, OidcConfiguration,
    OidcKeyResolver,
};
pub use jwks::{
    parse_jwk, JwksClient, JwksError, JWK, JWKS, MAX_JWKS_SIZE, MIN_REFRESH_INTERVAL,
};
