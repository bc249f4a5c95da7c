#![forbid(unsafe_code)]

pub mod credentials;
pub mod dpop;
pub mod jwt;
pub mod replay;
pub mod verifier;

pub use credentials::{
    ClientCredentials, CredentialError, DelegatorCredentialManager, ExchangeError, OutboundToken,
    TokenSource, DEFAULT_SAFETY_MARGIN,
};
pub use dpop::{access_token_hash, ProofClaims, ProofError, ProofSigner, DPOP_JWT_TYPE};
pub use jwt::{IssuerKeyResolver, JwksError, OidcKeyResolver, JWK};
pub use replay::ReplayCache;
pub use verifier::{
    ProofOfPossessionVerifier, VerifiedIdentity, VerifierConfig, VerifyError,
    DEFAULT_PROOF_MAX_AGE,
};
