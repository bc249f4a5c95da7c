#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};

pub mod document;
pub mod graph;
pub mod vocab;

pub use document::{DocumentError, DocumentFetcher, HttpDocumentFetcher, MAX_DOCUMENT_SIZE};

/// Terminal outcome of the proxy pipeline for one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyDecision {
    PassThroughUnauthenticated,
    Denied(DenialReason),
    Forwarded,
    Error(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    Verification,
    Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingHost,
    UnreadableBody,
    CredentialExchangeFailed,
    UpstreamFetchError,
}

impl ProxyDecision {
    /// Whether this outcome carries an authorization decision that must be
    /// bracketed as an activity in the provenance record.
    #[must_use]
    pub fn has_decision(&self) -> bool {
        match self {
            Self::PassThroughUnauthenticated => false,
            Self::Denied(_) | Self::Forwarded => true,
            Self::Error(kind) => {
                !matches!(kind, ErrorKind::MissingHost | ErrorKind::UnreadableBody)
            }
        }
    }
}

impl Display for ProxyDecision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PassThroughUnauthenticated => f.write_str("pass-through"),
            Self::Denied(DenialReason::Verification) => f.write_str("denied (verification)"),
            Self::Denied(DenialReason::Policy) => f.write_str("denied (policy)"),
            Self::Forwarded => f.write_str("forwarded"),
            Self::Error(kind) => write!(f, "error ({kind:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_authorization_outcomes_carry_a_decision() {
        assert!(!ProxyDecision::PassThroughUnauthenticated.has_decision());
        assert!(!ProxyDecision::Error(ErrorKind::MissingHost).has_decision());
        assert!(ProxyDecision::Denied(DenialReason::Policy).has_decision());
        assert!(ProxyDecision::Denied(DenialReason::Verification).has_decision());
        assert!(ProxyDecision::Forwarded.has_decision());
        assert!(ProxyDecision::Error(ErrorKind::CredentialExchangeFailed).has_decision());
    }

    #[test]
    fn display_names_the_outcome() {
        assert_eq!(ProxyDecision::Forwarded.to_string(), "forwarded");
        assert_eq!(
            ProxyDecision::Denied(DenialReason::Policy).to_string(),
            "denied (policy)"
        );
    }
}
