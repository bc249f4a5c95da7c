#![forbid(unsafe_code)]

//! Decides whether a delegate may act for a delegator on one request.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use delegation_proxy_core::graph::{as_subject, contains, named, objects, subjects};
use delegation_proxy_core::vocab::{
    http_method_iri, FROG_ACCESS, FROG_HTTP_METHOD, FROG_URI, ORG_HAS_MEMBER, ORG_HELD_BY,
    ORG_ROLE,
};
use delegation_proxy_core::DocumentFetcher;
use oxrdf::{Graph, SubjectRef, TermRef};

/// Which relation grants access.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    /// `<delegator> org:hasMember <delegate>` in the delegator's profile.
    #[default]
    Membership,
    /// A role held by the delegate grants the request's method on the exact
    /// request URI. Grants are read from `document`, or from the delegator's
    /// profile when unset.
    RoleGrant { document: Option<String> },
}

impl AccessPolicy {
    #[must_use]
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Membership => "membership",
            Self::RoleGrant { .. } => "role-grant",
        }
    }
}

impl Display for AccessPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mode())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("unknown policy mode {0:?}; expected \"membership\" or \"role-grant\"")]
pub struct UnknownPolicyMode(pub String);

impl FromStr for AccessPolicy {
    type Err = UnknownPolicyMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "membership" => Ok(Self::Membership),
            "role-grant" => Ok(Self::RoleGrant { document: None }),
            other => Err(UnknownPolicyMode(other.to_owned())),
        }
    }
}

pub struct PolicyEvaluator {
    documents: Arc<dyn DocumentFetcher>,
    policy: AccessPolicy,
}

impl PolicyEvaluator {
    #[must_use]
    pub fn new(documents: Arc<dyn DocumentFetcher>, policy: AccessPolicy) -> Self {
        Self { documents, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    /// Fails closed: a document that cannot be fetched or parsed denies.
    pub async fn is_authorized(
        &self,
        delegator: &str,
        delegate: &str,
        uri: &str,
        method: &str,
    ) -> bool {
        let source = match &self.policy {
            AccessPolicy::Membership => delegator,
            AccessPolicy::RoleGrant { document } => document.as_deref().unwrap_or(delegator),
        };
        let graph = match self.documents.fetch_graph(source).await {
            Ok(graph) => graph,
            Err(error) => {
                tracing::warn!(document = source, %error, "policy document unavailable, denying");
                return false;
            }
        };

        let allowed = match &self.policy {
            AccessPolicy::Membership => contains(&graph, delegator, ORG_HAS_MEMBER, delegate),
            AccessPolicy::RoleGrant { .. } => role_grants(&graph, delegate, uri, method),
        };
        tracing::debug!(
            policy = %self.policy,
            delegator,
            delegate,
            uri,
            method,
            allowed,
            "evaluated policy"
        );
        allowed
    }
}

/// `?post org:heldBy <delegate>; org:role ?role. ?role frog:access ?grant.
/// ?grant frog:httpMethod <method>; frog:uri <uri>.`
fn role_grants(graph: &Graph, delegate: &str, uri: &str, method: &str) -> bool {
    subjects(graph, ORG_HELD_BY, delegate)
        .into_iter()
        .flat_map(|post| follow(graph, post, ORG_ROLE))
        .flat_map(|role| follow(graph, role, FROG_ACCESS))
        .any(|grant| {
            objects(graph, grant, FROG_HTTP_METHOD)
                .into_iter()
                .any(|term| method_matches(term, method))
                && objects(graph, grant, FROG_URI)
                    .into_iter()
                    .any(|term| term_value(term) == Some(uri))
        })
}

fn follow<'g>(graph: &'g Graph, subject: SubjectRef<'g>, predicate: &str) -> Vec<SubjectRef<'g>> {
    objects(graph, subject, predicate)
        .into_iter()
        .filter_map(as_subject)
        .collect()
}

fn method_matches(term: TermRef<'_>, method: &str) -> bool {
    match term {
        TermRef::Literal(literal) => literal.value() == method,
        TermRef::NamedNode(node) => node == named(&http_method_iri(method)),
        _ => false,
    }
}

fn term_value(term: TermRef<'_>) -> Option<&str> {
    match term {
        TermRef::NamedNode(node) => Some(node.as_str()),
        TermRef::Literal(literal) => Some(literal.value()),
        _ => None,
    }
}
