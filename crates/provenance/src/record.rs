use delegation_proxy_core::graph::{parse_iri, write_turtle};
use delegation_proxy_core::vocab::{
    http_method_iri, HTTP_METHOD, HTTP_REQUEST_URI, PROV_ACTIVITY, PROV_ENDED_AT_TIME,
    PROV_ENTITY, PROV_GENERATED, PROV_GENERATED_AT_TIME, PROV_STARTED_AT_TIME,
    PROV_WAS_ASSOCIATED_WITH, PROV_WAS_ATTRIBUTED_TO, PROV_WAS_GENERATED_BY, PROV_WAS_STARTED_BY,
    RDF_TYPE, RDP_POLICY_EVALUATION, XSD_BOOLEAN, XSD_DATE_TIME,
};
use oxrdf::{Literal, NamedNode, Term, Triple};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

// Relative to the log resource the container creates.
pub const PRIMARY_REQUEST: &str = "#primaryRequest";
pub const DECISION_ACTIVITY: &str = "#RDPActivity";
pub const SECONDARY_REQUEST: &str = "#secondaryRequest";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record contains an invalid IRI {0:?}")]
    InvalidIri(String),
}

/// Statements about one inbound request. Append-only; flushed once.
///
/// Methods, URIs and actors are checked before they become terms. A record
/// that was handed an invalid one refuses to serialize.
#[derive(Debug, Clone)]
pub struct ProvenanceRecord {
    rid: String,
    triples: Vec<Triple>,
    decision_started: bool,
    decision_ended: bool,
    rejected: Option<String>,
}

impl ProvenanceRecord {
    #[must_use]
    pub fn new(rid: impl Into<String>) -> Self {
        Self {
            rid: rid.into(),
            triples: Vec::new(),
            decision_started: false,
            decision_ended: false,
            rejected: None,
        }
    }

    #[must_use]
    pub fn rid(&self) -> &str {
        &self.rid
    }

    /// Records the inbound request and returns the node standing for it.
    pub fn record_incoming(
        &mut self,
        method: &str,
        uri: &str,
        actor: &str,
        time: OffsetDateTime,
    ) -> NamedNode {
        let request = constant(PRIMARY_REQUEST);
        let actor = self.checked(actor);
        self.describe_request(&request, method, uri, actor.clone(), actor, time);
        request
    }

    pub fn record_decision_activity(
        &mut self,
        actor: &str,
        time: OffsetDateTime,
        subject: &NamedNode,
        allowed: bool,
    ) {
        let activity = constant(DECISION_ACTIVITY);
        let actor = self.checked(actor);
        self.push(&activity, RDF_TYPE, Some(constant(PROV_ACTIVITY)));
        self.push(&activity, PROV_STARTED_AT_TIME, Some(date_time(time)));
        self.push(&activity, PROV_WAS_ASSOCIATED_WITH, actor);
        self.push(&activity, PROV_WAS_STARTED_BY, Some(subject.clone()));
        self.push(
            &activity,
            RDP_POLICY_EVALUATION,
            Some(Literal::new_typed_literal(
                allowed.to_string(),
                constant(XSD_BOOLEAN),
            )),
        );
        self.decision_started = true;
    }

    pub fn record_decision_end(&mut self, time: OffsetDateTime) {
        self.push(
            &constant(DECISION_ACTIVITY),
            PROV_ENDED_AT_TIME,
            Some(date_time(time)),
        );
        self.decision_ended = true;
    }

    pub fn record_outbound_request(
        &mut self,
        method: &str,
        uri: &str,
        delegator: &str,
        time: OffsetDateTime,
    ) {
        let activity = constant(DECISION_ACTIVITY);
        let request = constant(SECONDARY_REQUEST);
        let delegator = self.checked(delegator);
        self.push(&activity, PROV_GENERATED, Some(request.clone()));
        self.describe_request(&request, method, uri, Some(activity), delegator, time);
    }

    fn describe_request(
        &mut self,
        request: &NamedNode,
        method: &str,
        uri: &str,
        generated_by: Option<NamedNode>,
        attributed_to: Option<NamedNode>,
        time: OffsetDateTime,
    ) {
        let method = self.checked(&http_method_iri(method));
        let uri = self.checked(uri);
        self.push(request, RDF_TYPE, Some(constant(PROV_ENTITY)));
        self.push(request, HTTP_METHOD, method);
        self.push(request, HTTP_REQUEST_URI, uri);
        self.push(request, PROV_WAS_GENERATED_BY, generated_by);
        self.push(request, PROV_WAS_ATTRIBUTED_TO, attributed_to);
        self.push(request, PROV_GENERATED_AT_TIME, Some(date_time(time)));
    }

    fn checked(&mut self, value: &str) -> Option<NamedNode> {
        match parse_iri(value) {
            Ok(node) => Some(node),
            Err(_) => {
                self.rejected.get_or_insert_with(|| value.to_owned());
                None
            }
        }
    }

    fn push(&mut self, subject: &NamedNode, predicate: &str, object: Option<impl Into<Term>>) {
        if let Some(object) = object {
            self.triples
                .push(Triple::new(subject.clone(), constant(predicate), object));
        }
    }

    #[must_use]
    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    /// True when the decision bracket has both its start and its end.
    #[must_use]
    pub fn has_complete_decision(&self) -> bool {
        self.decision_started && self.decision_ended
    }

    pub fn to_turtle(&self) -> Result<String, RecordError> {
        match &self.rejected {
            Some(value) => Err(RecordError::InvalidIri(value.clone())),
            None => Ok(write_turtle(&self.triples)),
        }
    }
}

// Vocabulary terms and the record's own relative nodes.
fn constant(value: &str) -> NamedNode {
    NamedNode::new_unchecked(value)
}

fn date_time(time: OffsetDateTime) -> Literal {
    let lexical = time
        .format(&Rfc3339)
        .unwrap_or_else(|_| time.unix_timestamp().to_string());
    Literal::new_typed_literal(lexical, constant(XSD_DATE_TIME))
}

#[cfg(test)]
mod tests {
    use delegation_proxy_core::graph::{contains, object_iris, parse_turtle};
    use delegation_proxy_core::vocab::FOAF_AGENT;
    use time::macros::datetime;

    use super::*;

    const LOG: &str = "https://sme.example/logs/entry-1";
    const DELEGATE: &str = "https://tom.example/profile/card#me";
    const DELEGATOR: &str = "https://sme.example/profile/card#me";
    const URI: &str = "https://bank.example/offer/1";

    fn at(id: &str) -> String {
        format!("{LOG}{id}")
    }

    #[test]
    fn incoming_only_record() {
        let mut record = ProvenanceRecord::new("rid-1");
        record.record_incoming("GET", URI, FOAF_AGENT, datetime!(2024-05-01 10:00:00 UTC));

        assert!(!record.has_complete_decision());
        assert_eq!(record.triples().len(), 6);

        let graph = parse_turtle(&record.to_turtle().expect("document"), LOG).expect("turtle");
        assert!(contains(&graph, &at(PRIMARY_REQUEST), RDF_TYPE, PROV_ENTITY));
        assert!(contains(
            &graph,
            &at(PRIMARY_REQUEST),
            HTTP_METHOD,
            "http://www.w3.org/2011/http-methods#GET"
        ));
        assert!(contains(&graph, &at(PRIMARY_REQUEST), PROV_WAS_ATTRIBUTED_TO, FOAF_AGENT));
        assert!(contains(&graph, &at(PRIMARY_REQUEST), HTTP_REQUEST_URI, URI));
    }

    #[test]
    fn forwarded_record_links_both_requests() {
        let mut record = ProvenanceRecord::new("rid-2");
        let incoming =
            record.record_incoming("PUT", URI, DELEGATE, datetime!(2024-05-01 10:00:00 UTC));
        record.record_decision_activity(
            DELEGATE,
            datetime!(2024-05-01 10:00:01 UTC),
            &incoming,
            true,
        );
        record.record_outbound_request("PUT", URI, DELEGATOR, datetime!(2024-05-01 10:00:02 UTC));
        record.record_decision_end(datetime!(2024-05-01 10:00:03 UTC));

        assert!(record.has_complete_decision());
        let graph = parse_turtle(&record.to_turtle().expect("document"), LOG).expect("turtle");
        assert!(contains(&graph, &at(DECISION_ACTIVITY), RDF_TYPE, PROV_ACTIVITY));
        assert!(contains(
            &graph,
            &at(DECISION_ACTIVITY),
            PROV_WAS_STARTED_BY,
            &at(PRIMARY_REQUEST)
        ));
        assert!(contains(
            &graph,
            &at(DECISION_ACTIVITY),
            PROV_GENERATED,
            &at(SECONDARY_REQUEST)
        ));
        assert_eq!(
            object_iris(&graph, &at(SECONDARY_REQUEST), PROV_WAS_ATTRIBUTED_TO),
            vec![DELEGATOR.to_owned()]
        );
        assert_eq!(
            object_iris(&graph, &at(SECONDARY_REQUEST), PROV_WAS_GENERATED_BY),
            vec![at(DECISION_ACTIVITY)]
        );
    }

    #[test]
    fn denied_record_has_false_evaluation() {
        let mut record = ProvenanceRecord::new("rid-3");
        let incoming =
            record.record_incoming("GET", URI, DELEGATE, datetime!(2024-05-01 10:00:00 UTC));
        record.record_decision_activity(
            DELEGATE,
            datetime!(2024-05-01 10:00:00 UTC),
            &incoming,
            false,
        );
        assert!(!record.has_complete_decision());
        record.record_decision_end(datetime!(2024-05-01 10:00:00 UTC));

        let turtle = record.to_turtle().expect("document");
        assert!(turtle.contains(
            r#"<#RDPActivity> <https://www.example.org/rdpVocab#policyEvaluation> "false"^^<http://www.w3.org/2001/XMLSchema#boolean> ."#
        ));
        assert!(turtle.contains(
            r#"<#RDPActivity> <http://www.w3.org/ns/prov#endedAtTime> "2024-05-01T10:00:00Z"^^<http://www.w3.org/2001/XMLSchema#dateTime> ."#
        ));
        assert!(!turtle.contains(SECONDARY_REQUEST));
    }

    #[test]
    fn actor_cannot_inject_statements() {
        let forged_actor = "https://evil.example/#me> . <#secondaryRequest> \
            <http://www.w3.org/ns/prov#wasAttributedTo> <https://forged.example/#me";
        let mut record = ProvenanceRecord::new("rid-4");
        let incoming =
            record.record_incoming("GET", URI, forged_actor, datetime!(2024-05-01 10:00:00 UTC));
        record.record_decision_activity(
            forged_actor,
            datetime!(2024-05-01 10:00:00 UTC),
            &incoming,
            true,
        );
        record.record_decision_end(datetime!(2024-05-01 10:00:01 UTC));

        assert_eq!(
            record.to_turtle(),
            Err(RecordError::InvalidIri(forged_actor.to_owned()))
        );
        assert!(record
            .triples()
            .iter()
            .all(|triple| !triple.to_string().contains("forged.example")));
    }

    #[test]
    fn invalid_method_or_uri_is_rejected() {
        let mut record = ProvenanceRecord::new("rid-5");
        record.record_incoming(
            "GET",
            "https://bank.example/a b",
            DELEGATE,
            datetime!(2024-05-01 10:00:00 UTC),
        );
        assert!(matches!(record.to_turtle(), Err(RecordError::InvalidIri(_))));

        let mut record = ProvenanceRecord::new("rid-6");
        record.record_incoming("GE>T", URI, DELEGATE, datetime!(2024-05-01 10:00:00 UTC));
        assert!(matches!(record.to_turtle(), Err(RecordError::InvalidIri(_))));
    }
}
