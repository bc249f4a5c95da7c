//! IRIs used by the proxy when reading profiles and policies and when writing
//! provenance records.

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

pub const XSD_DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";

pub const FOAF_AGENT: &str = "http://xmlns.com/foaf/0.1/Agent";

pub const SOLID_OIDC_ISSUER: &str = "http://www.w3.org/ns/solid/terms#oidcIssuer";
pub const LOGS_LOGGING_CONTAINER: &str = "https://www.example.org/logs#loggingContainer";

pub const PROV_ENTITY: &str = "http://www.w3.org/ns/prov#Entity";
pub const PROV_ACTIVITY: &str = "http://www.w3.org/ns/prov#Activity";
pub const PROV_WAS_GENERATED_BY: &str = "http://www.w3.org/ns/prov#wasGeneratedBy";
pub const PROV_WAS_ATTRIBUTED_TO: &str = "http://www.w3.org/ns/prov#wasAttributedTo";
pub const PROV_GENERATED_AT_TIME: &str = "http://www.w3.org/ns/prov#generatedAtTime";
pub const PROV_STARTED_AT_TIME: &str = "http://www.w3.org/ns/prov#startedAtTime";
pub const PROV_ENDED_AT_TIME: &str = "http://www.w3.org/ns/prov#endedAtTime";
pub const PROV_WAS_ASSOCIATED_WITH: &str = "http://www.w3.org/ns/prov#wasAssociatedWith";
pub const PROV_WAS_STARTED_BY: &str = "http://www.w3.org/ns/prov#wasStartedBy";
pub const PROV_GENERATED: &str = "http://www.w3.org/ns/prov#generated";

pub const HTTP_METHOD: &str = "http://www.w3.org/2011/http#method";
pub const HTTP_REQUEST_URI: &str = "http://www.w3.org/2011/http#requestUri";
pub const HTTP_METHODS_NS: &str = "http://www.w3.org/2011/http-methods#";

pub const RDP_POLICY_EVALUATION: &str = "https://www.example.org/rdpVocab#policyEvaluation";

pub const ORG_HAS_MEMBER: &str = "http://www.w3.org/ns/org#hasMember";
pub const ORG_HELD_BY: &str = "http://www.w3.org/ns/org#heldBy";
pub const ORG_ROLE: &str = "http://www.w3.org/ns/org#role";

pub const FROG_ACCESS: &str = "https://solid.ti.rw.fau.de/public/ns/frog#access";
pub const FROG_HTTP_METHOD: &str = "https://solid.ti.rw.fau.de/public/ns/frog#httpMethod";
pub const FROG_URI: &str = "https://solid.ti.rw.fau.de/public/ns/frog#uri";

/// IRI of an HTTP method in the `http-methods` vocabulary, e.g. `httpm:GET`.
#[must_use]
pub fn http_method_iri(method: &str) -> String {
    format!("{HTTP_METHODS_NS}{method}")
}
