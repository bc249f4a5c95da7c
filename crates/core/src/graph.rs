//! Turtle documents as queryable triple sets.

use oxrdf::{Graph, NamedNode, NamedNodeRef, SubjectRef, TermRef, Triple, TripleRef};
use oxttl::TurtleParser;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("invalid base IRI {0:?}")]
    InvalidBase(String),
    #[error("failed to parse document: {0}")]
    Syntax(String),
    #[error("invalid IRI {0:?}")]
    InvalidIri(String),
}

/// Parses a Turtle document, resolving relative IRIs against `base_iri`.
pub fn parse_turtle(document: &str, base_iri: &str) -> Result<Graph, GraphError> {
    let base = document_iri(base_iri);
    let parser = TurtleParser::new()
        .with_base_iri(base)
        .map_err(|_| GraphError::InvalidBase(base.to_owned()))?;

    let mut graph = Graph::new();
    for triple in parser.for_slice(document.as_bytes()) {
        let triple = triple.map_err(|error| GraphError::Syntax(error.to_string()))?;
        graph.insert(&triple);
    }
    Ok(graph)
}

/// Writes triples as Turtle statements, one per line.
#[must_use]
pub fn write_turtle<'a>(triples: impl IntoIterator<Item = &'a Triple>) -> String {
    let mut document = String::new();
    for triple in triples {
        document.push_str(&format!("{triple} .\n"));
    }
    document
}

/// The document part of an IRI (everything before the fragment).
#[must_use]
pub fn document_iri(iri: &str) -> &str {
    iri.split_once('#').map_or(iri, |(document, _)| document)
}

/// Parses an absolute IRI taken from outside input. Anything that could
/// break out of an IRI term in a written document is rejected.
pub fn parse_iri(iri: &str) -> Result<NamedNode, GraphError> {
    NamedNode::new(iri).map_err(|_| GraphError::InvalidIri(iri.to_owned()))
}

/// Borrows `iri` as a named node for lookups. Lookups only compare, so an
/// invalid IRI simply never matches.
#[must_use]
pub fn named(iri: &str) -> NamedNodeRef<'_> {
    NamedNodeRef::new_unchecked(iri)
}

pub fn contains(graph: &Graph, subject: &str, predicate: &str, object: &str) -> bool {
    graph.contains(TripleRef::new(named(subject), named(predicate), named(object)))
}

/// Objects of `(subject, predicate, ?)`.
pub fn objects<'g>(graph: &'g Graph, subject: SubjectRef<'_>, predicate: &str) -> Vec<TermRef<'g>> {
    graph
        .objects_for_subject_predicate(subject, named(predicate))
        .collect()
}

/// Subjects of `(?, predicate, object)` where `object` is an IRI.
pub fn subjects<'g>(graph: &'g Graph, predicate: &str, object: &str) -> Vec<SubjectRef<'g>> {
    graph
        .subjects_for_predicate_object(named(predicate), named(object))
        .collect()
}

/// IRIs that `subject` points to through `predicate`; literals and blank
/// nodes are skipped.
pub fn object_iris(graph: &Graph, subject: &str, predicate: &str) -> Vec<String> {
    objects(graph, named(subject).into(), predicate)
        .into_iter()
        .filter_map(|term| match term {
            TermRef::NamedNode(node) => Some(node.as_str().to_owned()),
            _ => None,
        })
        .collect()
}

/// Reinterprets an object term as a subject so that paths can be followed.
#[must_use]
pub fn as_subject(term: TermRef<'_>) -> Option<SubjectRef<'_>> {
    match term {
        TermRef::NamedNode(node) => Some(node.into()),
        TermRef::BlankNode(node) => Some(node.into()),
        _ => None,
    }
}
