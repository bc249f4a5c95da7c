#![forbid(unsafe_code)]

//! Per-request provenance: which request came in, what was decided about it
//! and which request went out on the delegator's behalf.

mod logger;
mod record;
mod sink;

pub use logger::{ProvenanceLogger, QUEUE_CAPACITY};
pub use record::{
    ProvenanceRecord, RecordError, DECISION_ACTIVITY, PRIMARY_REQUEST, SECONDARY_REQUEST,
};
pub use sink::{ContainerSink, DiscardSink, ProvenanceSink, SinkError};
