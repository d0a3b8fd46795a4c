//! Core domain types for kernel bisection: identifiers, verdicts, the
//! per-host outcome model, the error taxonomy, and the aggregation policy
//! that reduces host outcomes to a single commit verdict.

pub mod aggregate;
pub mod error;
pub mod identifiers;
pub mod outcome;

pub use aggregate::aggregate_outcomes;
pub use error::ErrorKind;
pub use identifiers::{BlobId, HostId, HostRowId, IterationId, MetadataId, SessionId};
pub use outcome::{
    verdict_for_phase_failure, HostOutcome, HostVerdict, IterationVerdict, MarkState, Phase,
    PhaseFailure, SessionStatus, TestMode,
};
