//! Durable persistence for bisection sessions: sessions, iterations,
//! per-host outcomes, compressed log blobs, and content-addressed metadata,
//! all in one SQLite database. Every public call is a single transaction;
//! the database is the only authority on session state.

mod blob;
mod records;
mod sqlite;

pub use blob::LogBlobWriter;
pub use records::{
    HostRecord, IterationRecord, LogBlobRecord, LogKind, MetadataRecord, SessionRecord,
    SessionSummary, StoredHostOutcome,
};
pub use sqlite::{NewHost, Store};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(String),
    #[error("store row not found: {0}")]
    NotFound(String),
    #[error("store data corrupt: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
