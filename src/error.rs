use std::io;

/// Errors surfaced by the consensus engine.
///
/// Only state restoration can fail: a node that cannot decode what it
/// previously persisted must not rejoin the cluster. Everything else the
/// protocol encounters (lost messages, stale replies, log inconsistency)
/// is a normal protocol state, not an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt persisted state: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("invalid persisted state: {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
