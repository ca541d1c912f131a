use serde::{Deserialize, Serialize};

use super::primitives::{LogIndex, Term};

/// A single entry in the replicated log.
///
/// `command` is `None` only for the sentinel at index 0, which exists so the
/// log is never empty and consistency checks always have a predecessor to
/// compare against. The sentinel is never delivered to the application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<Cmd> {
    pub index: LogIndex,
    pub term: Term,
    pub command: Option<Cmd>,
}

impl<Cmd> Entry<Cmd> {
    /// The entry every log starts with.
    pub fn sentinel() -> Entry<Cmd> {
        Entry {
            index: LogIndex::ZERO,
            term: Term::ZERO,
            command: None,
        }
    }
}
