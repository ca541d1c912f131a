use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a peer in the fixed cluster membership.
///
/// The composition of the cluster never changes during the life of a node,
/// so a plain index into the peer list is identity enough.
pub type PeerId = usize;

/// Monotonically increasing term number.
///
/// Terms act as logical clocks and are used to detect stale leaders,
/// candidates, and replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub const fn new(value: u64) -> Term {
        Term(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Term {
        Term(self.0.saturating_add(1))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for Term {
    fn from(value: u64) -> Self {
        Term(value)
    }
}

/// Position of an entry in the replicated log.
///
/// Indices are dense from 0; index 0 is a sentinel entry that carries no
/// command, so the first real entry lives at index 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);
    pub const FIRST: LogIndex = LogIndex(1);

    pub const fn new(value: u64) -> LogIndex {
        LogIndex(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn next(self) -> LogIndex {
        LogIndex(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_next_is_monotonic() {
        let term = Term::ZERO;
        assert_eq!(term.next().get(), 1);
        assert!(term.next() > term);
    }

    #[test]
    fn log_index_orders_numerically() {
        assert!(LogIndex::FIRST > LogIndex::ZERO);
        assert_eq!(LogIndex::new(4).next(), LogIndex::new(5));
        assert_eq!(LogIndex::new(4).as_usize(), 4);
    }
}
