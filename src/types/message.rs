use serde::{Deserialize, Serialize};

use super::log::Entry;
use super::primitives::{LogIndex, PeerId, Term};

/// RequestVote RPC arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: PeerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments. An empty `entries` vector is a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesArgs<Cmd> {
    pub term: Term,
    pub leader_id: PeerId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry<Cmd>>,
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC reply. `conflict` is set only when `success` is false
/// because of a log inconsistency, and lets the leader collapse a whole
/// conflicting term in one round trip instead of walking back entry by entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    pub conflict: Option<Conflict>,
}

/// Hint attached to a rejected AppendEntries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conflict {
    /// The follower's log ends before `prev_log_index`; `len` is the index
    /// just past its last entry.
    TooShort { len: LogIndex },
    /// The follower holds a different term at `prev_log_index`;
    /// `first_index` is the first index of that term in the follower's log.
    Mismatch { term: Term, first_index: LogIndex },
}
