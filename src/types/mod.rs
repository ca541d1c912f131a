mod log;
mod message;
mod primitives;

pub use log::Entry;
pub use message::{
    AppendEntriesArgs, AppendEntriesReply, Conflict, RequestVoteArgs, RequestVoteReply,
};
pub use primitives::{LogIndex, PeerId, Term};
