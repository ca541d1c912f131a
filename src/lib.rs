//! Replicated log engine.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation
//!
//! The engine ([`raft`]) keeps a fixed cluster of peers agreed on an
//! ordered log of opaque commands and publishes committed entries to the
//! collocated application in index order. Transport and stable storage are
//! pluggable seams ([`transport`], [`persist`]); a simulated cluster for
//! tests lives in [`cluster`], and a small replicated key-value service
//! ([`kv`], [`server`], [`client_api`]) shows the whole stack end to end.

pub mod client_api;
pub mod cluster;
pub mod error;
pub mod kv;
pub mod persist;
pub mod raft;
pub mod server;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use persist::{FilePersister, MemoryPersister, Persister};
pub use raft::{ApplyMsg, Raft};
pub use transport::{RpcHandler, TcpTransport, Transport};
pub use types::{
    AppendEntriesArgs, AppendEntriesReply, Conflict, Entry, LogIndex, PeerId, RequestVoteArgs,
    RequestVoteReply, Term,
};
