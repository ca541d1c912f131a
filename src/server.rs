//! Wiring for one replicated KV node: durable state on disk, consensus
//! RPCs over TCP, client traffic over HTTP.
//!
//! The engine is shared-state and thread-safe, so client requests are
//! proposed straight into it from whatever thread carries them; there is
//! no event loop to bridge into. [`KvService::propose`] submits a command,
//! parks a waiter under the log index the engine promised, and hands back
//! a receiver. The apply loop feeds committed entries to the state machine
//! and settles the waiter at each index — provided the committed command
//! is the one that was parked there. A different command at that index
//! means leadership moved between acceptance and commit, and the waiter
//! (along with any parked at lower indices) learns it was superseded.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::client_api;
use crate::kv::{KvCommand, KvResult, KvStore};
use crate::persist::FilePersister;
use crate::raft::{ApplyMsg, Raft};
use crate::transport::{TcpTransport, Transport, TransportError};
use crate::types::{LogIndex, Term};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config: {0}")]
    Config(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine: {0}")]
    Engine(#[from] crate::error::Error),
}

pub struct Config {
    /// This node's index into `peers`.
    pub me: usize,
    /// Raft RPC addresses of every node, in cluster order.
    pub peers: Vec<String>,
    /// Address for the HTTP client API.
    pub api_addr: String,
    /// Directory for durable state.
    pub data_dir: PathBuf,
}

/// How a proposal that the engine accepted finally resolved.
#[derive(Debug)]
pub enum Outcome {
    /// The command committed at its promised index and was applied.
    Applied(KvResult),
    /// A different command committed at the promised index: leadership
    /// moved between acceptance and commit, and this command may or may
    /// not ever commit elsewhere.
    Superseded,
}

/// A proposal's fate at submission time.
pub enum Proposal {
    /// The engine appended the command at `index` in `term`; `outcome`
    /// resolves once that index commits.
    Accepted {
        index: LogIndex,
        term: Term,
        outcome: oneshot::Receiver<Outcome>,
    },
    /// This node is not the leader; `term` is its current term, so the
    /// caller can tell a stale refusal from a current one.
    NotLeader { term: Term },
}

struct Waiter {
    command: KvCommand,
    resolve: oneshot::Sender<Outcome>,
}

/// The replicated KV service around one engine instance.
pub struct KvService<T> {
    raft: Raft<KvCommand, T>,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl<T> KvService<T>
where
    T: Transport<KvCommand> + Send + Sync + 'static,
{
    pub fn new(raft: Raft<KvCommand, T>) -> KvService<T> {
        KvService {
            raft,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a command for replication. Reads ride the log like writes,
    /// so a `Get`'s outcome reflects every write committed before it.
    pub fn propose(&self, command: KvCommand) -> Proposal {
        let Some((index, term)) = self.raft.submit(command.clone()) else {
            return Proposal::NotLeader {
                term: self.raft.state().0,
            };
        };

        let (resolve, outcome) = oneshot::channel();
        let stale = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(index.get(), Waiter { command, resolve });
        // A waiter already parked here was promised this index by an older
        // leadership whose entry never committed.
        if let Some(old) = stale {
            let _ = old.resolve.send(Outcome::Superseded);
        }

        debug!(index = index.get(), term = term.get(), "proposal accepted");
        Proposal::Accepted {
            index,
            term,
            outcome,
        }
    }

    /// Current term and whether this node believes it leads.
    pub fn status(&self) -> (Term, bool) {
        self.raft.state()
    }

    /// Feed committed entries into the state machine and settle waiters.
    /// Runs until the engine shuts down and closes the apply channel.
    pub fn apply_loop(&self, committed: Receiver<ApplyMsg<KvCommand>>) {
        let mut store = KvStore::new();
        for msg in committed {
            match msg {
                ApplyMsg::Command { index, command } => {
                    let result = store.apply(&command);
                    self.settle(index, &command, result);
                }
            }
        }
    }

    fn settle(&self, index: LogIndex, committed: &KvCommand, result: KvResult) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(waiter) = waiters.remove(&index.get()) {
            let outcome = if waiter.command == *committed {
                Outcome::Applied(result)
            } else {
                Outcome::Superseded
            };
            let _ = waiter.resolve.send(outcome);
        }
        // Anything still parked at or below this index was promised a slot
        // that a newer leader's entries have overwritten.
        let overwritten: Vec<u64> = waiters
            .keys()
            .copied()
            .filter(|&i| i <= index.get())
            .collect();
        for i in overwritten {
            if let Some(waiter) = waiters.remove(&i) {
                let _ = waiter.resolve.send(Outcome::Superseded);
            }
        }
    }
}

/// The concrete service a node binary runs.
pub type NodeService = KvService<TcpTransport<KvCommand>>;

/// A running node.
pub struct Server {
    service: Arc<NodeService>,
    committed: Receiver<ApplyMsg<KvCommand>>,
}

impl Server {
    /// Restore state, bind the transports, and start the engine.
    pub fn start(config: Config) -> Result<Server, ServerError> {
        let peer_addrs = parse_addrs(&config.peers)?;
        if config.me >= peer_addrs.len() {
            return Err(ServerError::Config(format!(
                "node index {} out of range for {} peers",
                config.me,
                peer_addrs.len()
            )));
        }
        let api_addr: SocketAddr = config
            .api_addr
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid api addr '{}': {e}", config.api_addr)))?;

        let persister = Arc::new(FilePersister::open(&config.data_dir)?);
        let transport = TcpTransport::bind(config.me, peer_addrs)?;

        let (apply_tx, committed) = mpsc::channel();
        let raft = Raft::spawn(
            transport.clone(),
            config.peers.len(),
            config.me,
            persister,
            apply_tx,
        )?;
        transport.register(Arc::new(raft.clone()));

        let service = Arc::new(KvService::new(raft));
        client_api::start(api_addr, Arc::clone(&service));

        info!(me = config.me, "node started");
        Ok(Server { service, committed })
    }

    /// Pump committed entries until the engine goes away.
    pub fn run(self) -> Result<(), ServerError> {
        self.service.apply_loop(self.committed);
        Ok(())
    }
}

fn parse_addrs(raw: &[String]) -> Result<Vec<SocketAddr>, ServerError> {
    raw.iter()
        .map(|addr| {
            addr.parse()
                .map_err(|e| ServerError::Config(format!("invalid peer addr '{addr}': {e}")))
        })
        .collect()
}
