//! Simulated cluster for testing.
//!
//! Wires several engine instances together over an in-memory network that
//! can drop messages, partition nodes, and survive crash/restart cycles.
//! RPCs execute synchronously on the caller's thread; loss is rolled
//! independently for the request and the reply, so a handler may well run
//! and its answer still vanish, exactly like a real lossy network.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::persist::MemoryPersister;
use crate::raft::{ApplyMsg, Raft};
use crate::transport::{RpcHandler, Transport};
use crate::types::{
    AppendEntriesArgs, AppendEntriesReply, LogIndex, PeerId, RequestVoteArgs, RequestVoteReply,
    Term,
};

/// Shared in-memory message fabric.
pub struct Network<Cmd> {
    handlers: Mutex<Vec<Option<Arc<dyn RpcHandler<Cmd>>>>>,
    connected: Mutex<Vec<bool>>,
    loss: Mutex<f64>,
}

impl<Cmd> Network<Cmd> {
    pub fn new(n: usize) -> Arc<Network<Cmd>> {
        Arc::new(Network {
            handlers: Mutex::new((0..n).map(|_| None).collect()),
            connected: Mutex::new(vec![true; n]),
            loss: Mutex::new(0.0),
        })
    }

    pub fn register(&self, node: PeerId, handler: Arc<dyn RpcHandler<Cmd>>) {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())[node] = Some(handler);
    }

    pub fn unregister(&self, node: PeerId) {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())[node] = None;
    }

    pub fn set_connected(&self, node: PeerId, up: bool) {
        self.connected.lock().unwrap_or_else(|e| e.into_inner())[node] = up;
    }

    pub fn is_connected(&self, node: PeerId) -> bool {
        self.connected.lock().unwrap_or_else(|e| e.into_inner())[node]
    }

    /// Probability in [0, 1) that any one message is silently dropped.
    pub fn set_loss(&self, probability: f64) {
        *self.loss.lock().unwrap_or_else(|e| e.into_inner()) = probability;
    }

    fn dropped(&self) -> bool {
        let p = *self.loss.lock().unwrap_or_else(|e| e.into_inner());
        p > 0.0 && rand::rng().random::<f64>() < p
    }

    fn target(&self, from: PeerId, to: PeerId) -> Option<Arc<dyn RpcHandler<Cmd>>> {
        if !self.is_connected(from) || !self.is_connected(to) || self.dropped() {
            return None;
        }
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())[to].clone()
    }

    /// The reply leg of an RPC whose request already executed.
    fn reply_survives(&self, from: PeerId, to: PeerId) -> bool {
        self.is_connected(from) && self.is_connected(to) && !self.dropped()
    }
}

/// One node's view of the [`Network`].
pub struct NetPeer<Cmd> {
    me: PeerId,
    net: Arc<Network<Cmd>>,
}

impl<Cmd> NetPeer<Cmd> {
    pub fn new(me: PeerId, net: Arc<Network<Cmd>>) -> NetPeer<Cmd> {
        NetPeer { me, net }
    }
}

impl<Cmd> Transport<Cmd> for NetPeer<Cmd>
where
    Cmd: Clone + Send + Sync,
{
    fn request_vote(&self, peer: PeerId, args: &RequestVoteArgs) -> Option<RequestVoteReply> {
        let handler = self.net.target(self.me, peer)?;
        let reply = handler.request_vote(args.clone());
        self.net.reply_survives(self.me, peer).then_some(reply)
    }

    fn append_entries(
        &self,
        peer: PeerId,
        args: &AppendEntriesArgs<Cmd>,
    ) -> Option<AppendEntriesReply> {
        let handler = self.net.target(self.me, peer)?;
        let reply = handler.append_entries(args.clone());
        self.net.reply_survives(self.me, peer).then_some(reply)
    }
}

/// A whole cluster under one roof: engines, persisters that outlive
/// crashes, and a record of what every node delivered to its application.
pub struct Cluster<Cmd>
where
    Cmd: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    n: usize,
    net: Arc<Network<Cmd>>,
    persisters: Vec<Arc<MemoryPersister>>,
    nodes: Vec<Option<Raft<Cmd, NetPeer<Cmd>>>>,
    applied: Vec<Arc<Mutex<Vec<(LogIndex, Cmd)>>>>,
}

impl<Cmd> Cluster<Cmd>
where
    Cmd: Clone + Send + Sync + Serialize + DeserializeOwned + PartialEq + 'static,
{
    pub fn new(n: usize) -> Result<Cluster<Cmd>> {
        let mut cluster = Cluster {
            n,
            net: Network::new(n),
            persisters: (0..n).map(|_| Arc::new(MemoryPersister::new())).collect(),
            nodes: (0..n).map(|_| None).collect(),
            applied: (0..n).map(|_| Arc::new(Mutex::new(Vec::new()))).collect(),
        };
        for i in 0..n {
            cluster.start_node(i)?;
        }
        Ok(cluster)
    }

    /// Boot node `i` from whatever its persister holds. A fresh process
    /// lifetime starts, so the applied record is reset as well.
    fn start_node(&mut self, i: PeerId) -> Result<()> {
        let (apply_tx, apply_rx) = mpsc::channel();
        let raft = Raft::spawn(
            NetPeer::new(i, Arc::clone(&self.net)),
            self.n,
            i,
            self.persisters[i].clone(),
            apply_tx,
        )?;

        self.applied[i].lock().unwrap_or_else(|e| e.into_inner()).clear();
        let sink = Arc::clone(&self.applied[i]);
        thread::spawn(move || {
            for msg in apply_rx {
                match msg {
                    ApplyMsg::Command { index, command } => {
                        sink.lock().unwrap_or_else(|e| e.into_inner()).push((index, command));
                    }
                }
            }
        });

        self.net.register(i, Arc::new(raft.clone()));
        self.nodes[i] = Some(raft);
        Ok(())
    }

    /// Stop node `i` as if its process died. The persister survives.
    pub fn crash(&mut self, i: PeerId) {
        self.net.unregister(i);
        if let Some(node) = self.nodes[i].take() {
            node.shutdown();
        }
        // Let the apply pump observe the flag and its collector drain, so a
        // straggling delivery cannot land in the next lifetime's record.
        thread::sleep(Duration::from_millis(50));
    }

    /// Bring a crashed (or running) node back with its durable state.
    pub fn restart(&mut self, i: PeerId) -> Result<()> {
        self.crash(i);
        self.net.set_connected(i, true);
        self.start_node(i)
    }

    /// Partition node `i` away; it keeps running but nothing gets through.
    pub fn disconnect(&self, i: PeerId) {
        self.net.set_connected(i, false);
    }

    pub fn reconnect(&self, i: PeerId) {
        self.net.set_connected(i, true);
    }

    pub fn set_loss(&self, probability: f64) {
        self.net.set_loss(probability);
    }

    pub fn node(&self, i: PeerId) -> Option<&Raft<Cmd, NetPeer<Cmd>>> {
        self.nodes[i].as_ref()
    }

    /// The connected node currently claiming leadership, if any.
    pub fn leader(&self) -> Option<PeerId> {
        (0..self.n).find(|&i| {
            self.net.is_connected(i)
                && self.nodes[i].as_ref().is_some_and(|node| node.is_leader())
        })
    }

    pub fn wait_for_leader(&self) -> Option<PeerId> {
        let deadline = Instant::now() + Duration::from_secs(8);
        while Instant::now() < deadline {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }

    /// What node `i` has delivered to its application so far, in order.
    pub fn applied_on(&self, i: PeerId) -> Vec<(LogIndex, Cmd)> {
        self.applied[i].lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn term_of(&self, i: PeerId) -> Option<Term> {
        self.nodes[i].as_ref().map(|node| node.state().0)
    }

    pub(crate) fn log_of(&self, i: PeerId) -> Option<Vec<(LogIndex, Term)>> {
        self.nodes[i].as_ref().map(|node| node.log_overview())
    }

    /// Drive one command to commitment on at least `expected` nodes,
    /// retrying across leader changes. Returns the index it committed at.
    pub fn commit_one(&self, command: Cmd, expected: usize) -> Option<LogIndex> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let submitted = (0..self.n)
                .filter(|&i| self.net.is_connected(i))
                .find_map(|i| {
                    let node = self.nodes[i].as_ref()?;
                    node.submit(command.clone()).map(|(index, _)| index)
                });

            let Some(index) = submitted else {
                thread::sleep(Duration::from_millis(50));
                continue;
            };

            let attempt_deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < attempt_deadline {
                let holders = (0..self.n)
                    .filter(|&i| {
                        self.applied[i]
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .iter()
                            .any(|(idx, cmd)| *idx == index && *cmd == command)
                    })
                    .count();
                if holders >= expected {
                    return Some(index);
                }
                thread::sleep(Duration::from_millis(20));
            }
            // Entry may have been lost to a leader change; submit again.
        }
        None
    }

    /// Wait until every running node holds an identical log.
    pub fn wait_logs_converge(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(8);
        while Instant::now() < deadline {
            let logs: Vec<_> = (0..self.n).filter_map(|i| self.log_of(i)).collect();
            if logs.windows(2).all(|pair| pair[0] == pair[1]) {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    /// Every applied stream must be dense from 1, and no two nodes may
    /// disagree about the command at any index.
    pub fn check_applied_consistent(&self) {
        for i in 0..self.n {
            let applied = self.applied_on(i);
            for (pos, (index, _)) in applied.iter().enumerate() {
                assert_eq!(
                    index.as_usize(),
                    pos + 1,
                    "node {i} delivered index {index} at position {pos}"
                );
            }
        }
        for a in 0..self.n {
            for b in (a + 1)..self.n {
                let left = self.applied_on(a);
                let right = self.applied_on(b);
                for (index, cmd) in &left {
                    if let Some((_, other)) = right.iter().find(|(idx, _)| idx == index) {
                        assert!(
                            cmd == other,
                            "nodes {a} and {b} disagree at index {index}"
                        );
                    }
                }
            }
        }
    }
}

impl<Cmd> Drop for Cluster<Cmd>
where
    Cmd: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn drop(&mut self) {
        for node in self.nodes.iter().flatten() {
            node.shutdown();
        }
    }
}
