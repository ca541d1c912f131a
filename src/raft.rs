//! The consensus engine: one replicated node.
//!
//! All mutable node state lives in a single record behind one mutex.
//! Cooperative background threads drive the protocol: an election ticker
//! that turns a quiet follower into a candidate, a replication ticker that
//! makes a leader send AppendEntries, and an apply pump that publishes
//! committed entries to the application in index order. No thread blocks on
//! the network or a channel while holding the lock; every RPC reply is
//! validated against the term and role captured at dispatch before it is
//! allowed to touch state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::persist::{self, Persister};
use crate::transport::{RpcHandler, Transport};
use crate::types::{
    AppendEntriesArgs, AppendEntriesReply, Conflict, Entry, LogIndex, PeerId, RequestVoteArgs,
    RequestVoteReply, Term,
};

/// Base election timeout; actual deadlines add a random jitter so
/// candidates rarely rise in lockstep.
const ELECTION_TIMEOUT: Duration = Duration::from_millis(400);
const ELECTION_JITTER_MS: u64 = 100;
/// How often a leader sends AppendEntries, entries or not.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(125);
/// Poll granularity of the election ticker; well under the jitter window so
/// randomized deadlines actually spread candidates out.
const ELECTION_TICK: Duration = Duration::from_millis(20);
/// Poll granularity of the apply pump when there is nothing to deliver.
const APPLY_TICK: Duration = Duration::from_millis(20);

/// Record published to the apply channel for every committed entry.
///
/// The enum leaves room for other record kinds without breaking consumers.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ApplyMsg<Cmd> {
    Command { index: LogIndex, command: Cmd },
}

/// Role of a node, with the bookkeeping that only that role carries.
enum Role {
    Follower,
    Candidate {
        /// Granted votes, self included.
        votes: usize,
    },
    Leader {
        /// Per peer, the next log index to send.
        next_index: Vec<LogIndex>,
        /// Per peer, the highest index known replicated there.
        match_index: Vec<LogIndex>,
    },
}

/// Everything mutable about a node, guarded by one mutex.
struct RaftState<Cmd> {
    current_term: Term,
    voted_for: Option<PeerId>,
    /// Never empty: index 0 holds the sentinel.
    log: Vec<Entry<Cmd>>,
    role: Role,
    commit_index: LogIndex,
    last_applied: LogIndex,
    election_deadline: Instant,
}

impl<Cmd> RaftState<Cmd> {
    fn last_entry(&self) -> &Entry<Cmd> {
        &self.log[self.log.len() - 1]
    }

    fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    /// A message from a newer term wins unconditionally: adopt the term,
    /// forget the vote, return to follower.
    fn step_down(&mut self, term: Term) {
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
    }

    fn become_leader(&mut self, num_peers: usize) {
        let next = LogIndex::new(self.log.len() as u64);
        self.role = Role::Leader {
            next_index: vec![next; num_peers],
            match_index: vec![LogIndex::ZERO; num_peers],
        };
    }

    /// Raise `commit_index` to the highest N replicated on a majority,
    /// counting this node, provided log[N] is from the current term.
    /// Older-term entries only commit by riding below such an N.
    fn advance_leader_commit(&mut self, me: PeerId, majority: usize) {
        let Role::Leader { match_index, .. } = &self.role else {
            return;
        };
        let mut new_commit = self.commit_index;
        for n in (self.commit_index.as_usize() + 1)..self.log.len() {
            if self.log[n].term != self.current_term {
                continue;
            }
            let replicated = 1 + match_index
                .iter()
                .enumerate()
                .filter(|&(p, m)| p != me && m.as_usize() >= n)
                .count();
            if replicated >= majority {
                new_commit = LogIndex::new(n as u64);
            }
        }
        self.commit_index = new_commit;
    }
}

struct Inner<Cmd, T> {
    me: PeerId,
    /// Cluster size, this node included.
    num_peers: usize,
    transport: T,
    persister: Arc<dyn Persister>,
    state: Mutex<RaftState<Cmd>>,
    dead: AtomicBool,
}

/// Handle to a running node. Cheap to clone; all clones share the node.
pub struct Raft<Cmd, T> {
    inner: Arc<Inner<Cmd, T>>,
}

impl<Cmd, T> Clone for Raft<Cmd, T> {
    fn clone(&self) -> Self {
        Raft {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn next_election_deadline() -> Instant {
    let jitter = rand::rng().random_range(0..ELECTION_JITTER_MS);
    Instant::now() + ELECTION_TIMEOUT + Duration::from_millis(jitter)
}

impl<Cmd, T> Raft<Cmd, T>
where
    Cmd: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    T: Transport<Cmd> + Send + Sync + 'static,
{
    /// Restore persistent state and start the background tasks. Committed
    /// entries flow out on `apply_tx` in index order. Returns promptly.
    ///
    /// The only fatal condition is a persisted blob that cannot be decoded;
    /// a node that has forgotten its own durable state must not rejoin.
    pub fn spawn(
        transport: T,
        num_peers: usize,
        me: PeerId,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg<Cmd>>,
    ) -> Result<Raft<Cmd, T>> {
        let raft = Self::build(transport, num_peers, me, persister)?;

        let inner = Arc::clone(&raft.inner);
        thread::spawn(move || Inner::run_election_ticker(&inner));
        let inner = Arc::clone(&raft.inner);
        thread::spawn(move || Inner::run_heartbeats(&inner));
        let inner = Arc::clone(&raft.inner);
        thread::spawn(move || Inner::run_apply(&inner, apply_tx));

        Ok(raft)
    }

    /// Construct the node without starting any background task.
    fn build(
        transport: T,
        num_peers: usize,
        me: PeerId,
        persister: Arc<dyn Persister>,
    ) -> Result<Raft<Cmd, T>> {
        let mut state = RaftState {
            current_term: Term::ZERO,
            voted_for: None,
            log: vec![Entry::sentinel()],
            role: Role::Follower,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            election_deadline: next_election_deadline(),
        };

        let blob = persister.load()?;
        if !blob.is_empty() {
            let hard = persist::decode_hard_state::<Cmd>(&blob)?;
            persist::check_restored_log(&hard.log)?;
            state.current_term = hard.current_term;
            state.voted_for = hard.voted_for;
            state.log = hard.log;
            info!(
                me,
                term = state.current_term.get(),
                entries = state.log.len() - 1,
                "restored persistent state"
            );
        }

        Ok(Raft {
            inner: Arc::new(Inner {
                me,
                num_peers,
                transport,
                persister,
                state: Mutex::new(state),
                dead: AtomicBool::new(false),
            }),
        })
    }

    /// Submit a command for replication. On a leader, appends the entry,
    /// persists it, and returns its future position and the current term;
    /// commitment is not guaranteed and must be observed on the apply
    /// channel. On any other role, returns `None` and changes nothing.
    pub fn submit(&self, command: Cmd) -> Option<(LogIndex, Term)> {
        let inner = &self.inner;
        if inner.is_dead() {
            return None;
        }
        let mut s = inner.lock_state();
        if !s.is_leader() {
            return None;
        }

        let index = LogIndex::new(s.log.len() as u64);
        let term = s.current_term;
        s.log.push(Entry {
            index,
            term,
            command: Some(command),
        });
        debug!(me = inner.me, index = index.get(), term = term.get(), "accepted command");

        if !inner.persist(&s) {
            return None;
        }
        Some((index, term))
    }

    /// Current term and whether this node believes it is the leader.
    pub fn state(&self) -> (Term, bool) {
        let s = self.inner.lock_state();
        (s.current_term, s.is_leader())
    }

    pub fn is_leader(&self) -> bool {
        self.state().1
    }

    /// Mark the node dead. Background tasks observe the flag and exit at
    /// their next check point; replies to RPCs already in flight are
    /// discarded by the term/role validation.
    pub fn shutdown(&self) {
        self.inner.dead.store(true, Ordering::Release);
    }

    /// `(index, term)` of every log entry, for consistency checks.
    pub(crate) fn log_overview(&self) -> Vec<(LogIndex, Term)> {
        let s = self.inner.lock_state();
        s.log.iter().map(|e| (e.index, e.term)).collect()
    }

    /// Vote request handler.
    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let inner = &self.inner;
        let mut s = inner.lock_state();
        let mut changed = false;

        if args.term > s.current_term {
            s.step_down(args.term);
            changed = true;
        }
        if args.term < s.current_term {
            debug!(
                me = inner.me,
                candidate = args.candidate_id,
                term = args.term.get(),
                current = s.current_term.get(),
                "rejecting vote from stale term"
            );
            return RequestVoteReply {
                term: s.current_term,
                vote_granted: false,
            };
        }

        let up_to_date = {
            let last = s.last_entry();
            args.last_log_term > last.term
                || (args.last_log_term == last.term && args.last_log_index >= last.index)
        };
        let free_to_vote = s.voted_for.is_none() || s.voted_for == Some(args.candidate_id);

        let mut granted = false;
        if free_to_vote && up_to_date {
            s.voted_for = Some(args.candidate_id);
            s.election_deadline = next_election_deadline();
            changed = true;
            granted = true;
        }

        if changed && !inner.persist(&s) {
            granted = false;
        }
        debug!(
            me = inner.me,
            candidate = args.candidate_id,
            term = s.current_term.get(),
            granted,
            "vote decided"
        );
        RequestVoteReply {
            term: s.current_term,
            vote_granted: granted,
        }
    }

    /// Append/heartbeat handler.
    pub fn handle_append_entries(&self, args: AppendEntriesArgs<Cmd>) -> AppendEntriesReply {
        let inner = &self.inner;
        let mut s = inner.lock_state();
        let mut changed = false;

        if args.term > s.current_term {
            s.step_down(args.term);
            changed = true;
        }
        if args.term < s.current_term {
            if changed {
                inner.persist(&s);
            }
            return AppendEntriesReply {
                term: s.current_term,
                success: false,
                conflict: None,
            };
        }

        // Same term as ours, so args.leader_id is the leader of this term;
        // a candidate yields to it.
        if matches!(s.role, Role::Candidate { .. }) {
            s.role = Role::Follower;
        }
        s.election_deadline = next_election_deadline();

        // Consistency check against the entry preceding the batch.
        let prev = args.prev_log_index.as_usize();
        if prev >= s.log.len() {
            let reply = AppendEntriesReply {
                term: s.current_term,
                success: false,
                conflict: Some(Conflict::TooShort {
                    len: LogIndex::new(s.log.len() as u64),
                }),
            };
            if changed {
                inner.persist(&s);
            }
            debug!(
                me = inner.me,
                leader = args.leader_id,
                prev_log_index = args.prev_log_index.get(),
                len = s.log.len(),
                "append rejected, log too short"
            );
            return reply;
        }
        if s.log[prev].term != args.prev_log_term {
            let conflicting = s.log[prev].term;
            let first_index = s
                .log
                .iter()
                .find(|e| e.term == conflicting)
                .map(|e| e.index)
                .unwrap_or(LogIndex::FIRST);
            let reply = AppendEntriesReply {
                term: s.current_term,
                success: false,
                conflict: Some(Conflict::Mismatch {
                    term: conflicting,
                    first_index,
                }),
            };
            if changed {
                inner.persist(&s);
            }
            debug!(
                me = inner.me,
                leader = args.leader_id,
                prev_log_index = args.prev_log_index.get(),
                expected = args.prev_log_term.get(),
                found = conflicting.get(),
                "append rejected, term mismatch"
            );
            return reply;
        }

        // Merge. Entries already present with a matching term are left
        // untouched so a stale duplicate can never clobber a longer log.
        let entries = args.entries;
        let batch_len = entries.len();
        let mut matched = 0;
        for (j, entry) in entries.iter().enumerate() {
            let idx = prev + 1 + j;
            if idx < s.log.len() && s.log[idx].term == entry.term {
                matched = j + 1;
            } else {
                break;
            }
        }
        if matched < batch_len {
            let idx = prev + 1 + matched;
            if idx < s.log.len() {
                s.log.truncate(idx);
            }
            s.log.extend(entries.into_iter().skip(matched));
            changed = true;
        }

        // Commit advancement: never past the last index this message vouches
        // for, and never backward.
        let last_vouched = if batch_len == 0 {
            LogIndex::new(s.log.len() as u64 - 1)
        } else {
            LogIndex::new((prev + batch_len) as u64)
        };
        if args.leader_commit > s.commit_index {
            let target = args.leader_commit.min(last_vouched);
            if target > s.commit_index {
                s.commit_index = target;
                debug!(
                    me = inner.me,
                    commit = s.commit_index.get(),
                    "follower commit advanced"
                );
            }
        }

        let ok = !changed || inner.persist(&s);
        AppendEntriesReply {
            term: s.current_term,
            success: ok,
            conflict: None,
        }
    }
}

impl<Cmd, T> RpcHandler<Cmd> for Raft<Cmd, T>
where
    Cmd: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    T: Transport<Cmd> + Send + Sync + 'static,
{
    fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        self.handle_request_vote(args)
    }

    fn append_entries(&self, args: AppendEntriesArgs<Cmd>) -> AppendEntriesReply {
        self.handle_append_entries(args)
    }
}

impl<Cmd, T> Inner<Cmd, T>
where
    Cmd: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    T: Transport<Cmd> + Send + Sync + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, RaftState<Cmd>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn majority(&self) -> usize {
        self.num_peers / 2 + 1
    }

    /// Write the durable fields to stable storage. Must complete before any
    /// reply derived from them leaves the node. A node whose persister stops
    /// accepting writes can no longer uphold that contract, so it retires
    /// itself; the caller degrades the pending reply to a refusal, which is
    /// always a safe answer in this protocol.
    fn persist(&self, s: &RaftState<Cmd>) -> bool {
        let written = persist::encode_hard_state(s.current_term, s.voted_for, &s.log)
            .map_err(crate::error::Error::from)
            .and_then(|blob| self.persister.save(&blob).map_err(crate::error::Error::from));
        match written {
            Ok(()) => true,
            Err(err) => {
                error!(me = self.me, %err, "cannot persist state, retiring node");
                self.dead.store(true, Ordering::Release);
                false
            }
        }
    }

    // Election ticker: follower or candidate whose deadline has passed
    // starts (another) election.
    fn run_election_ticker(inner: &Arc<Self>) {
        while !inner.is_dead() {
            Self::maybe_start_election(inner);
            thread::sleep(ELECTION_TICK);
        }
    }

    fn maybe_start_election(inner: &Arc<Self>) {
        let args = {
            let mut s = inner.lock_state();
            if s.is_leader() || Instant::now() < s.election_deadline {
                return;
            }

            s.current_term = s.current_term.next();
            s.voted_for = Some(inner.me);
            s.role = Role::Candidate { votes: 1 };
            s.election_deadline = next_election_deadline();
            if !inner.persist(&s) {
                return;
            }

            // A cluster of one is its own majority; there is no one to ask.
            if inner.majority() == 1 {
                s.become_leader(inner.num_peers);
                info!(me = inner.me, term = s.current_term.get(), "won election");
                drop(s);
                Self::broadcast_append(inner);
                return;
            }

            let last = s.last_entry();
            RequestVoteArgs {
                term: s.current_term,
                candidate_id: inner.me,
                last_log_index: last.index,
                last_log_term: last.term,
            }
        };
        info!(me = inner.me, term = args.term.get(), "election started");

        for peer in (0..inner.num_peers).filter(|&p| p != inner.me) {
            let inner = Arc::clone(inner);
            let args = args.clone();
            thread::spawn(move || {
                if let Some(reply) = inner.transport.request_vote(peer, &args) {
                    Self::on_vote_reply(&inner, args.term, reply);
                }
            });
        }
    }

    fn on_vote_reply(inner: &Arc<Self>, dispatch_term: Term, reply: RequestVoteReply) {
        if inner.is_dead() {
            return;
        }
        let mut s = inner.lock_state();

        if reply.term > s.current_term {
            s.step_down(reply.term);
            inner.persist(&s);
            return;
        }
        // The world may have moved on while the RPC was in flight.
        if s.current_term != dispatch_term {
            return;
        }
        let Role::Candidate { votes } = &mut s.role else {
            return;
        };
        if !reply.vote_granted {
            return;
        }

        *votes += 1;
        if *votes < inner.majority() {
            return;
        }

        s.become_leader(inner.num_peers);
        info!(me = inner.me, term = s.current_term.get(), "won election");
        drop(s);

        // Announce leadership without waiting for the next tick.
        Self::broadcast_append(inner);
    }

    // Replication ticker: a leader sends AppendEntries to every peer each
    // beat, carrying entries for peers that are behind and nothing for
    // peers that are caught up.
    fn run_heartbeats(inner: &Arc<Self>) {
        while !inner.is_dead() {
            Self::broadcast_append(inner);
            thread::sleep(HEARTBEAT_INTERVAL);
        }
    }

    fn broadcast_append(inner: &Arc<Self>) {
        let batches: Vec<(PeerId, AppendEntriesArgs<Cmd>)> = {
            let mut s = inner.lock_state();
            if !s.is_leader() {
                return;
            }
            // Commitment must not wait for a reply to arrive: retake stock
            // every beat, so a cluster of one advances too.
            s.advance_leader_commit(inner.me, inner.majority());
            let Role::Leader { next_index, .. } = &s.role else {
                return;
            };
            (0..inner.num_peers)
                .filter(|&p| p != inner.me)
                .map(|p| {
                    let next = next_index[p].as_usize().clamp(1, s.log.len());
                    let prev = &s.log[next - 1];
                    (
                        p,
                        AppendEntriesArgs {
                            term: s.current_term,
                            leader_id: inner.me,
                            prev_log_index: prev.index,
                            prev_log_term: prev.term,
                            entries: s.log[next..].to_vec(),
                            leader_commit: s.commit_index,
                        },
                    )
                })
                .collect()
        };

        for (peer, args) in batches {
            let inner = Arc::clone(inner);
            thread::spawn(move || {
                if let Some(reply) = inner.transport.append_entries(peer, &args) {
                    inner.on_append_reply(peer, &args, reply);
                }
            });
        }
    }

    fn on_append_reply(&self, peer: PeerId, args: &AppendEntriesArgs<Cmd>, reply: AppendEntriesReply) {
        if self.is_dead() {
            return;
        }
        let mut s = self.lock_state();

        if reply.term > s.current_term {
            info!(
                me = self.me,
                term = reply.term.get(),
                "peer has newer term, stepping down"
            );
            s.step_down(reply.term);
            self.persist(&s);
            return;
        }
        // Discard replies to requests sent under an older term or role.
        if s.current_term != args.term || !s.is_leader() {
            return;
        }

        if reply.success {
            if args.entries.is_empty() {
                return;
            }
            let matched = LogIndex::new((args.prev_log_index.as_usize() + args.entries.len()) as u64);
            if let Role::Leader {
                next_index,
                match_index,
            } = &mut s.role
            {
                if matched > match_index[peer] {
                    match_index[peer] = matched;
                    next_index[peer] = matched.next();
                }
            }
            s.advance_leader_commit(self.me, self.majority());
            return;
        }

        let Some(conflict) = reply.conflict else {
            // Rejected without a hint (e.g. the follower could not persist);
            // the next beat retries as-is.
            return;
        };
        let rollback = match conflict {
            Conflict::TooShort { len } => len,
            Conflict::Mismatch { term, first_index } => s
                .log
                .iter()
                .rev()
                .find(|e| e.term == term)
                .map(|e| e.index)
                .unwrap_or(first_index),
        };
        let rollback = rollback.max(LogIndex::FIRST);
        if let Role::Leader { next_index, .. } = &mut s.role {
            debug!(
                me = self.me,
                peer,
                from = next_index[peer].get(),
                to = rollback.get(),
                "backing up replication cursor"
            );
            next_index[peer] = rollback;
        }
    }

    // Apply pump: deliver committed entries in index order, one at a time,
    // publishing outside the lock.
    fn run_apply(inner: &Arc<Self>, apply_tx: Sender<ApplyMsg<Cmd>>) {
        loop {
            if inner.is_dead() {
                return;
            }
            match inner.next_apply() {
                Some(msg) => {
                    if apply_tx.send(msg).is_err() {
                        // Application went away; nothing left to deliver to.
                        return;
                    }
                }
                None => thread::sleep(APPLY_TICK),
            }
        }
    }

    /// Claim the next committed-but-unapplied entry, advancing
    /// `last_applied` under the lock.
    fn next_apply(&self) -> Option<ApplyMsg<Cmd>> {
        let mut s = self.lock_state();
        if s.last_applied >= s.commit_index {
            return None;
        }
        let next = s.last_applied.next();
        s.last_applied = next;
        let entry = &s.log[next.as_usize()];
        entry.command.clone().map(|command| ApplyMsg::Command {
            index: next,
            command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersister;

    /// Transport into the void: every call is a lost message.
    struct NullTransport;

    impl<Cmd> Transport<Cmd> for NullTransport {
        fn request_vote(&self, _: PeerId, _: &RequestVoteArgs) -> Option<RequestVoteReply> {
            None
        }

        fn append_entries(
            &self,
            _: PeerId,
            _: &AppendEntriesArgs<Cmd>,
        ) -> Option<AppendEntriesReply> {
            None
        }
    }

    type TestRaft = Raft<u64, NullTransport>;

    fn node(num_peers: usize) -> (TestRaft, Arc<MemoryPersister>) {
        let persister = Arc::new(MemoryPersister::new());
        let raft = TestRaft::build(NullTransport, num_peers, 0, persister.clone()).expect("build");
        (raft, persister)
    }

    fn entry(index: u64, term: u64) -> Entry<u64> {
        Entry {
            index: LogIndex::new(index),
            term: Term::new(term),
            command: Some(index * 10),
        }
    }

    fn vote_args(term: u64, candidate: PeerId, last_index: u64, last_term: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term: Term::new(term),
            candidate_id: candidate,
            last_log_index: LogIndex::new(last_index),
            last_log_term: Term::new(last_term),
        }
    }

    fn append_args(
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<Entry<u64>>,
        leader_commit: u64,
    ) -> AppendEntriesArgs<u64> {
        AppendEntriesArgs {
            term: Term::new(term),
            leader_id: 1,
            prev_log_index: LogIndex::new(prev_index),
            prev_log_term: Term::new(prev_term),
            entries,
            leader_commit: LogIndex::new(leader_commit),
        }
    }

    /// Trip the election timer and tally enough votes to win.
    fn make_leader(raft: &TestRaft) {
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        let term = raft.state().0;
        for _ in 0..(raft.inner.majority() - 1) {
            Inner::on_vote_reply(
                &raft.inner,
                term,
                RequestVoteReply {
                    term,
                    vote_granted: true,
                },
            );
        }
        assert!(raft.is_leader());
    }

    #[test]
    fn follower_grants_vote_and_persists_it() {
        let (raft, persister) = node(3);

        let reply = raft.handle_request_vote(vote_args(1, 2, 0, 0));
        assert!(reply.vote_granted);
        assert_eq!(reply.term, Term::new(1));

        let blob = persister.load().expect("load");
        let hard = persist::decode_hard_state::<u64>(&blob).expect("decode");
        assert_eq!(hard.current_term, Term::new(1));
        assert_eq!(hard.voted_for, Some(2));
    }

    #[test]
    fn one_vote_per_term() {
        let (raft, _) = node(3);

        assert!(raft.handle_request_vote(vote_args(5, 2, 0, 0)).vote_granted);
        // Different candidate, same term: no.
        assert!(!raft.handle_request_vote(vote_args(5, 1, 0, 0)).vote_granted);
        // Same candidate again: yes, re-granting is harmless.
        assert!(raft.handle_request_vote(vote_args(5, 2, 0, 0)).vote_granted);
    }

    #[test]
    fn vote_denied_to_stale_log() {
        let (raft, _) = node(3);
        // Local log gains two entries of term 2.
        let reply =
            raft.handle_append_entries(append_args(2, 0, 0, vec![entry(1, 2), entry(2, 2)], 0));
        assert!(reply.success);

        // Candidate in a newer term but with an older last log term.
        assert!(!raft.handle_request_vote(vote_args(3, 2, 5, 1)).vote_granted);
        // Same last term but shorter log.
        assert!(!raft.handle_request_vote(vote_args(3, 2, 1, 2)).vote_granted);
        // Same last term, equal length: up to date.
        assert!(raft.handle_request_vote(vote_args(3, 2, 2, 2)).vote_granted);
    }

    #[test]
    fn stale_term_vote_request_rejected_with_current_term() {
        let (raft, _) = node(3);
        raft.handle_request_vote(vote_args(4, 2, 0, 0));

        let reply = raft.handle_request_vote(vote_args(3, 1, 9, 3));
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, Term::new(4));
    }

    #[test]
    fn higher_term_vote_request_demotes_leader() {
        let (raft, _) = node(3);
        make_leader(&raft);
        let (term, _) = raft.state();

        let reply = raft.handle_request_vote(vote_args(term.get() + 1, 2, 0, 0));
        // Our log (empty) is no better than theirs, so the vote is granted
        // and leadership is gone.
        assert!(reply.vote_granted);
        assert!(!raft.is_leader());
        assert_eq!(raft.state().0, Term::new(term.get() + 1));
    }

    #[test]
    fn granting_a_vote_resets_the_election_deadline() {
        let (raft, _) = node(3);
        let before = {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now();
            s.election_deadline
        };

        raft.handle_request_vote(vote_args(1, 2, 0, 0));
        let after = raft.inner.lock_state().election_deadline;
        assert!(after > before);
    }

    #[test]
    fn append_from_old_term_is_refused() {
        let (raft, _) = node(3);
        raft.handle_request_vote(vote_args(3, 2, 0, 0));

        let reply = raft.handle_append_entries(append_args(2, 0, 0, vec![entry(1, 2)], 0));
        assert!(!reply.success);
        assert_eq!(reply.term, Term::new(3));
        assert!(reply.conflict.is_none());
        // Nothing was appended.
        assert_eq!(raft.log_overview().len(), 1);
    }

    #[test]
    fn empty_log_accepts_first_batch() {
        let (raft, _) = node(3);

        let reply =
            raft.handle_append_entries(append_args(1, 0, 0, vec![entry(1, 1), entry(2, 1)], 0));
        assert!(reply.success);
        assert_eq!(
            raft.log_overview(),
            vec![
                (LogIndex::ZERO, Term::ZERO),
                (LogIndex::new(1), Term::new(1)),
                (LogIndex::new(2), Term::new(1)),
            ]
        );
    }

    #[test]
    fn heartbeat_propagates_commit_up_to_own_last_entry() {
        let (raft, _) = node(3);
        raft.handle_append_entries(append_args(1, 0, 0, vec![entry(1, 1), entry(2, 1)], 0));

        // Leader claims commit 5, but this log only vouches for 2.
        let reply = raft.handle_append_entries(append_args(1, 2, 1, vec![], 5));
        assert!(reply.success);
        assert_eq!(raft.inner.lock_state().commit_index, LogIndex::new(2));
    }

    #[test]
    fn short_log_reports_its_length() {
        let (raft, _) = node(3);
        raft.handle_append_entries(append_args(1, 0, 0, vec![entry(1, 1)], 0));

        let reply = raft.handle_append_entries(append_args(1, 5, 1, vec![entry(6, 1)], 0));
        assert!(!reply.success);
        assert_eq!(
            reply.conflict,
            Some(Conflict::TooShort {
                len: LogIndex::new(2)
            })
        );
    }

    #[test]
    fn term_mismatch_reports_first_index_of_conflicting_term() {
        let (raft, _) = node(3);
        // Log terms: [0, 1, 1, 2, 2]
        raft.handle_append_entries(append_args(
            2,
            0,
            0,
            vec![entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)],
            0,
        ));

        let reply = raft.handle_append_entries(append_args(3, 4, 3, vec![entry(5, 3)], 0));
        assert!(!reply.success);
        assert_eq!(
            reply.conflict,
            Some(Conflict::Mismatch {
                term: Term::new(2),
                first_index: LogIndex::new(3)
            })
        );
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let (raft, _) = node(3);
        // Log terms: [0, 1, 1, 2, 2]
        raft.handle_append_entries(append_args(
            2,
            0,
            0,
            vec![entry(1, 1), entry(2, 1), entry(3, 2), entry(4, 2)],
            0,
        ));

        // The leader of term 3 overwrites indices 3.. with its own entries.
        let reply = raft.handle_append_entries(append_args(
            3,
            2,
            1,
            vec![entry(3, 3), entry(4, 3), entry(5, 3)],
            0,
        ));
        assert!(reply.success);
        assert_eq!(
            raft.log_overview(),
            vec![
                (LogIndex::ZERO, Term::ZERO),
                (LogIndex::new(1), Term::new(1)),
                (LogIndex::new(2), Term::new(1)),
                (LogIndex::new(3), Term::new(3)),
                (LogIndex::new(4), Term::new(3)),
                (LogIndex::new(5), Term::new(3)),
            ]
        );
    }

    #[test]
    fn redelivery_never_truncates_matching_entries() {
        let (raft, _) = node(3);
        raft.handle_append_entries(append_args(
            1,
            0,
            0,
            vec![entry(1, 1), entry(2, 1), entry(3, 1)],
            0,
        ));
        let full = raft.log_overview();

        // A duplicate of an older, shorter batch arrives late.
        let reply = raft.handle_append_entries(append_args(1, 0, 0, vec![entry(1, 1)], 0));
        assert!(reply.success);
        assert_eq!(raft.log_overview(), full);

        // Exact redelivery of the full batch is also a no-op.
        let reply = raft.handle_append_entries(append_args(
            1,
            0,
            0,
            vec![entry(1, 1), entry(2, 1), entry(3, 1)],
            0,
        ));
        assert!(reply.success);
        assert_eq!(raft.log_overview(), full);
    }

    #[test]
    fn candidate_yields_to_leader_of_same_term() {
        let (raft, _) = node(3);
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        let term = raft.state().0;
        assert!(matches!(
            raft.inner.lock_state().role,
            Role::Candidate { .. }
        ));

        let reply = raft.handle_append_entries(AppendEntriesArgs {
            term,
            leader_id: 1,
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        });
        assert!(reply.success);
        assert!(matches!(raft.inner.lock_state().role, Role::Follower));
    }

    #[test]
    fn submit_on_follower_changes_nothing() {
        let (raft, persister) = node(3);

        assert!(raft.submit(42).is_none());
        assert_eq!(raft.log_overview().len(), 1);
        assert!(persister.load().expect("load").is_empty());
    }

    #[test]
    fn submit_on_leader_appends_and_persists() {
        let (raft, persister) = node(3);
        make_leader(&raft);
        let term = raft.state().0;

        let (index, submit_term) = raft.submit(42).expect("leader accepts");
        assert_eq!(index, LogIndex::new(1));
        assert_eq!(submit_term, term);

        let hard =
            persist::decode_hard_state::<u64>(&persister.load().expect("load")).expect("decode");
        assert_eq!(hard.log.len(), 2);
        assert_eq!(hard.log[1].command, Some(42));
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let (raft, _) = node(3);
        make_leader(&raft);
        raft.shutdown();
        assert!(raft.submit(42).is_none());
    }

    #[test]
    fn election_kickoff_votes_for_self_and_persists() {
        let (raft, persister) = node(3);
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);

        let s = raft.inner.lock_state();
        assert_eq!(s.current_term, Term::new(1));
        assert_eq!(s.voted_for, Some(0));
        assert!(matches!(s.role, Role::Candidate { votes: 1 }));
        drop(s);

        let hard =
            persist::decode_hard_state::<u64>(&persister.load().expect("load")).expect("decode");
        assert_eq!(hard.current_term, Term::new(1));
        assert_eq!(hard.voted_for, Some(0));
    }

    #[test]
    fn majority_of_votes_promotes_with_fresh_leader_state() {
        let (raft, _) = node(5);
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        let term = raft.state().0;

        // Two grants on top of the self-vote reach 3 of 5.
        for _ in 0..2 {
            Inner::on_vote_reply(
                &raft.inner,
                term,
                RequestVoteReply {
                    term,
                    vote_granted: true,
                },
            );
        }

        let s = raft.inner.lock_state();
        let Role::Leader {
            next_index,
            match_index,
        } = &s.role
        else {
            panic!("expected leader");
        };
        assert_eq!(next_index, &vec![LogIndex::new(1); 5]);
        assert_eq!(match_index, &vec![LogIndex::ZERO; 5]);
    }

    #[test]
    fn vote_reply_with_newer_term_ends_the_candidacy() {
        let (raft, _) = node(3);
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        let term = raft.state().0;

        Inner::on_vote_reply(
            &raft.inner,
            term,
            RequestVoteReply {
                term: Term::new(term.get() + 3),
                vote_granted: false,
            },
        );

        let s = raft.inner.lock_state();
        assert!(matches!(s.role, Role::Follower));
        assert_eq!(s.current_term, Term::new(term.get() + 3));
        assert_eq!(s.voted_for, None);
    }

    #[test]
    fn stale_vote_reply_is_discarded() {
        let (raft, _) = node(3);
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        let term = raft.state().0;

        // A grant from a previous term's campaign must not count.
        Inner::on_vote_reply(
            &raft.inner,
            Term::new(term.get() - 1),
            RequestVoteReply {
                term: Term::new(term.get() - 1),
                vote_granted: true,
            },
        );
        Inner::on_vote_reply(
            &raft.inner,
            term,
            RequestVoteReply {
                term,
                vote_granted: true,
            },
        );
        // One stale grant plus one real grant: majority only if both counted.
        assert!(raft.is_leader());

        // Rebuild the scenario, this time with only the stale grant.
        let (raft, _) = node(3);
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        let term = raft.state().0;
        Inner::on_vote_reply(
            &raft.inner,
            Term::new(term.get() - 1),
            RequestVoteReply {
                term: Term::new(term.get() - 1),
                vote_granted: true,
            },
        );
        assert!(!raft.is_leader());
    }

    #[test]
    fn successful_append_reply_advances_progress_and_commit() {
        let (raft, _) = node(3);
        make_leader(&raft);
        raft.submit(7).expect("accepted");
        let term = raft.state().0;

        let args = AppendEntriesArgs {
            term,
            leader_id: 0,
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![Entry {
                index: LogIndex::new(1),
                term,
                command: Some(7),
            }],
            leader_commit: LogIndex::ZERO,
        };
        raft.inner.on_append_reply(
            1,
            &args,
            AppendEntriesReply {
                term,
                success: true,
                conflict: None,
            },
        );

        let s = raft.inner.lock_state();
        let Role::Leader {
            next_index,
            match_index,
        } = &s.role
        else {
            panic!("expected leader");
        };
        assert_eq!(match_index[1], LogIndex::new(1));
        assert_eq!(next_index[1], LogIndex::new(2));
        // Leader + one follower is a majority of three.
        assert_eq!(s.commit_index, LogIndex::new(1));
    }

    #[test]
    fn heartbeat_reply_does_not_move_progress() {
        let (raft, _) = node(3);
        make_leader(&raft);
        let term = raft.state().0;

        let args = AppendEntriesArgs {
            term,
            leader_id: 0,
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };
        raft.inner.on_append_reply(
            1,
            &args,
            AppendEntriesReply {
                term,
                success: true,
                conflict: None,
            },
        );

        let s = raft.inner.lock_state();
        let Role::Leader {
            next_index,
            match_index,
        } = &s.role
        else {
            panic!("expected leader");
        };
        assert_eq!(match_index[1], LogIndex::ZERO);
        assert_eq!(next_index[1], LogIndex::new(1));
    }

    #[test]
    fn append_reply_with_newer_term_demotes() {
        let (raft, _) = node(3);
        make_leader(&raft);
        let term = raft.state().0;

        let args = AppendEntriesArgs {
            term,
            leader_id: 0,
            prev_log_index: LogIndex::ZERO,
            prev_log_term: Term::ZERO,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };
        raft.inner.on_append_reply(
            1,
            &args,
            AppendEntriesReply {
                term: Term::new(term.get() + 1),
                success: false,
                conflict: None,
            },
        );
        assert!(!raft.is_leader());
    }

    #[test]
    fn conflict_hints_roll_the_cursor_back() {
        let (raft, _) = node(3);
        make_leader(&raft);
        let term = raft.state().0;
        // Leader log gains three entries in its own term.
        for c in [1u64, 2, 3] {
            raft.submit(c).expect("accepted");
        }

        let args = |prev: u64| AppendEntriesArgs::<u64> {
            term,
            leader_id: 0,
            prev_log_index: LogIndex::new(prev),
            prev_log_term: term,
            entries: vec![],
            leader_commit: LogIndex::ZERO,
        };
        let reject = |conflict| AppendEntriesReply {
            term,
            success: false,
            conflict: Some(conflict),
        };
        let next_for_peer_1 = |raft: &TestRaft| {
            let s = raft.inner.lock_state();
            let Role::Leader { next_index, .. } = &s.role else {
                panic!("expected leader");
            };
            next_index[1]
        };

        // Follower too short.
        raft.inner.on_append_reply(
            1,
            &args(3),
            reject(Conflict::TooShort {
                len: LogIndex::new(2),
            }),
        );
        assert_eq!(next_for_peer_1(&raft), LogIndex::new(2));

        // Follower has a term this leader also has: jump to the leader's
        // last entry of that term.
        raft.inner.on_append_reply(
            1,
            &args(3),
            reject(Conflict::Mismatch {
                term,
                first_index: LogIndex::new(1),
            }),
        );
        assert_eq!(next_for_peer_1(&raft), LogIndex::new(3));

        // Follower has a term this leader lacks: jump to the follower's
        // first index of it.
        raft.inner.on_append_reply(
            1,
            &args(3),
            reject(Conflict::Mismatch {
                term: Term::new(99),
                first_index: LogIndex::new(2),
            }),
        );
        assert_eq!(next_for_peer_1(&raft), LogIndex::new(2));

        // The cursor never drops below the first real index.
        raft.inner.on_append_reply(
            1,
            &args(1),
            reject(Conflict::TooShort {
                len: LogIndex::ZERO,
            }),
        );
        assert_eq!(next_for_peer_1(&raft), LogIndex::FIRST);
    }

    #[test]
    fn entries_from_older_terms_commit_only_indirectly() {
        let (raft, _) = node(3);
        make_leader(&raft);
        let old_term = raft.state().0;

        // An entry from the current leadership term...
        raft.submit(1).expect("accepted");
        // ...then the node loses and regains leadership in a later term.
        {
            let mut s = raft.inner.lock_state();
            s.step_down(Term::new(old_term.get() + 1));
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        let new_term = raft.state().0;
        Inner::on_vote_reply(
            &raft.inner,
            new_term,
            RequestVoteReply {
                term: new_term,
                vote_granted: true,
            },
        );
        assert!(raft.is_leader());

        // Entry 1 (old term) is on a majority, but must not commit alone.
        {
            let mut s = raft.inner.lock_state();
            if let Role::Leader { match_index, .. } = &mut s.role {
                match_index[1] = LogIndex::new(1);
            }
            s.advance_leader_commit(0, 2);
            assert_eq!(s.commit_index, LogIndex::ZERO);
        }

        // A current-term entry replicated to the same majority commits
        // everything beneath it.
        raft.submit(2).expect("accepted");
        {
            let mut s = raft.inner.lock_state();
            if let Role::Leader { match_index, .. } = &mut s.role {
                match_index[1] = LogIndex::new(2);
            }
            s.advance_leader_commit(0, 2);
            assert_eq!(s.commit_index, LogIndex::new(2));
        }
    }

    #[test]
    fn apply_claims_entries_in_order_exactly_once() {
        let (raft, _) = node(3);
        raft.handle_append_entries(append_args(
            1,
            0,
            0,
            vec![entry(1, 1), entry(2, 1), entry(3, 1)],
            2,
        ));

        let first = raft.inner.next_apply().expect("entry 1");
        let second = raft.inner.next_apply().expect("entry 2");
        assert_eq!(
            first,
            ApplyMsg::Command {
                index: LogIndex::new(1),
                command: 10
            }
        );
        assert_eq!(
            second,
            ApplyMsg::Command {
                index: LogIndex::new(2),
                command: 20
            }
        );
        // Entry 3 is not yet committed.
        assert!(raft.inner.next_apply().is_none());

        // Commit catches up; only the new entry is delivered.
        raft.handle_append_entries(append_args(1, 3, 1, vec![], 3));
        let third = raft.inner.next_apply().expect("entry 3");
        assert_eq!(
            third,
            ApplyMsg::Command {
                index: LogIndex::new(3),
                command: 30
            }
        );
        assert!(raft.inner.next_apply().is_none());
    }

    #[test]
    fn a_cluster_of_one_leads_and_commits_by_itself() {
        let (raft, _) = node(1);
        {
            let mut s = raft.inner.lock_state();
            s.election_deadline = Instant::now() - Duration::from_millis(1);
        }
        Inner::maybe_start_election(&raft.inner);
        assert!(raft.is_leader());

        let (index, _) = raft.submit(9).expect("accepted");
        assert_eq!(index, LogIndex::new(1));

        // The next beat takes stock of commitment without any replies.
        Inner::broadcast_append(&raft.inner);
        assert_eq!(raft.inner.lock_state().commit_index, LogIndex::new(1));
        assert_eq!(
            raft.inner.next_apply(),
            Some(ApplyMsg::Command {
                index: LogIndex::new(1),
                command: 9
            })
        );
    }

    #[test]
    fn restart_restores_term_vote_and_log() {
        let persister = Arc::new(MemoryPersister::new());
        {
            let raft =
                TestRaft::build(NullTransport, 3, 0, persister.clone()).expect("build");
            raft.handle_request_vote(vote_args(5, 2, 0, 0));
            raft.handle_append_entries(append_args(5, 0, 0, vec![entry(1, 5)], 0));
        }

        let raft = TestRaft::build(NullTransport, 3, 0, persister).expect("rebuild");
        let (term, is_leader) = raft.state();
        assert_eq!(term, Term::new(5));
        assert!(!is_leader);
        assert_eq!(raft.log_overview().len(), 2);

        // The restored vote still binds: another candidate in term 5 is
        // refused.
        assert!(!raft.handle_request_vote(vote_args(5, 1, 9, 5)).vote_granted);
        // The original candidate may ask again.
        assert!(raft.handle_request_vote(vote_args(5, 2, 1, 5)).vote_granted);
    }

    #[test]
    fn garbage_in_the_persister_is_fatal() {
        let persister = Arc::new(MemoryPersister::new());
        persister.save(b"not json").expect("save");
        assert!(TestRaft::build(NullTransport, 3, 0, persister).is_err());
    }
}
