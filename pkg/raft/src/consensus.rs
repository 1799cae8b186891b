//! The Raft core: role state machine, election, replication, and commit-index
//! advancement. Everything here is synchronous and holds no locks of its own (it lives
//! behind the single mutex `crate::node::Node` wraps it in). Disk persistence happens inline,
//! before the method that triggered it returns, matching "persistence must complete before
//! the reply is sent"; only network sends are deferred to the caller, which is why the
//! receiver/reply methods return requests to dispatch rather than sending them directly.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use log::info;
use rand::Rng;

use crate::errors::*;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};
use crate::store::DurableStore;
use crate::types::{ApplyOutcome, LogEntry, LogEntryData, LogIndex, Metadata, NodeId, PendingOutcome, Term};

/// A replication request this node needs to send, produced while the core mutex was held
/// and handed back to the caller to dispatch once it has released the lock.
pub enum OutboundRpc {
	RequestVote { to: NodeId, req: RequestVoteRequest },
	AppendEntries { to: NodeId, req: AppendEntriesRequest, sent_prev_index: LogIndex, sent_count: usize },
}

struct CandidateState {
	votes_received: HashSet<NodeId>,
}

struct LeaderState {
	next_index: HashMap<NodeId, LogIndex>,
	match_index: HashMap<NodeId, LogIndex>,
}

enum Role {
	Follower,
	Candidate(CandidateState),
	Leader(LeaderState),
}

pub struct ConsensusCore {
	pub id: NodeId,
	peers: Vec<NodeId>,
	store: DurableStore,

	meta: Metadata,
	log: Vec<LogEntry>, // log[i] holds the entry at index i+1; index 0 is the implicit sentinel

	role: Role,
	leader_id: Option<NodeId>,
	commit_index: LogIndex,
	last_applied: LogIndex,

	election_deadline: Instant,
	election_timeout_range: (Duration, Duration),
	heartbeat_interval: Duration,

	pending_ack: HashMap<LogIndex, mpsc::Sender<PendingOutcome>>,

	pub shutdown: bool,
}

impl ConsensusCore {
	pub fn new(
		id: NodeId,
		peers: Vec<NodeId>,
		store: DurableStore,
		meta: Metadata,
		log: Vec<LogEntry>,
		election_timeout_range: (Duration, Duration),
		heartbeat_interval: Duration,
	) -> Self {
		let mut core = ConsensusCore {
			id,
			peers,
			store,
			meta,
			log,
			role: Role::Follower,
			leader_id: None,
			commit_index: 0,
			last_applied: 0,
			election_deadline: Instant::now(),
			election_timeout_range,
			heartbeat_interval,
			pending_ack: HashMap::new(),
			shutdown: false,
		};
		core.reset_election_timer();
		core
	}

	// --- basic accessors -------------------------------------------------------------

	pub fn current_term(&self) -> Term {
		self.meta.current_term
	}

	pub fn is_leader(&self) -> bool {
		matches!(self.role, Role::Leader(_))
	}

	pub fn leader_hint(&self) -> Option<NodeId> {
		if self.is_leader() {
			Some(self.id.clone())
		} else {
			self.leader_id.clone()
		}
	}

	pub fn commit_index(&self) -> LogIndex {
		self.commit_index
	}

	pub fn last_applied(&self) -> LogIndex {
		self.last_applied
	}

	pub fn peers(&self) -> &[NodeId] {
		&self.peers
	}

	fn last_log_index(&self) -> LogIndex {
		self.log.len() as LogIndex
	}

	fn last_log_term(&self) -> Term {
		self.log.last().map(|e| e.term).unwrap_or(0)
	}

	fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
		if index == 0 {
			None
		} else {
			self.log.get((index - 1) as usize)
		}
	}

	pub fn entry_clone_at(&self, index: LogIndex) -> Option<LogEntry> {
		self.entry_at(index).cloned()
	}

	fn term_at(&self, index: LogIndex) -> Term {
		if index == 0 {
			0
		} else {
			self.entry_at(index).map(|e| e.term).unwrap_or(0)
		}
	}

	/// Strictly more than half of the cluster, self included.
	fn majority(&self) -> usize {
		(self.peers.len() + 1) / 2 + 1
	}

	// --- election timer ----------------------------------------------------------------

	/// Recomputes `election_deadline` from a fresh random timeout. The caller (holding the
	/// core mutex) is responsible for notifying the timer thread's condvar afterwards so it
	/// re-reads the new deadline instead of sleeping past it.
	pub fn reset_election_timer(&mut self) {
		let (min, max) = self.election_timeout_range;
		let jitter_ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
		self.election_deadline = Instant::now() + Duration::from_millis(jitter_ms);
	}

	pub fn election_deadline(&self) -> Instant {
		self.election_deadline
	}

	pub fn heartbeat_interval(&self) -> Duration {
		self.heartbeat_interval
	}

	// --- persistence helpers ------------------------------------------------------------

	fn persist_meta(&self) -> Result<()> {
		self.store.persist_meta(&self.meta)
	}

	fn drain_pending_ack_as_leadership_lost(&mut self) {
		for (_, tx) in self.pending_ack.drain() {
			let _ = tx.send(PendingOutcome::LeadershipLost);
		}
	}

	// --- role transitions ----------------------------------------------------------------

	/// Run on every incoming RPC/reply that carries a term. Returns whether we stepped down.
	fn observe_term(&mut self, term: Term) -> Result<bool> {
		if term > self.meta.current_term {
			self.meta.current_term = term;
			self.meta.voted_for = None;
			self.persist_meta()?;
			self.become_follower();
			Ok(true)
		} else {
			Ok(false)
		}
	}

	fn become_follower(&mut self) {
		if self.is_leader() {
			info!("[{}] stepping down from leader in term {}", self.id, self.meta.current_term);
		}
		self.drain_pending_ack_as_leadership_lost();
		self.role = Role::Follower;
		self.reset_election_timer();
	}

	/// Appends a no-op entry in the new term before anything else. Without an entry of its
	/// own, a leader can never advance its commit index past entries from earlier terms
	/// (`try_advance_commit_index` only counts a term matching `current_term`) until some
	/// client happens to propose something. This closes that gap unconditionally.
	fn become_leader(&mut self) -> Result<()> {
		let term = self.meta.current_term;
		let index = self.last_log_index() + 1;
		let entry = LogEntry { index, term, data: LogEntryData::Noop };
		self.log.push(entry.clone());
		self.store.append(&[entry])?;

		let mut next_index = HashMap::new();
		let mut match_index = HashMap::new();
		for peer in &self.peers {
			next_index.insert(peer.clone(), index + 1);
			match_index.insert(peer.clone(), 0);
		}

		self.role = Role::Leader(LeaderState { next_index, match_index });
		self.leader_id = Some(self.id.clone());
		info!("[{}] became leader for term {}", self.id, term);

		self.try_advance_commit_index();
		Ok(())
	}

	// --- election ---------------------------------------------------------------------

	/// Called by the election timer thread when it observes the deadline has passed while
	/// still Follower/Candidate. Bumps the term, votes for self, and returns the RequestVote
	/// calls to fan out. A single-node cluster wins its own election immediately.
	pub fn start_election(&mut self) -> Result<Vec<OutboundRpc>> {
		self.meta.current_term += 1;
		self.meta.voted_for = Some(self.id.clone());
		self.persist_meta()?;

		let mut votes_received = HashSet::with_capacity(1);
		votes_received.insert(self.id.clone());
		self.role = Role::Candidate(CandidateState { votes_received });
		self.reset_election_timer();

		info!("[{}] starting election for term {}", self.id, self.meta.current_term);

		if self.majority() <= 1 {
			self.become_leader()?;
			return Ok(Vec::new());
		}

		let req = RequestVoteRequest {
			term: self.meta.current_term,
			candidate_id: self.id.clone(),
			last_log_index: self.last_log_index(),
			last_log_term: self.last_log_term(),
		};

		Ok(self
			.peers
			.iter()
			.map(|p| OutboundRpc::RequestVote { to: p.clone(), req: req.clone() })
			.collect())
	}

	/// Receiver side of RequestVote.
	pub fn handle_request_vote(&mut self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
		self.observe_term(req.term)?;

		if req.term < self.meta.current_term {
			return Ok(RequestVoteResponse { term: self.meta.current_term, vote_granted: false });
		}

		let up_to_date = req.last_log_term > self.last_log_term()
			|| (req.last_log_term == self.last_log_term() && req.last_log_index >= self.last_log_index());

		let already_voted_for_other = match &self.meta.voted_for {
			Some(id) => *id != req.candidate_id,
			None => false,
		};

		let granted = up_to_date && !already_voted_for_other;

		if granted {
			self.meta.voted_for = Some(req.candidate_id.clone());
			self.persist_meta()?;
			self.leader_id = None; // don't know who will win yet
			self.reset_election_timer();
			info!("[{}] granted vote to {} for term {}", self.id, req.candidate_id, self.meta.current_term);
		}

		Ok(RequestVoteResponse { term: self.meta.current_term, vote_granted: granted })
	}

	/// Handles a RequestVote reply. Returns the AppendEntries heartbeats to send immediately
	/// if this reply made us the leader.
	pub fn handle_request_vote_reply(&mut self, from: NodeId, resp: RequestVoteResponse) -> Result<Vec<OutboundRpc>> {
		if self.observe_term(resp.term)? {
			return Ok(Vec::new());
		}
		if resp.term != self.meta.current_term {
			return Ok(Vec::new());
		}

		let became_leader = if let Role::Candidate(ref mut s) = self.role {
			if resp.vote_granted {
				s.votes_received.insert(from);
			}
			s.votes_received.len() >= self.majority()
		} else {
			false
		};

		if became_leader {
			self.become_leader()?;
			return Ok(self.heartbeat_messages_for_all_peers());
		}

		Ok(Vec::new())
	}

	// --- replication (leader side) ------------------------------------------------------

	/// Builds the AppendEntries (or heartbeat, if the peer is already caught up) request a
	/// peer's replication worker should send right now. `None` if this node is not leader.
	pub fn build_append_entries_for(&self, peer: &NodeId) -> Option<OutboundRpc> {
		let state = match &self.role {
			Role::Leader(s) => s,
			_ => return None,
		};

		let next_index = *state.next_index.get(peer).unwrap_or(&(self.last_log_index() + 1));
		let prev_log_index = next_index.saturating_sub(1);
		let prev_log_term = self.term_at(prev_log_index);

		let entries: Vec<LogEntry> = (next_index..=self.last_log_index()).filter_map(|i| self.entry_at(i).cloned()).collect();

		let req = AppendEntriesRequest {
			term: self.meta.current_term,
			leader_id: self.id.clone(),
			prev_log_index,
			prev_log_term,
			entries: entries.clone(),
			leader_commit: self.commit_index,
		};

		Some(OutboundRpc::AppendEntries {
			to: peer.clone(),
			req,
			sent_prev_index: prev_log_index,
			sent_count: entries.len(),
		})
	}

	fn heartbeat_messages_for_all_peers(&self) -> Vec<OutboundRpc> {
		self.peers.iter().filter_map(|p| self.build_append_entries_for(p)).collect()
	}

	/// Receiver side of AppendEntries.
	pub fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
		self.observe_term(req.term)?;
		let current_term = self.meta.current_term;

		if req.term < current_term {
			return Ok(AppendEntriesResponse { term: current_term, success: false, conflict_index: 0, conflict_term: 0 });
		}

		// A candidate that sees a valid leader in the current term steps down.
		if matches!(self.role, Role::Candidate(_)) {
			self.role = Role::Follower;
		}

		self.leader_id = Some(req.leader_id.clone());
		self.reset_election_timer();

		if req.prev_log_index > 0 {
			match self.entry_at(req.prev_log_index) {
				None => {
					return Ok(AppendEntriesResponse {
						term: current_term,
						success: false,
						conflict_index: self.last_log_index() + 1,
						conflict_term: 0,
					});
				}
				Some(entry) if entry.term != req.prev_log_term => {
					let conflict_term = entry.term;
					let conflict_index = self.first_index_with_term(conflict_term).unwrap_or(req.prev_log_index);
					return Ok(AppendEntriesResponse { term: current_term, success: false, conflict_index, conflict_term });
				}
				_ => {}
			}
		}

		// Merge new entries: truncate at the first divergence, then append the rest.
		let mut divergence: Option<LogIndex> = None;
		for (k, entry) in req.entries.iter().enumerate() {
			let index = req.prev_log_index + 1 + k as LogIndex;
			match self.entry_at(index) {
				Some(existing) if existing.term == entry.term => continue,
				_ => {
					divergence = Some(index);
					break;
				}
			}
		}

		if let Some(from) = divergence {
			self.log.truncate((from - 1) as usize);
			let start = (from - req.prev_log_index - 1) as usize;
			self.log.extend_from_slice(&req.entries[start..]);
			self.store.rewrite_log(&self.log)?;
		}

		let last_new_index = req.prev_log_index + req.entries.len() as LogIndex;
		if req.leader_commit > self.commit_index {
			self.commit_index = std::cmp::min(req.leader_commit, last_new_index);
		}

		Ok(AppendEntriesResponse { term: current_term, success: true, conflict_index: 0, conflict_term: 0 })
	}

	fn first_index_with_term(&self, term: Term) -> Option<LogIndex> {
		self.log.iter().find(|e| e.term == term).map(|e| e.index)
	}

	fn last_index_with_term_or_before(&self, term: Term) -> Option<LogIndex> {
		self.log.iter().rev().find(|e| e.term <= term).map(|e| e.index)
	}

	/// Handles a peer's AppendEntries reply (success or conflict), updating
	/// `nextIndex`/`matchIndex` and attempting commit-index advancement. Returns the follow-up
	/// request to retry immediately on a conflict (accelerated backoff), if any.
	pub fn handle_append_entries_reply(
		&mut self,
		peer: NodeId,
		sent_prev_index: LogIndex,
		sent_count: usize,
		resp: AppendEntriesResponse,
	) -> Result<Option<OutboundRpc>> {
		if self.observe_term(resp.term)? {
			return Ok(None);
		}

		if resp.success {
			if let Role::Leader(ref mut s) = self.role {
				let new_match = sent_prev_index + sent_count as LogIndex;
				let cur = *s.match_index.get(&peer).unwrap_or(&0);
				if new_match > cur {
					s.match_index.insert(peer.clone(), new_match);
					s.next_index.insert(peer.clone(), new_match + 1);
				}
			} else {
				return Ok(None);
			}
			self.try_advance_commit_index();
			Ok(None)
		} else {
			let next = match &self.role {
				Role::Leader(s) => {
					let fallback = if resp.conflict_term > 0 {
						self.last_index_with_term_or_before(resp.conflict_term)
							.map(|i| if self.term_at(i) == resp.conflict_term { i + 1 } else { resp.conflict_index })
							.unwrap_or(resp.conflict_index)
					} else {
						resp.conflict_index
					};
					let cur = *s.next_index.get(&peer).unwrap_or(&1);
					std::cmp::max(1, std::cmp::min(fallback, cur.saturating_sub(1).max(1)))
				}
				_ => return Ok(None),
			};
			if let Role::Leader(ref mut s) = self.role {
				s.next_index.insert(peer.clone(), next);
			}
			Ok(self.build_append_entries_for(&peer))
		}
	}

	/// Scans candidate indices `commitIndex+1..=len(log)` for the largest one that both has a
	/// majority of matchIndex values `>=` it and belongs to the current term.
	fn try_advance_commit_index(&mut self) {
		let (match_index, last_index) = match &self.role {
			Role::Leader(s) => (s.match_index.clone(), self.last_log_index()),
			_ => return,
		};

		let majority = self.majority();
		let mut new_commit = self.commit_index;

		for n in (self.commit_index + 1)..=last_index {
			if self.term_at(n) != self.meta.current_term {
				continue;
			}
			let count = 1 + match_index.values().filter(|v| **v >= n).count();
			if count >= majority {
				new_commit = n;
			}
		}

		if new_commit > self.commit_index {
			self.commit_index = new_commit;
		}
	}

	// --- apply loop support --------------------------------------------------------------

	pub fn has_unapplied_entries(&self) -> bool {
		self.last_applied < self.commit_index
	}

	/// Advances `last_applied` by one and returns the entry now owed to the state machine.
	pub fn take_next_to_apply(&mut self) -> Option<LogEntry> {
		if self.last_applied >= self.commit_index {
			return None;
		}
		let next = self.last_applied + 1;
		self.last_applied = next;
		self.entry_at(next).cloned()
	}

	pub fn resolve_pending(&mut self, index: LogIndex, outcome: ApplyOutcome) {
		if let Some(tx) = self.pending_ack.remove(&index) {
			let _ = tx.send(PendingOutcome::Applied(outcome));
		}
	}

	// --- client-facing proposals ---------------------------------------------------------

	/// Appends a new command at the tail of the leader's log and registers a completion
	/// channel for it. Fails with `NotLeader` if this node isn't currently leader.
	pub fn propose(&mut self, data: LogEntryData) -> Result<(LogIndex, mpsc::Receiver<PendingOutcome>)> {
		if self.shutdown {
			return Err(ErrorKind::Shutdown.into());
		}
		if !self.is_leader() {
			return Err(ErrorKind::NotLeader(self.leader_hint()).into());
		}

		let index = self.last_log_index() + 1;
		let term = self.meta.current_term;
		let entry = LogEntry { index, term, data };

		self.log.push(entry.clone());
		self.store.append(&[entry])?;

		let (tx, rx) = mpsc::channel();
		self.pending_ack.insert(index, tx);

		// A lone leader can commit immediately: no peers to wait on.
		self.try_advance_commit_index();

		Ok((index, rx))
	}

	pub fn mark_shutdown(&mut self) {
		self.shutdown = true;
		self.drain_pending_ack_as_leadership_lost();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::LogEntryData;

	fn new_core(id: &str, peers: &[&str]) -> ConsensusCore {
		let dir = std::env::temp_dir().join(format!(
			"raft-consensus-test-{}-{}-{}",
			id,
			std::process::id(),
			id.len() * 7919 + peers.len()
		));
		let _ = std::fs::remove_dir_all(&dir);
		let (store, meta, log) = DurableStore::open(&dir).unwrap();
		ConsensusCore::new(
			id.into(),
			peers.iter().map(|s| s.to_string()).collect(),
			store,
			meta,
			log,
			(Duration::from_millis(150), Duration::from_millis(300)),
			Duration::from_millis(50),
		)
	}

	#[test]
	fn single_node_cluster_becomes_leader_immediately() {
		let mut core = new_core("a", &[]);
		let msgs = core.start_election().unwrap();
		assert!(msgs.is_empty());
		assert!(core.is_leader());
		assert_eq!(core.current_term(), 1);
	}

	#[test]
	fn propose_on_lone_leader_commits_on_append() {
		let mut core = new_core("a1", &[]);
		core.start_election().unwrap();
		// Index 1 is the no-op accession entry become_leader appended and already committed.
		assert_eq!(core.commit_index(), 1);

		let (index, _rx) = core.propose(LogEntryData::Command(vec![1])).unwrap();
		assert_eq!(index, 2);
		assert_eq!(core.commit_index(), 2);
	}

	#[test]
	fn propose_on_follower_fails_not_leader() {
		let mut core = new_core("a2", &["b", "c"]);
		let err = core.propose(LogEntryData::Noop).unwrap_err();
		assert!(matches!(err.kind(), ErrorKind::NotLeader(_)));
	}

	#[test]
	fn two_node_cluster_with_one_peer_needs_its_vote() {
		let mut core = new_core("a3", &["b"]);
		let msgs = core.start_election().unwrap();
		assert_eq!(msgs.len(), 1);
		assert!(!core.is_leader());

		let became_leader_msgs = core
			.handle_request_vote_reply("b".into(), RequestVoteResponse { term: 1, vote_granted: true })
			.unwrap();
		assert!(core.is_leader());
		assert_eq!(became_leader_msgs.len(), 1);
	}

	#[test]
	fn becoming_leader_does_not_commit_without_a_quorum_ack() {
		// Two peers: a real majority needs one peer's ack, not just the leader's own copy of
		// the no-op it just appended.
		let mut core = new_core("a3b", &["b", "c"]);
		core.start_election().unwrap();
		core.handle_request_vote_reply("b".into(), RequestVoteResponse { term: 1, vote_granted: true }).unwrap();
		core.handle_request_vote_reply("c".into(), RequestVoteResponse { term: 1, vote_granted: true }).unwrap();
		assert!(core.is_leader());
		assert_eq!(core.commit_index(), 0, "no-op is appended locally but not yet replicated to a quorum");

		let retry = core
			.handle_append_entries_reply(
				"b".into(),
				0,
				1,
				AppendEntriesResponse { term: 1, success: true, conflict_index: 0, conflict_term: 0 },
			)
			.unwrap();
		assert!(retry.is_none());
		assert_eq!(core.commit_index(), 1, "leader + one peer ack is a quorum of three");
	}

	#[test]
	fn stepping_down_resolves_pending_proposals_as_leadership_lost() {
		let mut core = new_core("a3c", &["b"]);
		core.start_election().unwrap();
		core.handle_request_vote_reply("b".into(), RequestVoteResponse { term: 1, vote_granted: true }).unwrap();
		assert!(core.is_leader());

		let (_index, rx) = core.propose(LogEntryData::Command(vec![9])).unwrap();

		// A higher-term AppendEntries from a newer leader forces a step-down before this
		// proposal was ever replicated to "b".
		core.handle_append_entries(AppendEntriesRequest {
			term: 2,
			leader_id: "b".into(),
			prev_log_index: core.last_log_index(),
			prev_log_term: core.last_log_term(),
			entries: vec![],
			leader_commit: 0,
		})
		.unwrap();

		assert!(!core.is_leader());
		match rx.try_recv() {
			Ok(PendingOutcome::LeadershipLost) => {}
			Ok(PendingOutcome::Applied(_)) => panic!("expected LeadershipLost, got Applied"),
			Err(e) => panic!("expected LeadershipLost, channel empty/closed: {}", e),
		}
	}

	#[test]
	fn higher_term_reply_steps_down_candidate() {
		let mut core = new_core("a4", &["b", "c"]);
		core.start_election().unwrap();
		core.handle_request_vote_reply("b".into(), RequestVoteResponse { term: 5, vote_granted: false }).unwrap();
		assert!(!core.is_leader());
		assert_eq!(core.current_term(), 5);
	}

	#[test]
	fn vote_denied_for_stale_log() {
		let mut core = new_core("a5", &["b"]);
		core.start_election().unwrap();
		core.propose(LogEntryData::Noop).ok();

		let resp = core
			.handle_request_vote(RequestVoteRequest { term: 2, candidate_id: "b".into(), last_log_index: 0, last_log_term: 0 })
			.unwrap();
		assert!(!resp.vote_granted);
	}

	#[test]
	fn append_entries_consistency_check_rejects_gap() {
		let mut core = new_core("a6", &["leader"]);
		let resp = core
			.handle_append_entries(AppendEntriesRequest {
				term: 1,
				leader_id: "leader".into(),
				prev_log_index: 5,
				prev_log_term: 1,
				entries: vec![],
				leader_commit: 0,
			})
			.unwrap();
		assert!(!resp.success);
		assert_eq!(resp.conflict_index, 1);
	}

	#[test]
	fn append_entries_empty_log_accepts_prev_index_zero() {
		let mut core = new_core("a7", &["leader"]);
		let resp = core
			.handle_append_entries(AppendEntriesRequest {
				term: 1,
				leader_id: "leader".into(),
				prev_log_index: 0,
				prev_log_term: 0,
				entries: vec![LogEntry { index: 1, term: 1, data: LogEntryData::Noop }],
				leader_commit: 1,
			})
			.unwrap();
		assert!(resp.success);
		assert_eq!(core.commit_index(), 1);
	}
}
