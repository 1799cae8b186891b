//! The node driver: owns the core mutex, runs the election timer, the apply loop, and one
//! replication worker per peer, and answers both inbound RPCs and local client calls.
//!
//! Three long-lived threads per peer plus two fixed ones are spawned once at `Node::start`
//! and live for the process lifetime, rather than being spawned/joined around each election.
//! Simpler to reason about, and the only traffic they generate while idle is a periodic lock
//! acquisition.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::error;

use crate::consensus::{ConsensusCore, OutboundRpc};
use crate::errors::*;
use crate::rpc::{
	AppendEntriesRequest, AppendEntriesResponse, ProposeRequest, ProposeResponse, RequestVoteRequest, RequestVoteResponse,
	RpcServer, Transport, WhoIsLeaderResponse, HEARTBEAT_DEADLINE, VOTE_DEADLINE,
};
use crate::state_machine::StateMachine;
use crate::store::DurableStore;
use crate::types::{ApplyOutcome, LogEntry, LogEntryData, Metadata, NodeId, PendingOutcome, Term};

#[derive(Clone)]
pub struct NodeConfig {
	pub id: NodeId,
	pub peers: Vec<NodeId>,
	pub election_timeout_range: (Duration, Duration),
	pub heartbeat_interval: Duration,
}

/// Result of a blocking propose-and-wait, distinct from the outer `Result` used elsewhere:
/// every variant here is a normal, expected outcome rather than a failure to communicate.
pub enum ProposeOutcome {
	NotLeader(Option<NodeId>),
	Applied(ApplyOutcome),
	LeadershipLost,
	TimedOut,
	ShuttingDown,
}

pub struct Node {
	core: Mutex<ConsensusCore>,
	apply_cv: Condvar,
	timer_cv: Condvar,
	replicate_cv: Condvar,
	transport: Arc<dyn Transport>,
	state_machine: Arc<dyn StateMachine>,
}

impl Node {
	/// Recovers `ConsensusCore` from the supplied durable state and spawns every worker
	/// thread. The returned `Arc<Node>` is both the local handle callers propose against and
	/// the `RpcServer` a `Transport` listener should dispatch into.
	pub fn start(
		config: NodeConfig,
		store: DurableStore,
		meta: Metadata,
		log: Vec<LogEntry>,
		transport: Arc<dyn Transport>,
		state_machine: Arc<dyn StateMachine>,
	) -> Arc<Node> {
		let core = ConsensusCore::new(
			config.id.clone(),
			config.peers.clone(),
			store,
			meta,
			log,
			config.election_timeout_range,
			config.heartbeat_interval,
		);

		let node = Arc::new(Node {
			core: Mutex::new(core),
			apply_cv: Condvar::new(),
			timer_cv: Condvar::new(),
			replicate_cv: Condvar::new(),
			transport,
			state_machine,
		});

		{
			let node = Arc::clone(&node);
			thread::spawn(move || election_timer_loop(node));
		}
		{
			let node = Arc::clone(&node);
			thread::spawn(move || apply_loop(node));
		}
		for peer in config.peers {
			let node = Arc::clone(&node);
			thread::spawn(move || replication_worker(node, peer));
		}

		node
	}

	pub fn id(&self) -> NodeId {
		self.core.lock().unwrap().id.clone()
	}

	pub fn is_leader(&self) -> bool {
		self.core.lock().unwrap().is_leader()
	}

	pub fn current_leader(&self) -> Option<NodeId> {
		self.core.lock().unwrap().leader_hint()
	}

	pub fn current_term(&self) -> Term {
		self.core.lock().unwrap().current_term()
	}

	pub fn commit_index(&self) -> u64 {
		self.core.lock().unwrap().commit_index()
	}

	pub fn last_applied(&self) -> u64 {
		self.core.lock().unwrap().last_applied()
	}

	/// The entry at `index`, if any has been appended there yet. Lets a caller compare two
	/// nodes' logs entry-by-entry instead of trusting `commit_index`/`last_applied` alone.
	pub fn entry_at(&self, index: u64) -> Option<LogEntry> {
		self.core.lock().unwrap().entry_clone_at(index)
	}

	pub fn peers(&self) -> Vec<NodeId> {
		self.core.lock().unwrap().peers().to_vec()
	}

	/// Appends `command` if this node is leader, then blocks (up to `deadline`) until it
	/// commits and applies. Intended for in-process use by a server that happens to be the
	/// current leader; RPC callers go through `handle_propose` instead.
	pub fn propose(&self, command: Vec<u8>, deadline: Duration) -> ProposeOutcome {
		self.propose_and_wait(LogEntryData::Command(command), deadline)
	}

	fn propose_and_wait(&self, data: LogEntryData, deadline: Duration) -> ProposeOutcome {
		let rx = {
			let mut core = self.core.lock().unwrap();
			match core.propose(data) {
				Ok((_, rx)) => rx,
				Err(e) => {
					return match e.kind() {
						ErrorKind::Shutdown => ProposeOutcome::ShuttingDown,
						ErrorKind::NotLeader(hint) => ProposeOutcome::NotLeader(hint.clone()),
						_ => ProposeOutcome::NotLeader(None),
					};
				}
			}
		};
		self.wake_workers();

		match rx.recv_timeout(deadline) {
			Ok(PendingOutcome::Applied(outcome)) => ProposeOutcome::Applied(outcome),
			Ok(PendingOutcome::LeadershipLost) => ProposeOutcome::LeadershipLost,
			Err(_) => ProposeOutcome::TimedOut,
		}
	}

	pub fn shutdown(&self) {
		self.core.lock().unwrap().mark_shutdown();
		self.wake_workers();
	}

	fn wake_workers(&self) {
		self.apply_cv.notify_all();
		self.timer_cv.notify_all();
		self.replicate_cv.notify_all();
	}
}

impl RpcServer for Node {
	fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
		let mut core = self.core.lock().unwrap();
		let result = core.handle_request_vote(req);
		let term = core.current_term();
		drop(core);
		self.wake_workers();

		result.unwrap_or_else(|e| {
			error!("request_vote: failed to persist: {}", e);
			RequestVoteResponse { term, vote_granted: false }
		})
	}

	fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
		let mut core = self.core.lock().unwrap();
		let result = core.handle_append_entries(req);
		let term = core.current_term();
		drop(core);
		self.wake_workers();

		result.unwrap_or_else(|e| {
			error!("append_entries: failed to persist: {}", e);
			AppendEntriesResponse { term, success: false, conflict_index: 0, conflict_term: 0 }
		})
	}

	fn handle_propose(&self, req: ProposeRequest) -> ProposeResponse {
		match self.propose_and_wait(LogEntryData::Command(req.command), crate::rpc::PROPOSE_DEADLINE) {
			ProposeOutcome::NotLeader(hint) => ProposeResponse { accepted: false, leader_hint: hint, apply_result: None },
			ProposeOutcome::ShuttingDown => ProposeResponse { accepted: false, leader_hint: None, apply_result: None },
			ProposeOutcome::LeadershipLost => ProposeResponse { accepted: false, leader_hint: None, apply_result: None },
			ProposeOutcome::Applied(outcome) => ProposeResponse { accepted: true, leader_hint: None, apply_result: Some(outcome) },
			ProposeOutcome::TimedOut => ProposeResponse { accepted: true, leader_hint: None, apply_result: None },
		}
	}

	fn handle_who_is_leader(&self) -> WhoIsLeaderResponse {
		let core = self.core.lock().unwrap();
		WhoIsLeaderResponse { leader_id: core.leader_hint(), term: core.current_term() }
	}
}

/// Dispatches outbound RPCs on their own threads so the caller never blocks on the network
/// while holding (or having just released) the core mutex. Replies are fed back into the
/// core under a fresh lock acquisition once they arrive.
fn dispatch(node: &Arc<Node>, msgs: Vec<OutboundRpc>) {
	for msg in msgs {
		let node = Arc::clone(node);
		match msg {
			OutboundRpc::RequestVote { to, req } => {
				thread::spawn(move || {
					if let Ok(resp) = node.transport.request_vote(&to, req, VOTE_DEADLINE) {
						let mut core = node.core.lock().unwrap();
						let followups = core.handle_request_vote_reply(to, resp).unwrap_or_default();
						drop(core);
						node.wake_workers();
						dispatch(&node, followups);
					}
				});
			}
			OutboundRpc::AppendEntries { to, req, sent_prev_index, sent_count } => {
				thread::spawn(move || {
					if let Ok(resp) = node.transport.append_entries(&to, req, HEARTBEAT_DEADLINE) {
						let mut core = node.core.lock().unwrap();
						let retry = core.handle_append_entries_reply(to, sent_prev_index, sent_count, resp).unwrap_or(None);
						drop(core);
						node.wake_workers();
						if let Some(r) = retry {
							dispatch(&node, vec![r]);
						}
					}
				});
			}
		}
	}
}

fn election_timer_loop(node: Arc<Node>) {
	loop {
		let mut core = node.core.lock().unwrap();
		if core.shutdown {
			return;
		}

		if core.is_leader() {
			core = node.timer_cv.wait(core).unwrap();
			if core.shutdown {
				return;
			}
			drop(core);
			continue;
		}

		let now = Instant::now();
		let deadline = core.election_deadline();

		if now >= deadline {
			let msgs = match core.start_election() {
				Ok(msgs) => msgs,
				Err(e) => {
					error!("election: failed to persist new term: {}", e);
					drop(core);
					thread::sleep(Duration::from_millis(10));
					continue;
				}
			};
			drop(core);
			node.wake_workers();
			dispatch(&node, msgs);
			continue;
		}

		let (_guard, _timeout) = node.timer_cv.wait_timeout(core, deadline - now).unwrap();
	}
}

fn apply_loop(node: Arc<Node>) {
	loop {
		let entry = {
			let mut core = node.core.lock().unwrap();
			loop {
				if core.shutdown && !core.has_unapplied_entries() {
					return;
				}
				if core.has_unapplied_entries() {
					break;
				}
				core = node.apply_cv.wait(core).unwrap();
			}
			match core.take_next_to_apply() {
				Some(e) => e,
				None => continue,
			}
		};

		// The state machine call happens outside the core mutex: it must never be able to
		// block on anything that is itself waiting on a Raft operation.
		let outcome = match &entry.data {
			LogEntryData::Noop => Ok(()),
			LogEntryData::Command(cmd) => node.state_machine.apply(cmd),
		};

		let mut core = node.core.lock().unwrap();
		core.resolve_pending(entry.index, outcome);
	}
}

fn replication_worker(node: Arc<Node>, peer: NodeId) {
	loop {
		let msg = {
			let mut core = node.core.lock().unwrap();
			loop {
				if core.shutdown {
					return;
				}
				if core.is_leader() {
					break;
				}
				core = node.replicate_cv.wait_timeout(core, Duration::from_millis(50)).unwrap().0;
			}
			core.build_append_entries_for(&peer)
		};

		if let Some(OutboundRpc::AppendEntries { to, req, sent_prev_index, sent_count }) = msg {
			if let Ok(resp) = node.transport.append_entries(&to, req, HEARTBEAT_DEADLINE) {
				let mut core = node.core.lock().unwrap();
				let retry = core.handle_append_entries_reply(to, sent_prev_index, sent_count, resp).unwrap_or(None);
				drop(core);
				node.wake_workers();
				if let Some(r) = retry {
					dispatch(&node, vec![r]);
					continue;
				}
			}
		}

		let core = node.core.lock().unwrap();
		if core.shutdown {
			return;
		}
		let heartbeat = core.heartbeat_interval();
		let _ = node.replicate_cv.wait_timeout(core, heartbeat);
	}
}
