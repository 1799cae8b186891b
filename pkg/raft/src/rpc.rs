//! Wire types and the `Transport` abstraction.
//!
//! The protocol is connectionless at this layer: every RPC is a single request/response
//! exchange over its own TCP connection, bounded by a caller-supplied deadline. A dead or
//! slow peer surfaces as `ErrorKind::Unreachable`, never as an indefinite block.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::errors::*;
use crate::types::{LogEntry, LogIndex, NodeId, Term};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
	pub term: Term,
	pub candidate_id: NodeId,
	pub last_log_index: LogIndex,
	pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
	pub term: Term,
	pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
	pub term: Term,
	pub leader_id: NodeId,
	pub prev_log_index: LogIndex,
	pub prev_log_term: Term,
	pub entries: Vec<LogEntry>,
	pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
	pub term: Term,
	pub success: bool,
	/// Only meaningful when `success == false`. `0` means "log too short / no conflicting term".
	pub conflict_index: LogIndex,
	pub conflict_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
	pub command: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeResponse {
	pub accepted: bool,
	pub leader_hint: Option<NodeId>,
	/// `Some` iff `accepted` and the entry committed and applied before the deadline.
	pub apply_result: Option<Result<(), String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoIsLeaderResponse {
	pub leader_id: Option<NodeId>,
	pub term: Term,
}

/// Default deadlines for the timer-sensitive RPCs.
pub const VOTE_DEADLINE: Duration = Duration::from_millis(100);
pub const HEARTBEAT_DEADLINE: Duration = Duration::from_millis(100);
pub const PROPOSE_DEADLINE: Duration = Duration::from_secs(1);

/// Outbound RPC calls made by a node to its peers.
pub trait Transport: Send + Sync {
	fn request_vote(&self, peer: &NodeId, req: RequestVoteRequest, deadline: Duration) -> Result<RequestVoteResponse>;
	fn append_entries(&self, peer: &NodeId, req: AppendEntriesRequest, deadline: Duration) -> Result<AppendEntriesResponse>;
	fn propose(&self, peer: &NodeId, req: ProposeRequest, deadline: Duration) -> Result<ProposeResponse>;
	fn who_is_leader(&self, peer: &NodeId, deadline: Duration) -> Result<WhoIsLeaderResponse>;
}

/// Inbound RPC handling. Implemented by `crate::node::Node`; a `Transport`'s listener
/// dispatches each received request into one of these methods on its own worker thread.
pub trait RpcServer: Send + Sync {
	fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse;
	fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse;
	fn handle_propose(&self, req: ProposeRequest) -> ProposeResponse;
	fn handle_who_is_leader(&self) -> WhoIsLeaderResponse;
}

#[derive(Serialize, Deserialize)]
enum RequestEnvelope {
	RequestVote(RequestVoteRequest),
	AppendEntries(AppendEntriesRequest),
	Propose(ProposeRequest),
	WhoIsLeader,
}

#[derive(Serialize, Deserialize)]
enum ResponseEnvelope {
	RequestVote(RequestVoteResponse),
	AppendEntries(AppendEntriesResponse),
	Propose(ProposeResponse),
	WhoIsLeader(WhoIsLeaderResponse),
}

fn write_frame<W: Write>(w: &mut W, bytes: &[u8]) -> std::io::Result<()> {
	w.write_all(&(bytes.len() as u32).to_be_bytes())?;
	w.write_all(bytes)?;
	w.flush()
}

fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Vec<u8>> {
	let mut len_buf = [0u8; 4];
	r.read_exact(&mut len_buf)?;
	let len = u32::from_be_bytes(len_buf) as usize;
	let mut buf = vec![0u8; len];
	r.read_exact(&mut buf)?;
	Ok(buf)
}

/// A length-prefixed-JSON-over-TCP `Transport`. Each RPC opens, writes, reads, and closes
/// its own connection, so a deadline is just a read/write timeout on that one socket.
pub struct TcpTransport {
	addresses: HashMap<NodeId, String>,
}

impl TcpTransport {
	pub fn new(addresses: HashMap<NodeId, String>) -> Self {
		TcpTransport { addresses }
	}

	fn call(&self, peer: &NodeId, req: RequestEnvelope, deadline: Duration) -> Result<ResponseEnvelope> {
		let addr = self
			.addresses
			.get(peer)
			.ok_or_else(|| Error::from(ErrorKind::Unreachable(peer.clone())))?;

		let socket_addr = addr
			.to_socket_addrs()
			.map_err(|_| Error::from(ErrorKind::Unreachable(peer.clone())))?
			.next()
			.ok_or_else(|| Error::from(ErrorKind::Unreachable(peer.clone())))?;

		let mut stream = TcpStream::connect_timeout(&socket_addr, deadline)
			.map_err(|_| Error::from(ErrorKind::Unreachable(peer.clone())))?;
		stream.set_read_timeout(Some(deadline)).ok();
		stream.set_write_timeout(Some(deadline)).ok();

		let body = serde_json::to_vec(&req)?;
		write_frame(&mut stream, &body).map_err(|_| Error::from(ErrorKind::Unreachable(peer.clone())))?;

		let resp_body = read_frame(&mut stream).map_err(|_| Error::from(ErrorKind::Unreachable(peer.clone())))?;
		let resp: ResponseEnvelope = serde_json::from_slice(&resp_body)?;
		Ok(resp)
	}

	/// Binds `addr` and serves incoming RPCs by dispatching into `handler`, one thread per
	/// connection, until the process exits. Intended to be spawned on a dedicated thread.
	pub fn serve(addr: &str, handler: Arc<dyn RpcServer>) -> std::io::Result<()> {
		let listener = TcpListener::bind(addr)?;
		for stream in listener.incoming() {
			let stream = match stream {
				Ok(s) => s,
				Err(e) => {
					warn!("accept failed: {}", e);
					continue;
				}
			};
			let handler = handler.clone();
			std::thread::spawn(move || {
				if let Err(e) = Self::handle_connection(stream, handler) {
					debug!("rpc connection ended with error: {}", e);
				}
			});
		}
		Ok(())
	}

	fn handle_connection(mut stream: TcpStream, handler: Arc<dyn RpcServer>) -> std::io::Result<()> {
		let body = read_frame(&mut stream)?;
		let req: RequestEnvelope =
			serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

		let resp = match req {
			RequestEnvelope::RequestVote(r) => ResponseEnvelope::RequestVote(handler.handle_request_vote(r)),
			RequestEnvelope::AppendEntries(r) => ResponseEnvelope::AppendEntries(handler.handle_append_entries(r)),
			RequestEnvelope::Propose(r) => ResponseEnvelope::Propose(handler.handle_propose(r)),
			RequestEnvelope::WhoIsLeader => ResponseEnvelope::WhoIsLeader(handler.handle_who_is_leader()),
		};

		let resp_body = serde_json::to_vec(&resp).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
		write_frame(&mut stream, &resp_body)
	}
}

impl Transport for TcpTransport {
	fn request_vote(&self, peer: &NodeId, req: RequestVoteRequest, deadline: Duration) -> Result<RequestVoteResponse> {
		match self.call(peer, RequestEnvelope::RequestVote(req), deadline)? {
			ResponseEnvelope::RequestVote(r) => Ok(r),
			_ => Err(ErrorKind::Unreachable(peer.clone()).into()),
		}
	}

	fn append_entries(&self, peer: &NodeId, req: AppendEntriesRequest, deadline: Duration) -> Result<AppendEntriesResponse> {
		match self.call(peer, RequestEnvelope::AppendEntries(req), deadline)? {
			ResponseEnvelope::AppendEntries(r) => Ok(r),
			_ => Err(ErrorKind::Unreachable(peer.clone()).into()),
		}
	}

	fn propose(&self, peer: &NodeId, req: ProposeRequest, deadline: Duration) -> Result<ProposeResponse> {
		match self.call(peer, RequestEnvelope::Propose(req), deadline)? {
			ResponseEnvelope::Propose(r) => Ok(r),
			_ => Err(ErrorKind::Unreachable(peer.clone()).into()),
		}
	}

	fn who_is_leader(&self, peer: &NodeId, deadline: Duration) -> Result<WhoIsLeaderResponse> {
		match self.call(peer, RequestEnvelope::WhoIsLeader, deadline)? {
			ResponseEnvelope::WhoIsLeader(r) => Ok(r),
			_ => Err(ErrorKind::Unreachable(peer.clone()).into()),
		}
	}
}

/// An in-process `Transport` that calls directly into the registered peer's `RpcServer`,
/// used by the cluster integration tests to get deterministic, network-free runs. Peers can
/// be individually cut off with `partition`/`heal` to simulate network splits.
#[derive(Clone, Default)]
pub struct ChannelTransport {
	inner: Arc<Mutex<ChannelTransportInner>>,
}

#[derive(Default)]
struct ChannelTransportInner {
	handlers: HashMap<NodeId, Arc<dyn RpcServer>>,
	partitioned: std::collections::HashSet<NodeId>,
}

impl ChannelTransport {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, id: NodeId, handler: Arc<dyn RpcServer>) {
		self.inner.lock().unwrap().handlers.insert(id, handler);
	}

	/// Returns the `Transport` a single node should use: calls are blocked in both
	/// directions whenever either `node_id` or the destination has been `partition`-ed.
	pub fn for_node(&self, node_id: NodeId) -> ChannelTransportHandle {
		ChannelTransportHandle { shared: self.clone(), node_id }
	}

	/// Makes `id` unreachable from every other node and unable to reach anyone itself,
	/// until `heal` is called.
	pub fn partition(&self, id: &NodeId) {
		self.inner.lock().unwrap().partitioned.insert(id.clone());
	}

	pub fn heal(&self, id: &NodeId) {
		self.inner.lock().unwrap().partitioned.remove(id);
	}

	fn resolve(&self, from: &NodeId, peer: &NodeId) -> Result<Arc<dyn RpcServer>> {
		let inner = self.inner.lock().unwrap();
		if inner.partitioned.contains(from) || inner.partitioned.contains(peer) {
			return Err(ErrorKind::Unreachable(peer.clone()).into());
		}
		inner
			.handlers
			.get(peer)
			.cloned()
			.ok_or_else(|| Error::from(ErrorKind::Unreachable(peer.clone())))
	}
}

/// A `Transport` bound to one node's identity, so partitioning can be checked symmetrically.
#[derive(Clone)]
pub struct ChannelTransportHandle {
	shared: ChannelTransport,
	node_id: NodeId,
}

impl Transport for ChannelTransportHandle {
	fn request_vote(&self, peer: &NodeId, req: RequestVoteRequest, _deadline: Duration) -> Result<RequestVoteResponse> {
		Ok(self.shared.resolve(&self.node_id, peer)?.handle_request_vote(req))
	}

	fn append_entries(&self, peer: &NodeId, req: AppendEntriesRequest, _deadline: Duration) -> Result<AppendEntriesResponse> {
		Ok(self.shared.resolve(&self.node_id, peer)?.handle_append_entries(req))
	}

	fn propose(&self, peer: &NodeId, req: ProposeRequest, _deadline: Duration) -> Result<ProposeResponse> {
		Ok(self.shared.resolve(&self.node_id, peer)?.handle_propose(req))
	}

	fn who_is_leader(&self, peer: &NodeId, _deadline: Duration) -> Result<WhoIsLeaderResponse> {
		Ok(self.shared.resolve(&self.node_id, peer)?.handle_who_is_leader())
	}
}
