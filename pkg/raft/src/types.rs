/// Identifies a single server. Stable across restarts; assigned out of band (config file).
pub type NodeId = String;

pub type Term = u64;

/// 1-indexed position in the log. Index 0 is the sentinel "nothing has ever been appended" entry.
pub type LogIndex = u64;

/// Persistent per-node state: everything that must survive a crash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
	pub current_term: Term,
	pub voted_for: Option<NodeId>,
}

impl Default for Metadata {
	fn default() -> Self {
		Metadata { current_term: 0, voted_for: None }
	}
}

/// The payload carried by a single log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogEntryData {
	/// Occupies a log index without any state machine effect. Used by a new leader to
	/// commit an entry from a previous term before it can safely advance its commit index.
	Noop,

	/// Opaque bytes interpreted only by the state machine (see `StateMachine::apply`).
	Command(Vec<u8>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
	pub index: LogIndex,
	pub term: Term,
	pub data: LogEntryData,
}

/// Outcome of applying a single committed command to the local state machine.
/// Distinct from the outer `Result` returned by `propose`/`Node` calls: a leadership
/// or transport failure means the caller doesn't know the outcome, while `ApplyOutcome`
/// means the entry *did* commit and apply, successfully or not.
pub type ApplyOutcome = Result<(), String>;

/// What a pending proposal's completion channel is resolved with. Kept distinct from
/// `ApplyOutcome` so a waiter can tell "the command ran, successfully or not" apart from
/// "this node stopped being leader before we found out".
pub enum PendingOutcome {
	Applied(ApplyOutcome),
	LeadershipLost,
}
