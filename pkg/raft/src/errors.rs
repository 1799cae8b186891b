use crate::types::NodeId;

error_chain! {
	foreign_links {
		Io(::std::io::Error);
		Json(::serde_json::Error);
	}

	errors {
		/// This node does not believe itself to be the leader. `leader_hint` is the best
		/// guess at who is, if any RPC has given us a clue.
		NotLeader(leader_hint: Option<NodeId>) {
			description("this node is not the current leader")
			display("not the leader{}", match leader_hint {
				Some(id) => format!(" (try {})", id),
				None => "".into(),
			})
		}

		/// A proposal was outstanding when this node stopped being leader for its term.
		LeadershipLost {
			description("leadership was lost before the proposal committed")
		}

		/// The node is shutting down; any outstanding proposals are abandoned.
		Shutdown {
			description("the node is shutting down")
		}

		/// A peer did not respond within the RPC deadline, or the connection failed outright.
		Unreachable(peer: NodeId) {
			description("peer is unreachable")
			display("peer {} is unreachable", peer)
		}

		/// The durable store could not be decoded at boot. Fatal: the process must not continue
		/// with an uncertain term/vote/log.
		CorruptState(reason: String) {
			description("durable state is corrupt")
			display("durable state is corrupt: {}", reason)
		}

		/// The state machine rejected a committed command. The command remains committed and
		/// applied (with this error recorded) on every replica; it is not rolled back.
		ApplyError(cause: String) {
			description("state machine apply failed")
			display("apply failed: {}", cause)
		}

		/// A blocking call exceeded its deadline without resolving.
		Timeout {
			description("operation timed out")
		}
	}
}
