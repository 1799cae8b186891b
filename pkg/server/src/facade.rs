//! Leader-aware client facade. Every write checks leadership, proposes a `DBCommand`,
//! and blocks for the apply result; reads go straight to the local store. Error kinds are
//! the raft crate's own (`NotLeader`, `LeadershipLost`, `Shutdown`, `ApplyError`, `Timeout`),
//! reused here rather than duplicated, since they already mean exactly what this layer needs.

use std::sync::Arc;
use std::time::Duration;

use raft::{rpc::PROPOSE_DEADLINE, Node, NodeId, ProposeOutcome};
use serde_json::json;

use crate::command::DBCommand;
use crate::db::Db;
use crate::errors::*;
use crate::repositories::{config_repo, event, group, group_event, user};
use crate::repositories::event::Event;
use crate::repositories::group::Group;
use crate::repositories::user::User;

pub struct Facade {
	node: Arc<Node>,
	db: Arc<Db>,
}

impl Facade {
	pub fn new(node: Arc<Node>, db: Arc<Db>) -> Facade {
		Facade { node, db }
	}

	pub fn is_leader(&self) -> bool {
		self.node.is_leader()
	}

	pub fn current_leader(&self) -> Option<NodeId> {
		self.node.current_leader()
	}

	fn propose(&self, cmd: DBCommand) -> Result<()> {
		self.propose_with_deadline(cmd, PROPOSE_DEADLINE)
	}

	fn propose_with_deadline(&self, cmd: DBCommand, deadline: Duration) -> Result<()> {
		let bytes = cmd.encode()?;

		match self.node.propose(bytes, deadline) {
			ProposeOutcome::Applied(Ok(())) => Ok(()),
			ProposeOutcome::Applied(Err(cause)) => Err(raft::errors::ErrorKind::ApplyError(cause).into()),
			ProposeOutcome::NotLeader(hint) => Err(raft::errors::ErrorKind::NotLeader(hint).into()),
			ProposeOutcome::LeadershipLost => Err(raft::errors::ErrorKind::LeadershipLost.into()),
			ProposeOutcome::TimedOut => Err(raft::errors::ErrorKind::Timeout.into()),
			ProposeOutcome::ShuttingDown => Err(raft::errors::ErrorKind::Shutdown.into()),
		}
	}

	// --- users ---------------------------------------------------------------------------

	pub fn create_user(&self, user: User) -> Result<()> {
		self.propose(DBCommand::new("UserRepository", "Create", serde_json::to_value(&user)?))
	}

	pub fn update_user(&self, user: User) -> Result<()> {
		self.propose(DBCommand::new("UserRepository", "Update", serde_json::to_value(&user)?))
	}

	pub fn delete_user(&self, id: &str) -> Result<()> {
		self.propose(DBCommand::new("UserRepository", "Delete", json!({ "id": id })))
	}

	pub fn get_user(&self, id: &str) -> Result<Option<User>> {
		let conn = self.db.conn.lock().map_err(|_| Error::from("database connection poisoned"))?;
		user::get(&conn, id)
	}

	pub fn list_users(&self) -> Result<Vec<User>> {
		let conn = self.db.conn.lock().map_err(|_| Error::from("database connection poisoned"))?;
		user::list(&conn)
	}

	// --- events --------------------------------------------------------------------------

	pub fn create_event(&self, event: Event) -> Result<()> {
		self.propose(DBCommand::new("EventRepository", "Create", serde_json::to_value(&event)?))
	}

	pub fn update_event(&self, event: Event) -> Result<()> {
		self.propose(DBCommand::new("EventRepository", "Update", serde_json::to_value(&event)?))
	}

	pub fn delete_event(&self, id: &str) -> Result<()> {
		self.propose(DBCommand::new("EventRepository", "Delete", json!({ "id": id })))
	}

	pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
		let conn = self.db.conn.lock().map_err(|_| Error::from("database connection poisoned"))?;
		event::get(&conn, id)
	}

	// --- groups --------------------------------------------------------------------------

	pub fn create_group(&self, group: Group) -> Result<()> {
		self.propose(DBCommand::new("GroupRepository", "Create", serde_json::to_value(&group)?))
	}

	pub fn delete_group(&self, id: &str) -> Result<()> {
		self.propose(DBCommand::new("GroupRepository", "Delete", json!({ "id": id })))
	}

	pub fn get_group(&self, id: &str) -> Result<Option<Group>> {
		let conn = self.db.conn.lock().map_err(|_| Error::from("database connection poisoned"))?;
		group::get(&conn, id)
	}

	// --- group membership ------------------------------------------------------------------

	pub fn add_event_to_group(&self, group_id: &str, event_id: &str) -> Result<()> {
		self.propose(DBCommand::new("GroupEventRepository", "Create", json!({ "group_id": group_id, "event_id": event_id })))
	}

	pub fn remove_event_from_group(&self, group_id: &str, event_id: &str) -> Result<()> {
		self.propose(DBCommand::new("GroupEventRepository", "Delete", json!({ "group_id": group_id, "event_id": event_id })))
	}

	pub fn list_events_for_group(&self, group_id: &str) -> Result<Vec<String>> {
		let conn = self.db.conn.lock().map_err(|_| Error::from("database connection poisoned"))?;
		group_event::list_events_for_group(&conn, group_id)
	}

	// --- config --------------------------------------------------------------------------

	pub fn set_config(&self, name: &str, value: &str) -> Result<()> {
		match self.get_config(name)? {
			Some(_) => self.propose(DBCommand::new("ConfigRepository", "Update", json!({ "name": name, "value": value }))),
			None => self.propose(DBCommand::new("ConfigRepository", "Create", json!({ "name": name, "value": value }))),
		}
	}

	pub fn get_config(&self, name: &str) -> Result<Option<String>> {
		let conn = self.db.conn.lock().map_err(|_| Error::from("database connection poisoned"))?;
		config_repo::get_by_name(&conn, name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use raft::{ChannelTransport, DurableStore, NodeConfig};

	fn single_node_facade(label: &str) -> Facade {
		let dir = std::env::temp_dir().join(format!("raftd-facade-test-{}-{}", label, std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		let (store, meta, log) = DurableStore::open(&dir).unwrap();

		let db = Arc::new(Db::open_in_memory().unwrap());
		let router = Arc::new(crate::state_machine::Router::new(db.clone()));

		let transport = ChannelTransport::new();
		let config = NodeConfig {
			id: "solo".into(),
			peers: Vec::new(),
			election_timeout_range: (Duration::from_millis(30), Duration::from_millis(60)),
			heartbeat_interval: Duration::from_millis(20),
		};

		let node = Node::start(config, store, meta, log, Arc::new(transport.for_node("solo".into())), router);
		transport.register("solo".into(), node.clone());

		Facade::new(node, db)
	}

	#[test]
	fn create_user_commits_and_is_readable() {
		let facade = single_node_facade("users");
		let deadline = std::time::Instant::now() + Duration::from_secs(2);
		while !facade.is_leader() && std::time::Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(5));
		}

		facade
			.create_user(User { id: "u1".into(), name: "Ada".into(), email: "ada@example.com".into(), created_at: Utc::now() })
			.unwrap();

		assert_eq!(facade.get_user("u1").unwrap().map(|u| u.name), Some("Ada".into()));
	}

	#[test]
	fn set_config_creates_then_updates() {
		let facade = single_node_facade("config");
		let deadline = std::time::Instant::now() + Duration::from_secs(2);
		while !facade.is_leader() && std::time::Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(5));
		}

		facade.set_config("redis_primary", "10.0.0.1:6379").unwrap();
		assert_eq!(facade.get_config("redis_primary").unwrap(), Some("10.0.0.1:6379".into()));

		facade.set_config("redis_primary", "10.0.0.2:6379").unwrap();
		assert_eq!(facade.get_config("redis_primary").unwrap(), Some("10.0.0.2:6379".into()));
	}
}
