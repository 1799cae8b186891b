//! The repository router: decodes a committed `DBCommand` and dispatches it to the matching
//! table module, all inside one SQLite transaction so a failing command never leaves partial
//! writes behind. Registered once at boot and never mutated afterward.

use std::sync::Arc;

use raft::{ApplyOutcome, StateMachine};

use crate::command::DBCommand;
use crate::db::Db;
use crate::errors::ErrorKind;
use crate::repositories::{config_repo, event, group, group_event, user};

pub struct Router {
	db: Arc<Db>,
}

impl Router {
	pub fn new(db: Arc<Db>) -> Router {
		Router { db }
	}
}

impl StateMachine for Router {
	fn apply(&self, command: &[u8]) -> ApplyOutcome {
		let cmd = DBCommand::decode(command).map_err(|e| format!("malformed command: {}", e))?;

		let mut conn = self.db.conn.lock().map_err(|_| "database connection poisoned".to_string())?;
		let tx = conn.transaction().map_err(|e| format!("failed to start transaction: {}", e))?;

		let result = match cmd.repository.as_str() {
			"UserRepository" => user::apply(&tx, &cmd.method, &cmd.payload),
			"EventRepository" => event::apply(&tx, &cmd.method, &cmd.payload),
			"GroupRepository" => group::apply(&tx, &cmd.method, &cmd.payload),
			"GroupEventRepository" => group_event::apply(&tx, &cmd.method, &cmd.payload),
			"ConfigRepository" => config_repo::apply(&tx, &cmd.method, &cmd.payload),
			other => Err(ErrorKind::UnknownRepository(other.into()).into()),
		};

		match result {
			Ok(()) => tx.commit().map_err(|e| format!("commit failed: {}", e)),
			Err(e) => {
				let _ = tx.rollback();
				Err(e.to_string())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::command::DBCommand;
	use serde_json::json;

	#[test]
	fn dispatches_to_the_named_repository() {
		let router = Router::new(Arc::new(Db::open_in_memory().unwrap()));
		let cmd = DBCommand::new(
			"ConfigRepository",
			"Create",
			json!({"name": "redis_primary", "value": "10.0.0.1:6379"}),
		);

		router.apply(&cmd.encode().unwrap()).unwrap();

		let conn = router.db.conn.lock().unwrap();
		assert_eq!(config_repo::get_by_name(&conn, "redis_primary").unwrap(), Some("10.0.0.1:6379".into()));
	}

	#[test]
	fn unknown_repository_fails_without_partial_writes() {
		let router = Router::new(Arc::new(Db::open_in_memory().unwrap()));
		let cmd = DBCommand::new("NotARepository", "Create", json!({}));
		assert!(router.apply(&cmd.encode().unwrap()).is_err());
	}

	#[test]
	fn malformed_command_bytes_fail_cleanly() {
		let router = Router::new(Arc::new(Db::open_in_memory().unwrap()));
		assert!(router.apply(b"not json").is_err());
	}
}
