//! Embedded SQLite store. Schema creation is idempotent `CREATE TABLE IF NOT EXISTS` run once
//! at boot. NOTE: there is no migration framework here, deliberately; see the repository
//! layer's doc comments for why that's out of scope.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::errors::*;

pub struct Db {
	pub(crate) conn: Mutex<Connection>,
}

impl Db {
	pub fn open(dir: &Path) -> Result<Db> {
		std::fs::create_dir_all(dir)?;
		let conn = Connection::open(dir.join("data.sqlite3"))?;
		conn.execute_batch(SCHEMA)?;
		Ok(Db { conn: Mutex::new(conn) })
	}

	pub fn open_in_memory() -> Result<Db> {
		let conn = Connection::open_in_memory()?;
		conn.execute_batch(SCHEMA)?;
		Ok(Db { conn: Mutex::new(conn) })
	}
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
	id TEXT PRIMARY KEY,
	name TEXT NOT NULL,
	email TEXT NOT NULL,
	created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
	id TEXT PRIMARY KEY,
	name TEXT NOT NULL,
	starts_at TEXT NOT NULL,
	location TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS groups (
	id TEXT PRIMARY KEY,
	name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_events (
	group_id TEXT NOT NULL,
	event_id TEXT NOT NULL,
	PRIMARY KEY (group_id, event_id)
);

CREATE TABLE IF NOT EXISTS config (
	name TEXT PRIMARY KEY,
	value TEXT NOT NULL
);
";

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn opening_twice_is_idempotent() {
		let dir = std::env::temp_dir().join(format!("raftd-db-test-{}", std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		Db::open(&dir).unwrap();
		Db::open(&dir).unwrap();
		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn in_memory_has_all_tables() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();
		for table in ["users", "events", "groups", "group_events", "config"] {
			let count: i64 = conn
				.query_row("SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?1", [table], |r| r.get(0))
				.unwrap();
			assert_eq!(count, 1, "missing table {}", table);
		}
	}
}
