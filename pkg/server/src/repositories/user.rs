use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
	pub id: String,
	pub name: String,
	pub email: String,
	pub created_at: DateTime<Utc>,
}

/// Dispatches a committed `{repository: "UserRepository", ...}` command. Called only from the
/// apply loop; never invoked directly by request handlers.
pub fn apply(conn: &Connection, method: &str, payload: &Value) -> Result<()> {
	match method {
		"Create" => {
			let user: User = serde_json::from_value(payload.clone())?;
			conn.execute(
				"INSERT INTO users (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
				params![user.id, user.name, user.email, user.created_at],
			)?;
			Ok(())
		}
		"Update" => {
			let user: User = serde_json::from_value(payload.clone())?;
			let rows = conn.execute(
				"UPDATE users SET name = ?2, email = ?3 WHERE id = ?1",
				params![user.id, user.name, user.email],
			)?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("user {}", user.id)).into());
			}
			Ok(())
		}
		"Delete" => {
			let id = payload.get("id").and_then(Value::as_str).ok_or_else(|| ErrorKind::NotFound("user id".into()))?;
			let rows = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("user {}", id)).into());
			}
			Ok(())
		}
		other => Err(ErrorKind::UnknownMethod("UserRepository".into(), other.into()).into()),
	}
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<User>> {
	conn.query_row("SELECT id, name, email, created_at FROM users WHERE id = ?1", params![id], row_to_user)
		.optional()
		.map_err(Into::into)
}

pub fn list(conn: &Connection) -> Result<Vec<User>> {
	let mut stmt = conn.prepare("SELECT id, name, email, created_at FROM users ORDER BY id")?;
	let rows = stmt.query_map([], row_to_user)?;
	rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
	Ok(User { id: row.get(0)?, name: row.get(1)?, email: row.get(2)?, created_at: row.get(3)? })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::Db;
	use serde_json::json;

	#[test]
	fn create_then_get_round_trips() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();

		apply(
			&conn,
			"Create",
			&json!({"id": "u1", "name": "Ada", "email": "ada@example.com", "created_at": "2026-01-01T00:00:00Z"}),
		)
		.unwrap();

		let user = get(&conn, "u1").unwrap().unwrap();
		assert_eq!(user.name, "Ada");
	}

	#[test]
	fn update_missing_user_fails() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();

		let err = apply(
			&conn,
			"Update",
			&json!({"id": "missing", "name": "x", "email": "x", "created_at": "2026-01-01T00:00:00Z"}),
		)
		.unwrap_err();
		assert!(matches!(err.kind(), ErrorKind::NotFound(_)));
	}

	#[test]
	fn unknown_method_fails_deterministically() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();

		let err = apply(&conn, "Frobnicate", &json!({})).unwrap_err();
		assert!(matches!(err.kind(), ErrorKind::UnknownMethod(_, _)));
	}
}
