use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
	pub id: String,
	pub name: String,
	pub starts_at: DateTime<Utc>,
	pub location: String,
}

pub fn apply(conn: &Connection, method: &str, payload: &Value) -> Result<()> {
	match method {
		"Create" => {
			let event: Event = serde_json::from_value(payload.clone())?;
			conn.execute(
				"INSERT INTO events (id, name, starts_at, location) VALUES (?1, ?2, ?3, ?4)",
				params![event.id, event.name, event.starts_at, event.location],
			)?;
			Ok(())
		}
		"Update" => {
			let event: Event = serde_json::from_value(payload.clone())?;
			let rows = conn.execute(
				"UPDATE events SET name = ?2, starts_at = ?3, location = ?4 WHERE id = ?1",
				params![event.id, event.name, event.starts_at, event.location],
			)?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("event {}", event.id)).into());
			}
			Ok(())
		}
		"Delete" => {
			let id = payload.get("id").and_then(Value::as_str).ok_or_else(|| ErrorKind::NotFound("event id".into()))?;
			let rows = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("event {}", id)).into());
			}
			Ok(())
		}
		other => Err(ErrorKind::UnknownMethod("EventRepository".into(), other.into()).into()),
	}
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Event>> {
	conn.query_row("SELECT id, name, starts_at, location FROM events WHERE id = ?1", params![id], row_to_event)
		.optional()
		.map_err(Into::into)
}

pub fn list(conn: &Connection) -> Result<Vec<Event>> {
	let mut stmt = conn.prepare("SELECT id, name, starts_at, location FROM events ORDER BY id")?;
	let rows = stmt.query_map([], row_to_event)?;
	rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
	Ok(Event { id: row.get(0)?, name: row.get(1)?, starts_at: row.get(2)?, location: row.get(3)? })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::Db;
	use serde_json::json;

	#[test]
	fn create_update_delete_cycle() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();

		apply(
			&conn,
			"Create",
			&json!({"id": "e1", "name": "Launch", "starts_at": "2026-01-01T09:00:00Z", "location": "HQ"}),
		)
		.unwrap();
		apply(
			&conn,
			"Update",
			&json!({"id": "e1", "name": "Launch v2", "starts_at": "2026-01-02T09:00:00Z", "location": "HQ"}),
		)
		.unwrap();
		assert_eq!(get(&conn, "e1").unwrap().unwrap().name, "Launch v2");

		apply(&conn, "Delete", &json!({"id": "e1"})).unwrap();
		assert!(get(&conn, "e1").unwrap().is_none());
	}
}
