use rusqlite::{params, Connection};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupEvent {
	pub group_id: String,
	pub event_id: String,
}

/// Pure join table: no `Update`, only `Create` (add membership) and `Delete` (remove it).
pub fn apply(conn: &Connection, method: &str, payload: &Value) -> Result<()> {
	match method {
		"Create" => {
			let link: GroupEvent = serde_json::from_value(payload.clone())?;
			conn.execute(
				"INSERT INTO group_events (group_id, event_id) VALUES (?1, ?2)",
				params![link.group_id, link.event_id],
			)?;
			Ok(())
		}
		"Delete" => {
			let link: GroupEvent = serde_json::from_value(payload.clone())?;
			let rows = conn.execute(
				"DELETE FROM group_events WHERE group_id = ?1 AND event_id = ?2",
				params![link.group_id, link.event_id],
			)?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("group_event {}/{}", link.group_id, link.event_id)).into());
			}
			Ok(())
		}
		other => Err(ErrorKind::UnknownMethod("GroupEventRepository".into(), other.into()).into()),
	}
}

pub fn list_events_for_group(conn: &Connection, group_id: &str) -> Result<Vec<String>> {
	let mut stmt = conn.prepare("SELECT event_id FROM group_events WHERE group_id = ?1 ORDER BY event_id")?;
	let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;
	rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::Db;
	use serde_json::json;

	#[test]
	fn create_then_list_then_delete() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();

		apply(&conn, "Create", &json!({"group_id": "g1", "event_id": "e1"})).unwrap();
		apply(&conn, "Create", &json!({"group_id": "g1", "event_id": "e2"})).unwrap();
		assert_eq!(list_events_for_group(&conn, "g1").unwrap(), vec!["e1".to_string(), "e2".to_string()]);

		apply(&conn, "Delete", &json!({"group_id": "g1", "event_id": "e1"})).unwrap();
		assert_eq!(list_events_for_group(&conn, "g1").unwrap(), vec!["e2".to_string()]);
	}
}
