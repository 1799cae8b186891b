use rusqlite::{params, Connection, OptionalExtension};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
	pub id: String,
	pub name: String,
}

pub fn apply(conn: &Connection, method: &str, payload: &Value) -> Result<()> {
	match method {
		"Create" => {
			let group: Group = serde_json::from_value(payload.clone())?;
			conn.execute("INSERT INTO groups (id, name) VALUES (?1, ?2)", params![group.id, group.name])?;
			Ok(())
		}
		"Update" => {
			let group: Group = serde_json::from_value(payload.clone())?;
			let rows = conn.execute("UPDATE groups SET name = ?2 WHERE id = ?1", params![group.id, group.name])?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("group {}", group.id)).into());
			}
			Ok(())
		}
		"Delete" => {
			let id = payload.get("id").and_then(Value::as_str).ok_or_else(|| ErrorKind::NotFound("group id".into()))?;
			let rows = conn.execute("DELETE FROM groups WHERE id = ?1", params![id])?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("group {}", id)).into());
			}
			Ok(())
		}
		other => Err(ErrorKind::UnknownMethod("GroupRepository".into(), other.into()).into()),
	}
}

pub fn get(conn: &Connection, id: &str) -> Result<Option<Group>> {
	conn.query_row("SELECT id, name FROM groups WHERE id = ?1", params![id], |row| {
		Ok(Group { id: row.get(0)?, name: row.get(1)? })
	})
	.optional()
	.map_err(Into::into)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::Db;
	use serde_json::json;

	#[test]
	fn delete_missing_group_is_not_found() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();
		let err = apply(&conn, "Delete", &json!({"id": "missing"})).unwrap_err();
		assert!(matches!(err.kind(), ErrorKind::NotFound(_)));
	}
}
