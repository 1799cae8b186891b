use rusqlite::{params, Connection, OptionalExtension};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::*;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigEntry {
	pub name: String,
	pub value: String,
}

pub fn apply(conn: &Connection, method: &str, payload: &Value) -> Result<()> {
	match method {
		"Create" => {
			let entry: ConfigEntry = serde_json::from_value(payload.clone())?;
			conn.execute("INSERT INTO config (name, value) VALUES (?1, ?2)", params![entry.name, entry.value])?;
			Ok(())
		}
		"Update" => {
			let entry: ConfigEntry = serde_json::from_value(payload.clone())?;
			let rows = conn.execute("UPDATE config SET value = ?2 WHERE name = ?1", params![entry.name, entry.value])?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("config {}", entry.name)).into());
			}
			Ok(())
		}
		"Delete" => {
			let name = payload.get("name").and_then(Value::as_str).ok_or_else(|| ErrorKind::NotFound("config name".into()))?;
			let rows = conn.execute("DELETE FROM config WHERE name = ?1", params![name])?;
			if rows == 0 {
				return Err(ErrorKind::NotFound(format!("config {}", name)).into());
			}
			Ok(())
		}
		other => Err(ErrorKind::UnknownMethod("ConfigRepository".into(), other.into()).into()),
	}
}

/// The one domain-specific read method this repository exposes beyond the common CRUD set.
pub fn get_by_name(conn: &Connection, name: &str) -> Result<Option<String>> {
	conn.query_row("SELECT value FROM config WHERE name = ?1", params![name], |row| row.get(0))
		.optional()
		.map_err(Into::into)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::Db;
	use serde_json::json;

	#[test]
	fn create_then_update_then_get_by_name() {
		let db = Db::open_in_memory().unwrap();
		let conn = db.conn.lock().unwrap();

		apply(&conn, "Create", &json!({"name": "redis_primary", "value": "10.0.0.1:6379"})).unwrap();
		assert_eq!(get_by_name(&conn, "redis_primary").unwrap(), Some("10.0.0.1:6379".into()));

		apply(&conn, "Update", &json!({"name": "redis_primary", "value": "10.0.0.2:6379"})).unwrap();
		assert_eq!(get_by_name(&conn, "redis_primary").unwrap(), Some("10.0.0.2:6379".into()));
	}
}
