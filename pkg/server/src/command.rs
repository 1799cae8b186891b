//! The envelope every write is wrapped in before being proposed to Raft.
//! The core only ever sees the serialized bytes of this struct; it never inspects `payload`.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DBCommand {
	pub repository: String,
	pub method: String,
	pub payload: Value,
}

impl DBCommand {
	pub fn new(repository: &str, method: &str, payload: Value) -> DBCommand {
		DBCommand { repository: repository.into(), method: method.into(), payload }
	}

	pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
		serde_json::to_vec(self)
	}

	pub fn decode(bytes: &[u8]) -> serde_json::Result<DBCommand> {
		serde_json::from_slice(bytes)
	}
}
