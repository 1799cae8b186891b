//! Durable store: `currentTerm`, `votedFor`, and the log, persisted under a per-node
//! data directory. Every write here flushes to disk before returning, so the caller can treat
//! a successful call as durable.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::errors::*;
use crate::types::{LogEntry, Metadata};

pub struct DurableStore {
	meta_path: PathBuf,
	log_path: PathBuf,
}

impl DurableStore {
	/// Opens (creating if necessary) the store under `dir`, returning it along with whatever
	/// metadata and log it recovered. An empty/missing store recovers as `Metadata::default()`
	/// and an empty log, matching a brand new node.
	pub fn open(dir: &Path) -> Result<(DurableStore, Metadata, Vec<LogEntry>)> {
		std::fs::create_dir_all(dir)?;

		let meta_path = dir.join("meta");
		let log_path = dir.join("log");

		let meta = if meta_path.exists() {
			let bytes = std::fs::read(&meta_path)?;
			serde_json::from_slice(&bytes)
				.map_err(|e| Error::from(ErrorKind::CorruptState(format!("meta: {}", e))))?
		} else {
			Metadata::default()
		};

		let log = if log_path.exists() {
			Self::read_log(&log_path)?
		} else {
			Vec::new()
		};

		for (i, entry) in log.iter().enumerate() {
			if entry.index != (i + 1) as u64 {
				return Err(ErrorKind::CorruptState(format!(
					"log entry at position {} has index {}, expected {}",
					i,
					entry.index,
					i + 1
				))
				.into());
			}
		}

		Ok((DurableStore { meta_path, log_path }, meta, log))
	}

	fn read_log(path: &Path) -> Result<Vec<LogEntry>> {
		let file = File::open(path)?;
		let reader = BufReader::new(file);
		let mut out = Vec::new();
		for (lineno, line) in reader.lines().enumerate() {
			let line = line?;
			if line.is_empty() {
				continue;
			}
			let entry: LogEntry = serde_json::from_str(&line)
				.map_err(|e| Error::from(ErrorKind::CorruptState(format!("log line {}: {}", lineno, e))))?;
			out.push(entry);
		}
		Ok(out)
	}

	/// Overwrites `meta` atomically (write to a temp file, fsync, rename).
	pub fn persist_meta(&self, meta: &Metadata) -> Result<()> {
		let tmp_path = self.meta_path.with_extension("tmp");
		let bytes = serde_json::to_vec(meta)?;
		{
			let mut f = File::create(&tmp_path)?;
			f.write_all(&bytes)?;
			f.sync_all()?;
		}
		std::fs::rename(&tmp_path, &self.meta_path)?;
		Ok(())
	}

	/// Appends `entries` to the tail of the log file. Only valid when the caller knows these
	/// entries strictly extend the existing log (no truncation involved).
	pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
		if entries.is_empty() {
			return Ok(());
		}
		let mut f = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
		for entry in entries {
			let mut line = serde_json::to_vec(entry)?;
			line.push(b'\n');
			f.write_all(&line)?;
		}
		f.sync_all()?;
		Ok(())
	}

	/// Rewrites the entire log file to exactly `entries`. Used for the conflict-resolution
	/// path, where a suffix of the existing log is discarded before new entries are appended.
	/// Atomic: the old file remains untouched until the replacement is fully durable.
	pub fn rewrite_log(&self, entries: &[LogEntry]) -> Result<()> {
		let tmp_path = self.log_path.with_extension("tmp");
		{
			let mut f = File::create(&tmp_path)?;
			for entry in entries {
				let mut line = serde_json::to_vec(entry)?;
				line.push(b'\n');
				f.write_all(&line)?;
			}
			f.sync_all()?;
		}
		std::fs::rename(&tmp_path, &self.log_path)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::LogEntryData;

	fn tmp_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("raft-store-test-{}-{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		dir
	}

	#[test]
	fn empty_store_recovers_defaults() {
		let dir = tmp_dir("empty");
		let (_store, meta, log) = DurableStore::open(&dir).unwrap();
		assert_eq!(meta, Metadata::default());
		assert!(log.is_empty());
		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn meta_and_log_round_trip_across_reopen() {
		let dir = tmp_dir("roundtrip");
		let entries = vec![
			LogEntry { index: 1, term: 1, data: LogEntryData::Noop },
			LogEntry { index: 2, term: 1, data: LogEntryData::Command(vec![1, 2, 3]) },
		];

		{
			let (store, _meta, _log) = DurableStore::open(&dir).unwrap();
			store
				.persist_meta(&Metadata { current_term: 3, voted_for: Some("b".into()) })
				.unwrap();
			store.append(&entries).unwrap();
		}

		let (_store, meta, log) = DurableStore::open(&dir).unwrap();
		assert_eq!(meta, Metadata { current_term: 3, voted_for: Some("b".into()) });
		assert_eq!(log, entries);

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn rewrite_log_truncates_and_extends() {
		let dir = tmp_dir("rewrite");
		let (store, _meta, _log) = DurableStore::open(&dir).unwrap();

		store
			.append(&[
				LogEntry { index: 1, term: 1, data: LogEntryData::Noop },
				LogEntry { index: 2, term: 1, data: LogEntryData::Noop },
				LogEntry { index: 3, term: 1, data: LogEntryData::Noop },
			])
			.unwrap();

		let replacement = vec![
			LogEntry { index: 1, term: 1, data: LogEntryData::Noop },
			LogEntry { index: 2, term: 2, data: LogEntryData::Command(vec![9])
			},
		];
		store.rewrite_log(&replacement).unwrap();

		let (_store2, _meta2, log) = DurableStore::open(&dir).unwrap();
		assert_eq!(log, replacement);

		std::fs::remove_dir_all(&dir).ok();
	}

	#[test]
	fn corrupt_log_fails_to_open() {
		let dir = tmp_dir("corrupt");
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(dir.join("log"), b"not json\n").unwrap();

		let result = DurableStore::open(&dir);
		assert!(result.is_err());

		std::fs::remove_dir_all(&dir).ok();
	}
}
