//! Node configuration: a TOML file on disk, with CLI flags layered on top for the fields an
//! operator commonly wants to override without editing the file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde_derive::Deserialize;

use crate::errors::*;

#[derive(Debug, Deserialize)]
pub struct FileConfig {
	pub node_id: String,
	pub peers: HashMap<String, String>,
	pub data_dir: PathBuf,
	pub listen_addr: String,

	#[serde(default = "default_election_timeout_min_ms")]
	pub election_timeout_min_ms: u64,
	#[serde(default = "default_election_timeout_max_ms")]
	pub election_timeout_max_ms: u64,
	#[serde(default = "default_heartbeat_interval_ms")]
	pub heartbeat_interval_ms: u64,
}

fn default_election_timeout_min_ms() -> u64 {
	150
}

fn default_election_timeout_max_ms() -> u64 {
	300
}

fn default_heartbeat_interval_ms() -> u64 {
	50
}

/// `raftd --config node-a.toml [overrides]`. CLI flags win over the file when present.
#[derive(Debug, Parser)]
#[command(name = "raftd", about = "Runs one node of a Raft-replicated repository cluster")]
pub struct Cli {
	/// Path to the node's TOML configuration file.
	#[arg(long)]
	pub config: PathBuf,

	/// Overrides `listen_addr` from the config file.
	#[arg(long)]
	pub listen_addr: Option<String>,

	/// Overrides `data_dir` from the config file.
	#[arg(long)]
	pub data_dir: Option<PathBuf>,
}

pub struct AppConfig {
	pub node_id: String,
	pub peers: HashMap<String, String>,
	pub data_dir: PathBuf,
	pub listen_addr: String,
	pub election_timeout_range: (Duration, Duration),
	pub heartbeat_interval: Duration,
}

impl AppConfig {
	pub fn load(cli: &Cli) -> Result<AppConfig> {
		let text = std::fs::read_to_string(&cli.config)?;
		let file: FileConfig = toml::from_str(&text)?;

		Ok(AppConfig {
			node_id: file.node_id,
			peers: file.peers,
			data_dir: cli.data_dir.clone().unwrap_or(file.data_dir),
			listen_addr: cli.listen_addr.clone().unwrap_or(file.listen_addr),
			election_timeout_range: (
				Duration::from_millis(file.election_timeout_min_ms),
				Duration::from_millis(file.election_timeout_max_ms),
			),
			heartbeat_interval: Duration::from_millis(file.heartbeat_interval_ms),
		})
	}
}
