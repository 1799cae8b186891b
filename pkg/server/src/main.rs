//! `raftd`: runs one node of a Raft-replicated repository cluster. Parses its config, takes an
//! exclusive lock on its data directory, recovers durable state, wires up the repository state
//! machine, starts the node, and serves peer RPCs (`RequestVote`/`AppendEntries`/`Propose`/
//! `WhoIsLeader`). `Facade` is a library entrypoint for an in-process client; this binary does
//! not expose a separate request-routing front end of its own.

extern crate core;
extern crate server;

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use log::info;

use core::fs::DirLock;
use raft::{Node, NodeConfig, TcpTransport};

use server::config::{AppConfig, Cli};
use server::db::Db;
use server::errors::*;
use server::state_machine::Router;

fn run() -> Result<()> {
	env_logger::init();

	let cli = Cli::parse();
	let config = AppConfig::load(&cli)?;

	let _lock = DirLock::open(&config.data_dir)
		.map_err(|e| Error::from(format!("failed to lock data directory {}: {}", config.data_dir.display(), e)))?;

	let (store, meta, log) = raft::DurableStore::open(&config.data_dir)?;
	let db = Arc::new(Db::open(&config.data_dir)?);
	let router: Arc<dyn raft::StateMachine> = Arc::new(Router::new(db.clone()));

	let addresses: HashMap<String, String> =
		config.peers.iter().map(|(id, addr)| (id.clone(), addr.clone())).collect();
	let transport = Arc::new(TcpTransport::new(addresses));

	let node_config = NodeConfig {
		id: config.node_id.clone(),
		peers: config.peers.keys().cloned().collect(),
		election_timeout_range: config.election_timeout_range,
		heartbeat_interval: config.heartbeat_interval,
	};

	let node = Node::start(node_config, store, meta, log, transport, router);

	info!("node {} peers: {:?}", config.node_id, node.peers());
	info!("node {} listening on {}", config.node_id, config.listen_addr);
	TcpTransport::serve(&config.listen_addr, node)?;

	Ok(())
}

fn main() {
	if let Err(e) = run() {
		eprintln!("raftd: {}", e);
		std::process::exit(1);
	}
}
