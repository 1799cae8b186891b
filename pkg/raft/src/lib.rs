#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate error_chain;

pub mod errors;
pub mod types;

pub mod store;
pub mod rpc;

mod consensus;
pub mod node;
pub mod state_machine;

pub use consensus::OutboundRpc;
pub use node::{Node, NodeConfig, ProposeOutcome};
pub use rpc::{ChannelTransport, ChannelTransportHandle, RpcServer, TcpTransport, Transport};
pub use state_machine::StateMachine;
pub use store::DurableStore;
pub use types::{ApplyOutcome, LogEntry, LogEntryData, LogIndex, Metadata, NodeId, Term};
