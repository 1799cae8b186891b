//! One module per table in the embedded schema. Each exposes `apply` (the write path invoked
//! only through the committed log, via `crate::state_machine::Router`) and a handful of typed
//! read methods that bypass Raft entirely and hit the local store directly.

pub mod config_repo;
pub mod event;
pub mod group;
pub mod group_event;
pub mod user;
