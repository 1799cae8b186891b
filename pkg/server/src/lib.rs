#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate serde_derive;

extern crate raft;

pub mod command;
pub mod config;
pub mod db;
pub mod errors;
pub mod facade;
pub mod repositories;
pub mod state_machine;
