// Stack Backend Daemon Library
// Exposes internal modules for integration testing

#[macro_use]
extern crate log;

pub mod adapters;
pub mod config;
pub mod core;
pub mod rpc;
