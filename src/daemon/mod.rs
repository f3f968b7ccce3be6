//! Daemon internals: control-plane server, service supervision and the
//! versioned deployment engine.

pub mod client;
pub mod deploy;
pub mod health;
pub mod logs;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use client::DaemonClient;
pub use server::{DaemonConfig, DaemonServer};
