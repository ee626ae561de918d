//! # wasl-server
//!
//! The wasl signaling daemon: client WebSocket endpoint, cluster
//! transport endpoint, admin HTTP surface, directory bootstrap and the
//! supervisor that wires the library crates together.
//!
//! Exposed as a library so integration tests can run several logical
//! servers inside one process; the `wasl-server` binary is a thin
//! wrapper around [`supervisor::run`].

pub mod admin;
pub mod bootstrap;
pub mod client;
pub mod cluster;
pub mod config;
pub mod state;
pub mod supervisor;

pub use config::ServerConfig;
pub use supervisor::Server;
