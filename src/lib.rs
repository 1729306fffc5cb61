//! # session-server
//!
//! Connection acceptance and lifecycle management for stream-oriented servers.
//!
//! A [`server::Server`] binds a TCP listener (optionally upgraded to TLS),
//! accepts connections in a loop and hands each one, wrapped in a
//! [`server::Session`], to its own task running the registered
//! [`server::Handler`]. Shutdown stops accepting and then waits for every
//! in-flight session to finish.

pub mod config;
pub mod server;
pub mod utils;

pub use server::{Handler, Server, Session};
pub use utils::{ConfigError, ServerError};
