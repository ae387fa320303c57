//! Simulated master server.
//!
//! The simulator accepts the client handshake, negotiates a protocol version, assigns connector
//! ids and answers the built-in commands. Tests and the `hcrpc_sim` binary install additional
//! command handlers to script arbitrary responses.
mod server;

pub use server::{Exchange, Handler, SimServer, SimServerBuilder, write_result};
