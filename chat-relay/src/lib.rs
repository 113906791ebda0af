//! Line-oriented TCP chat relay.
//!
//! Every client is prompted for a username, after which each line it sends is
//! relayed to all connected clients and the server keeps everyone's view of the
//! membership list current.
//!
//! - [`protocol`] holds the wire vocabulary: prompt, `MEMBERS:` records, the
//!   disconnect token, and newline framing.
//! - [`session`] owns one client's transport, split into a shared write side
//!   and a read side owned by the client's receive loop.
//! - [`registry`] is the lock-guarded set of joined sessions.
//! - [`broadcaster`] fans chat lines and membership records out to the registry.
//! - [`server`] accepts connections and runs each session's lifecycle.
//! - [`client`] is a small terminal client that speaks the same protocol.
//! - [`cli`] parses the command line for both modes.

pub mod broadcaster;
pub mod cli;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
