//! EngineNet - Message-oriented client/server networking for a game engine
//!
//! Peers exchange typed messages framed as a fixed header plus a raw body.
//! All socket I/O runs on a dedicated network thread per manager; received
//! messages are handed to the simulation thread through a shared queue that
//! it drains once per tick.
//!
//! - [`protocol`]: message envelope and header codec
//! - [`queue`]: the thread-safe queue between the two threads
//! - [`network`]: connections, the client manager and the server manager
//! - [`config`]: TOML configuration
//!
//! Connection ids only exist on the server, starting at
//! [`network::FIRST_CLIENT_ID`]. `ClientManager::id` is always 0.

pub mod config;
pub mod network;
pub mod protocol;
pub mod queue;

#[cfg(test)]
mod test_support;

pub use network::{ClientManager, Connection, NetworkConfig, ServerHooks, ServerManager};
pub use protocol::{Message, SystemMessage};
pub use queue::ConcurrentQueue;
