//! EngineNet Client
//!
//! Owns one connection to a server plus the network thread that drives it.
//! Everything the server sends, and every connection event, lands in the
//! inbound queue for the simulation thread to poll.

use std::sync::Arc;

use thiserror::Error;

use super::connection::{Connection, ConnectionError, ConnectionOwner, ConnectionState};
use super::runtime::{NetworkRuntime, RuntimeError};
use super::{resolve_host, NetworkConfig};
use crate::protocol::{Message, SystemMessage};
use crate::queue::ConcurrentQueue;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// EngineNet Client
pub struct ClientManager {
    /// Client configuration
    config: NetworkConfig,
    /// Messages and connection events from the server
    inbound: Arc<ConcurrentQueue<Message>>,
    /// Current connection, rebuilt for every connect
    connection: Option<Arc<Connection>>,
    /// Network thread for the current connection
    runtime: Option<NetworkRuntime>,
}

impl ClientManager {
    /// Create a new client. No thread runs until `connect`.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            inbound: Arc::new(ConcurrentQueue::new()),
            connection: None,
            runtime: None,
        }
    }

    /// Set the body ceiling and build the network runtime and connection
    pub fn init(&mut self, max_body_size: u32) -> ClientResult<()> {
        self.config.max_body_size = max_body_size;
        self.prepare()
    }

    /// Connect to a server.
    ///
    /// The name is resolved before this returns; a resolution failure is
    /// returned and also recorded as a `Failed` message. The connect itself
    /// completes in the background and reports `Connected` or `Failed`
    /// through the inbound queue.
    pub fn connect(&mut self, host: &str, port: u16) -> ClientResult<()> {
        if let Some(conn) = &self.connection {
            if conn.state() != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
        }

        let reusable = self.runtime.as_ref().is_some_and(|r| !r.is_running())
            && self.connection.is_some();
        if !reusable {
            self.prepare()?;
        }

        let (Some(runtime), Some(connection)) = (self.runtime.as_mut(), self.connection.as_ref())
        else {
            return Err(ClientError::NotConnected);
        };

        let addr = match runtime.block_on(resolve_host(host, port))? {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Failed to resolve {}:{}: {}", host, port, e);
                self.inbound.push_back(Message::system(SystemMessage::Failed));
                return Err(ClientError::Resolve(format!("{}:{}", host, port)));
            }
        };

        tracing::info!("Connecting to {} ({}:{})", addr, host, port);
        connection.connect_to_server(addr);
        runtime.start()?;

        Ok(())
    }

    /// Send a message to the server
    pub fn send(&self, message: Message) -> ClientResult<()> {
        match &self.connection {
            Some(conn) if conn.is_connected() => {
                conn.send(message)?;
                Ok(())
            }
            _ => {
                tracing::warn!("Dropping {}: not connected", message);
                Err(ClientError::NotConnected)
            }
        }
    }

    /// Queue of messages and connection events received so far
    pub fn inbound(&self) -> &Arc<ConcurrentQueue<Message>> {
        &self.inbound
    }

    /// Take the oldest received message
    pub fn poll(&self) -> Option<Message> {
        self.inbound.pop_front()
    }

    /// Take up to `max` received messages, oldest first
    pub fn poll_all(&self, max: usize) -> Vec<Message> {
        self.inbound.drain(max)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(|c| c.is_connected())
    }

    /// Id of the client-side connection.
    ///
    /// Always 0: ids are handed out by the server to its own connections and
    /// are never sent over the wire. A server refers to this client by the id
    /// of the connection it accepted, which the client cannot see.
    pub fn id(&self) -> u32 {
        self.connection.as_ref().map_or(0, |c| c.id())
    }

    /// Close the connection and stop the network thread.
    ///
    /// Blocks until the network thread has exited. The client can connect
    /// again afterwards.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.destroy();
        }

        if let Some(mut runtime) = self.runtime.take() {
            runtime.stop();
        }
    }

    /// Disconnect and discard everything received
    pub fn destroy(&mut self) {
        self.disconnect();
        self.inbound.clear();
    }

    fn prepare(&mut self) -> ClientResult<()> {
        self.disconnect();

        let runtime = NetworkRuntime::new("enginenet-client")?;
        let connection = Connection::new(
            ConnectionOwner::Client,
            &self.config,
            self.inbound.clone(),
            runtime.handle().clone(),
        );

        self.runtime = Some(runtime);
        self.connection = Some(connection);
        Ok(())
    }
}

impl Drop for ClientManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
