//! Connection handling for EngineNet
//!
//! A `Connection` drives one socket:
//! - a read loop that frames header + body and pushes arrivals into the
//!   owning manager's inbound queue
//! - a write loop that drains a private outgoing queue in order
//! - the Disconnected / Connecting / Connected state machine
//!
//! Connections are shared through `Arc`. Every task running against the
//! socket holds its own strong reference, so a connection stays alive until
//! the last outstanding operation has finished, even after its manager has
//! dropped it.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use super::NetworkConfig;
use crate::protocol::{
    decode_header, encode_header, is_reserved_type_id, validate_header, CodecError, Message,
    SystemMessage, HEADER_SIZE,
};
use crate::queue::ConcurrentQueue;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; also the terminal state after any close
    Disconnected,
    /// Outgoing connect in flight
    Connecting,
    /// Socket open, read and write loops running
    Connected,
}

/// Which side created the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOwner {
    Client,
    Server,
}

/// Connection statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent, headers included
    pub bytes_sent: u64,
    /// Bytes received, headers included
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounters {
    fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Represents a connection to a remote EngineNet peer
pub struct Connection {
    id: AtomicU32,
    owner: ConnectionOwner,
    max_body_size: u32,
    connect_timeout: Duration,
    state: Mutex<ConnectionState>,
    remote_addr: Mutex<Option<SocketAddr>>,
    /// Manager's inbound queue; released on destroy
    inbound: Mutex<Option<Arc<ConcurrentQueue<Message>>>>,
    /// Posting side of the outgoing queue
    outgoing_tx: mpsc::UnboundedSender<Message>,
    /// Taken by the write loop when the socket opens
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    /// Flipped to true once; every loop watches it
    closed_tx: watch::Sender<bool>,
    runtime: Handle,
    stats: StatsCounters,
}

impl Connection {
    /// Create a connection that will run its I/O on `runtime`
    pub fn new(
        owner: ConnectionOwner,
        config: &NetworkConfig,
        inbound: Arc<ConcurrentQueue<Message>>,
        runtime: Handle,
    ) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        Arc::new(Self {
            id: AtomicU32::new(0),
            owner,
            max_body_size: config.max_body_size,
            connect_timeout: config.connect_timeout(),
            state: Mutex::new(ConnectionState::Disconnected),
            remote_addr: Mutex::new(None),
            inbound: Mutex::new(Some(inbound)),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            closed_tx,
            runtime,
            stats: StatsCounters::default(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn owner_kind(&self) -> ConnectionOwner {
        self.owner
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    /// Start connecting to a server. Completion is reported through the
    /// inbound queue: `Connected` on success, `Failed` otherwise.
    pub fn connect_to_server(self: &Arc<Self>, addr: SocketAddr) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Disconnected || *self.closed_tx.borrow() {
                tracing::warn!("Connection {} cannot connect from state {:?}", self.id(), *state);
                return;
            }
            *state = ConnectionState::Connecting;
        }
        *self.remote_addr.lock() = Some(addr);

        let conn = Arc::clone(self);
        self.runtime.spawn(async move { conn.run_connect(addr).await });
    }

    /// Give an accepted connection its id and peer address before admission
    pub(crate) fn assign(&self, id: u32, addr: SocketAddr) {
        self.id.store(id, Ordering::SeqCst);
        *self.remote_addr.lock() = Some(addr);
    }

    /// Adopt an accepted socket (server side) and start the protocol loops
    pub fn connect_to_client(self: &Arc<Self>, id: u32, stream: TcpStream) {
        self.id.store(id, Ordering::SeqCst);
        if let Ok(addr) = stream.peer_addr() {
            *self.remote_addr.lock() = Some(addr);
        }
        *self.state.lock() = ConnectionState::Connected;

        tracing::info!("Client {} connected from {:?}", id, self.remote_addr());
        self.start_loops(stream);
    }

    /// Post a message for transmission.
    ///
    /// Messages posted before the socket opens are held and written in order
    /// once it does.
    pub fn send(&self, message: Message) -> ConnectionResult<()> {
        if is_reserved_type_id(message.type_id()) {
            return Err(CodecError::ReservedTypeId(message.type_id()).into());
        }

        self.outgoing_tx
            .send(message)
            .map_err(|_| ConnectionError::Closed)
    }

    /// Close the connection. Safe to call any number of times from any thread.
    pub fn disconnect(self: &Arc<Self>) {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Disconnected);
        self.closed_tx.send_replace(true);

        if previous == ConnectionState::Connected {
            tracing::info!("Connection {} disconnected", self.id());
            if self.owner == ConnectionOwner::Client {
                self.notify(SystemMessage::Disconnected);
            }
        }
    }

    /// Disconnect and release everything the connection buffers
    pub fn destroy(self: &Arc<Self>) {
        self.disconnect();
        self.inbound.lock().take();
        self.outgoing_rx.lock().take();
    }

    async fn run_connect(self: Arc<Self>, addr: SocketAddr) {
        let attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr));
        let result = tokio::select! {
            result = attempt => result,
            _ = self.closed() => {
                tracing::debug!("Connect to {} cancelled", addr);
                return;
            }
        };

        match result {
            Ok(Ok(stream)) => {
                {
                    let mut state = self.state.lock();
                    if *state != ConnectionState::Connecting {
                        return;
                    }
                    *state = ConnectionState::Connected;
                }
                tracing::info!("Connected to {}", addr);
                self.notify(SystemMessage::Connected);
                self.start_loops(stream);
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to connect to {}: {}", addr, e);
                self.fail();
            }
            Err(_) => {
                tracing::warn!("Failed to connect to {}: {}", addr, ConnectionError::Timeout);
                self.fail();
            }
        }
    }

    fn fail(self: &Arc<Self>) {
        *self.state.lock() = ConnectionState::Disconnected;
        self.notify(SystemMessage::Failed);
    }

    fn start_loops(self: &Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }

        let Some(outgoing_rx) = self.outgoing_rx.lock().take() else {
            tracing::warn!("Connection {} was already started or destroyed", self.id());
            self.disconnect();
            return;
        };

        let (reader, writer) = stream.into_split();
        self.runtime.spawn(Arc::clone(self).read_loop(reader));
        self.runtime.spawn(Arc::clone(self).write_loop(writer, outgoing_rx));
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let closed = self.closed();
        tokio::pin!(closed);

        loop {
            let result = tokio::select! {
                result = self.read_message(&mut reader) => result,
                _ = &mut closed => break,
            };

            match result {
                Ok(message) => self.deliver(message),
                Err(ConnectionError::Protocol(e)) => {
                    tracing::warn!("Connection {} protocol violation: {}", self.id(), e);
                    self.disconnect();
                    break;
                }
                Err(e) => {
                    tracing::debug!("Connection {} read failed: {}", self.id(), e);
                    self.disconnect();
                    break;
                }
            }
        }
    }

    async fn read_message<R>(self: &Arc<Self>, reader: &mut R) -> ConnectionResult<Message>
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = [0u8; HEADER_SIZE];
        reader.read_exact(&mut raw).await?;

        let header = decode_header(&raw);
        validate_header(&header, self.max_body_size)?;

        let mut body = vec![0u8; header.body_size as usize];
        if !body.is_empty() {
            reader.read_exact(&mut body).await?;
        }

        self.stats.record_received(HEADER_SIZE + body.len());
        Ok(Message::from_parts(header.type_id, body).with_owner(Arc::downgrade(self)))
    }

    async fn write_loop<W>(self: Arc<Self>, mut writer: W, mut posted: mpsc::UnboundedReceiver<Message>)
    where
        W: AsyncWrite + Unpin,
    {
        let closed = self.closed();
        tokio::pin!(closed);

        let mut outgoing: VecDeque<Message> = VecDeque::new();
        let mut header_buf = BytesMut::with_capacity(HEADER_SIZE);

        'idle: loop {
            // Only an empty queue waits; a non-empty one is already writing
            let message = tokio::select! {
                message = posted.recv() => message,
                _ = &mut closed => None,
            };
            let Some(message) = message else { break };
            outgoing.push_back(message);

            while let Some(front) = outgoing.front() {
                let written = tokio::select! {
                    result = write_message(&mut writer, front, &mut header_buf) => Some(result),
                    _ = &mut closed => None,
                };

                match written {
                    None => break 'idle,
                    Some(Ok(bytes)) => {
                        self.stats.record_sent(bytes);
                        outgoing.pop_front();
                    }
                    Some(Err(e)) => {
                        tracing::debug!("Connection {} write failed: {}", self.id(), e);
                        self.disconnect();
                        break 'idle;
                    }
                }

                while let Ok(next) = posted.try_recv() {
                    outgoing.push_back(next);
                }
            }
        }

        if !outgoing.is_empty() {
            tracing::debug!(
                "Connection {} dropped {} unsent messages",
                self.id(),
                outgoing.len()
            );
        }
    }

    fn deliver(&self, message: Message) {
        let inbound = self.inbound.lock().clone();
        match inbound {
            Some(inbound) => inbound.push_back(message),
            None => tracing::debug!("Connection {} destroyed, dropping {}", self.id(), message),
        }
    }

    fn notify(self: &Arc<Self>, kind: SystemMessage) {
        self.deliver(Message::system(kind).with_owner(Arc::downgrade(self)));
    }

    /// Resolves once the connection has been closed
    fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closed_tx.subscribe();
        async move {
            loop {
                let closed = *rx.borrow_and_update();
                if closed || rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_message<W>(
    writer: &mut W,
    message: &Message,
    header_buf: &mut BytesMut,
) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    header_buf.clear();
    encode_header(message.header(), header_buf);
    writer.write_all(header_buf).await?;

    if !message.is_empty() {
        writer.write_all(message.body()).await?;
    }
    writer.flush().await?;

    Ok(HEADER_SIZE + message.size())
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}
