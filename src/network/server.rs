//! EngineNet Server
//!
//! The server accepts client connections on its own network thread and keeps
//! the live set. Messages from every client share one inbound queue, which
//! the simulation thread drains through `update`.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Handle;

use super::connection::{Connection, ConnectionError, ConnectionOwner};
use super::runtime::{NetworkRuntime, RuntimeError};
use super::NetworkConfig;
use crate::protocol::{is_reserved_type_id, CodecError, Message};
use crate::queue::ConcurrentQueue;

/// First id handed to an admitted client
pub const FIRST_CLIENT_ID: u32 = 100;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Unknown client {0}")]
    UnknownClient(u32),

    #[error("Client {0} has disconnected")]
    ClientDisconnected(u32),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Application callbacks for server events.
///
/// `on_connect` runs on the network thread while a new socket is being
/// admitted. `on_message` and `on_disconnect` run on the thread that calls
/// into the `ServerManager`.
pub trait ServerHooks: Send + Sync + Sized + 'static {
    /// Decide whether to admit a new client. Messages sent to it from here
    /// are written as soon as it is admitted.
    fn on_connect(&self, _client: &Arc<Connection>) -> bool {
        true
    }

    /// Handle one message drained by `update`
    fn on_message(&self, _server: &ServerManager<Self>, _message: Message) {}

    /// A client left the live set. Called exactly once per admitted client.
    fn on_disconnect(&self, _client: &Arc<Connection>) {}
}

/// Accept everyone, ignore everything
impl ServerHooks for () {}

/// State shared with the accept loop
struct Shared<H> {
    hooks: H,
    inbound: Arc<ConcurrentQueue<Message>>,
    clients: Mutex<BTreeMap<u32, Arc<Connection>>>,
    next_id: AtomicU32,
}

impl<H: ServerHooks> Shared<H> {
    /// Drop every client that is no longer connected and report it
    fn sweep(&self) {
        let mut dead = Vec::new();
        self.clients.lock().retain(|_, client| {
            let alive = client.is_connected();
            if !alive {
                dead.push(client.clone());
            }
            alive
        });

        self.report_disconnected(dead);
    }

    fn report_disconnected(&self, dead: Vec<Arc<Connection>>) {
        for client in dead {
            tracing::info!("Client {} removed", client.id());
            self.hooks.on_disconnect(&client);
        }
    }
}

/// EngineNet Server
pub struct ServerManager<H: ServerHooks> {
    /// Server configuration
    config: NetworkConfig,
    /// Hooks, clients and the inbound queue
    shared: Arc<Shared<H>>,
    /// Network thread, present while running
    runtime: Option<NetworkRuntime>,
    /// Address actually bound
    local_addr: Option<SocketAddr>,
}

impl<H: ServerHooks> ServerManager<H> {
    /// Create a new server. Nothing is bound until `start`.
    pub fn new(hooks: H, config: NetworkConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                hooks,
                inbound: Arc::new(ConcurrentQueue::new()),
                clients: Mutex::new(BTreeMap::new()),
                next_id: AtomicU32::new(FIRST_CLIENT_ID),
            }),
            runtime: None,
            local_addr: None,
        }
    }

    /// Set port and body ceiling, then start
    pub fn init(&mut self, port: u16, max_body_size: u32) -> ServerResult<()> {
        self.config.port = port;
        self.config.max_body_size = max_body_size;
        self.start()
    }

    /// Bind, start accepting and start the network thread.
    ///
    /// Bind errors are returned here; nothing is left running on failure.
    pub fn start(&mut self) -> ServerResult<()> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let mut runtime = NetworkRuntime::new("enginenet-server")?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        let listener = runtime
            .block_on(TcpListener::bind(bind_addr))?
            .map_err(|e| {
                ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
            })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        runtime.spawn(accept_loop(
            listener,
            self.shared.clone(),
            self.config.clone(),
            runtime.handle().clone(),
        ));
        runtime.start()?;

        self.runtime = Some(runtime);
        self.local_addr = Some(local_addr);
        Ok(())
    }

    /// Send to one client.
    ///
    /// A client that is no longer connected is removed, reported through
    /// `on_disconnect` and the send fails.
    pub fn message_client(&self, client: &Arc<Connection>, message: Message) -> ServerResult<()> {
        let id = client.id();

        if client.is_connected() {
            if !self.shared.clients.lock().contains_key(&id) {
                return Err(ServerError::UnknownClient(id));
            }
            client.send(message)?;
            return Ok(());
        }

        let removed = self.shared.clients.lock().remove(&id);
        if let Some(removed) = removed {
            self.shared.report_disconnected(vec![removed]);
        }
        Err(ServerError::ClientDisconnected(id))
    }

    /// Send to one client by id
    pub fn message_client_id(&self, id: u32, message: Message) -> ServerResult<()> {
        let client = self.shared.clients.lock().get(&id).cloned();
        match client {
            Some(client) => self.message_client(&client, message),
            None => Err(ServerError::UnknownClient(id)),
        }
    }

    /// Send to every connected client except `except`.
    ///
    /// Dead clients found on the way are removed and reported once the pass
    /// is over. Returns how many clients the message was posted to.
    pub fn message_all_clients(
        &self,
        message: &Message,
        except: Option<&Arc<Connection>>,
    ) -> ServerResult<usize> {
        if is_reserved_type_id(message.type_id()) {
            return Err(ConnectionError::from(CodecError::ReservedTypeId(message.type_id())).into());
        }

        let mut dead = Vec::new();
        let mut sent = 0;
        {
            let mut clients = self.shared.clients.lock();
            clients.retain(|_, client| {
                let alive = client.is_connected();
                if !alive {
                    dead.push(client.clone());
                }
                alive
            });

            for client in clients.values() {
                if except.is_some_and(|skip| Arc::ptr_eq(skip, client)) {
                    continue;
                }
                match client.send(message.clone()) {
                    Ok(()) => sent += 1,
                    Err(e) => tracing::warn!("Broadcast to client {} failed: {}", client.id(), e),
                }
            }
        }

        self.shared.report_disconnected(dead);
        Ok(sent)
    }

    /// Reap dead clients, then dispatch up to `max_messages` received
    /// messages (all of them for `None`) to `on_message`.
    ///
    /// Returns the number of messages dispatched.
    pub fn update(&self, max_messages: Option<usize>) -> usize {
        self.shared.sweep();

        let messages = self.shared.inbound.drain(max_messages.unwrap_or(usize::MAX));
        let count = messages.len();
        for message in messages {
            self.shared.hooks.on_message(self, message);
        }
        count
    }

    /// Disconnect every client and stop the network thread.
    ///
    /// Blocks until the thread has exited; no connection task runs after
    /// this returns.
    pub fn destroy(&mut self) {
        let clients = std::mem::take(&mut *self.shared.clients.lock());
        for client in clients.values() {
            client.destroy();
        }

        if let Some(mut runtime) = self.runtime.take() {
            runtime.stop();
            tracing::info!("Server stopped");
        }

        self.shared.inbound.clear();
        self.local_addr = None;
    }

    /// Stop a running server
    pub fn stop(&mut self) -> ServerResult<()> {
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }
        self.destroy();
        Ok(())
    }

    pub fn hooks(&self) -> &H {
        &self.shared.hooks
    }

    pub fn inbound(&self) -> &Arc<ConcurrentQueue<Message>> {
        &self.shared.inbound
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    pub fn client_ids(&self) -> Vec<u32> {
        self.shared.clients.lock().keys().copied().collect()
    }

    pub fn client(&self, id: u32) -> Option<Arc<Connection>> {
        self.shared.clients.lock().get(&id).cloned()
    }

    pub fn is_running(&self) -> bool {
        self.runtime.as_ref().is_some_and(|r| r.is_running())
    }
}

impl<H: ServerHooks> Drop for ServerManager<H> {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn accept_loop<H: ServerHooks>(
    listener: TcpListener,
    shared: Arc<Shared<H>>,
    config: NetworkConfig,
    runtime: Handle,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
                continue;
            }
        };

        tracing::debug!("New connection from {}", addr);
        let client = Connection::new(
            ConnectionOwner::Server,
            &config,
            shared.inbound.clone(),
            runtime.clone(),
        );

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        client.assign(id, addr);

        if !shared.hooks.on_connect(&client) {
            tracing::info!("Connection from {} rejected", addr);
            client.destroy();
            // Only this loop hands out ids, so the rejected one can be reused
            let _ = shared
                .next_id
                .compare_exchange(id + 1, id, Ordering::SeqCst, Ordering::SeqCst);
            continue;
        }

        // Connected before it becomes visible, so a concurrent sweep keeps it
        {
            let mut clients = shared.clients.lock();
            client.connect_to_client(id, stream);
            clients.insert(id, client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SystemMessage;
    use crate::test_support::wait_until;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        reject: bool,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        admitted_ids: Mutex<Vec<u32>>,
        received: Mutex<Vec<(u32, u32)>>,
    }

    impl ServerHooks for Recorder {
        fn on_connect(&self, client: &Arc<Connection>) -> bool {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.admitted_ids.lock().push(client.id());
            !self.reject
        }

        fn on_message(&self, _server: &ServerManager<Self>, message: Message) {
            let from = message.owner().map_or(0, |c| c.id());
            self.received.lock().push((from, message.type_id()));
        }

        fn on_disconnect(&self, _client: &Arc<Connection>) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame(type_id: u32, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&type_id.to_ne_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    fn started(hooks: Recorder) -> (ServerManager<Recorder>, SocketAddr) {
        let mut server = ServerManager::new(hooks, NetworkConfig::new(0));
        server.start().unwrap();
        let port = server.local_addr().unwrap().port();
        (server, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    #[test]
    fn test_start_and_destroy() {
        let (mut server, _) = started(Recorder::default());
        assert!(server.is_running());
        assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));

        server.destroy();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        assert!(matches!(server.stop(), Err(ServerError::NotRunning)));
    }

    #[test]
    fn test_bind_failure_is_synchronous() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = ServerManager::new((), NetworkConfig::default());
        let result = server.init(port, 1024);
        assert!(matches!(result, Err(ServerError::BindFailed(_))));
        assert!(!server.is_running());
    }

    #[test]
    fn test_ids_start_at_first_client_id() {
        let (server, addr) = started(Recorder::default());
        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();

        assert!(wait_until(|| server.client_count() == 2));
        assert_eq!(server.client_ids(), vec![FIRST_CLIENT_ID, FIRST_CLIENT_ID + 1]);
    }

    #[test]
    fn test_on_connect_sees_assigned_id() {
        let (server, addr) = started(Recorder::default());
        let _a = TcpStream::connect(addr).unwrap();
        assert!(wait_until(|| server.client_count() == 1));
        let _b = TcpStream::connect(addr).unwrap();
        assert!(wait_until(|| server.client_count() == 2));

        let seen = server.hooks().admitted_ids.lock().clone();
        assert_eq!(seen, server.client_ids());
        assert_eq!(seen, vec![FIRST_CLIENT_ID, FIRST_CLIENT_ID + 1]);

        let client = server.client(FIRST_CLIENT_ID).unwrap();
        assert!(client.remote_addr().unwrap().ip().is_loopback());
    }

    #[test]
    fn test_rejected_id_is_reused() {
        let (server, addr) = started(Recorder {
            reject: true,
            ..Default::default()
        });

        for expected in 1..=2 {
            let _stream = TcpStream::connect(addr).unwrap();
            assert!(wait_until(|| server.hooks().connects.load(Ordering::SeqCst) == expected));
        }

        let seen = server.hooks().admitted_ids.lock().clone();
        assert_eq!(seen, vec![FIRST_CLIENT_ID, FIRST_CLIENT_ID]);
    }

    #[test]
    fn test_admission_races_with_update() {
        const CLIENTS: usize = 64;
        let (server, addr) = started(Recorder::default());

        let connector = std::thread::spawn(move || {
            (0..CLIENTS)
                .map(|_| TcpStream::connect(addr).unwrap())
                .collect::<Vec<_>>()
        });

        // Sweep as fast as possible while sockets are being admitted
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() < CLIENTS && Instant::now() < deadline {
            server.update(None);
        }
        let _streams = connector.join().unwrap();
        server.update(None);

        assert_eq!(server.client_count(), CLIENTS);
        assert_eq!(server.hooks().disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejected_client_is_dropped() {
        let (server, addr) = started(Recorder {
            reject: true,
            ..Default::default()
        });
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(server.hooks().connects.load(Ordering::SeqCst), 1);
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_update_dispatches_with_owner() {
        let (server, addr) = started(Recorder::default());
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(&frame(10, &[])).unwrap();
        stream.write_all(&frame(11, &5u32.to_ne_bytes())).unwrap();

        assert!(wait_until(|| server.inbound().len() == 2));
        assert_eq!(server.update(Some(1)), 1);
        assert_eq!(server.update(None), 1);
        assert_eq!(server.update(None), 0);

        let received = server.hooks().received.lock().clone();
        assert_eq!(received, vec![(FIRST_CLIENT_ID, 10), (FIRST_CLIENT_ID, 11)]);
    }

    #[test]
    fn test_message_client_by_id() {
        let (server, addr) = started(Recorder::default());
        let mut stream = TcpStream::connect(addr).unwrap();
        assert!(wait_until(|| server.client_count() == 1));

        assert!(matches!(
            server.message_client_id(7, Message::new(5)),
            Err(ServerError::UnknownClient(7))
        ));
        assert!(matches!(
            server.message_client_id(FIRST_CLIENT_ID, Message::system(SystemMessage::Connected)),
            Err(ServerError::Connection(_))
        ));

        let mut msg = Message::new(5);
        msg.push(&42u16);
        server.message_client_id(FIRST_CLIENT_ID, msg).unwrap();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf.to_vec(), frame(5, &42u16.to_ne_bytes()));
    }

    #[test]
    fn test_dead_client_reported_once() {
        let (server, addr) = started(Recorder::default());
        let stream = TcpStream::connect(addr).unwrap();
        assert!(wait_until(|| server.client_count() == 1));
        let client = server.client(FIRST_CLIENT_ID).unwrap();

        drop(stream);
        assert!(wait_until(|| !client.is_connected()));

        assert!(matches!(
            server.message_client(&client, Message::new(5)),
            Err(ServerError::ClientDisconnected(FIRST_CLIENT_ID))
        ));
        server.update(None);
        server.update(None);

        assert_eq!(server.hooks().disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(server.client_count(), 0);
    }
}
