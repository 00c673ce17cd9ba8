//! Endpoint lifecycle
//!
//! Responsibilities:
//! - own the transport handles, the event set and the worker threads
//! - enforce the server/client mode state machine (start, stop, reconnect)
//! - hold the peer-context registry and the application callback slots
//!
//! One [`Endpoint`] is either idle, a server or a client. A multi-peer
//! server runs two workers (acceptor + event dispatcher), a single-peer
//! server runs one combined worker, and a client runs two (reconnector +
//! event dispatcher). All workers observe their activity flag within a
//! bounded interval, so `stop` never hangs: it flips the flag, closes the
//! bound handle to unblock an in-flight accept, joins the workers and only
//! then drains the peer registry. No callback runs after `stop` returns.
//!
//! Callbacks must not call back into `start_*`/`stop` on the same endpoint;
//! they run on the worker threads that `stop` joins.

mod client;
mod dispatch;
mod factory;
mod server;

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ClientOptions, Config, ServerOptions};
use crate::error::{Error, Result};
use crate::transport::{ConnectionInfo, MessageControl, PollId, SocketId, Statistics, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Bound for one synchronous connect attempt (address use + handshake)
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Event-set wait bound; also the stop latency bound for the dispatcher
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Accept bound so the acceptor observes the activity flags promptly
pub(crate) const ACCEPT_TIMEOUT: Duration = Duration::from_millis(250);

// ============================================================================
// Public types
// ============================================================================

/// Operating mode of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Unset,
    Server,
    Client,
}

/// Application state bound to one peer for the lifetime of the connection
///
/// The core never inspects the payload; it only hands the shared context
/// back in receive and disconnect callbacks.
pub struct PeerContext {
    object: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PeerContext {
    /// Create an empty shared context
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            object: Mutex::new(None),
        })
    }

    /// Create a shared context holding `value`
    pub fn with_value<T: Any + Send>(value: T) -> Arc<Self> {
        let ctx = Self::new();
        ctx.set(value);
        ctx
    }

    /// Replace the stored payload
    pub fn set<T: Any + Send>(&self, value: T) {
        *self.object.lock() = Some(Box::new(value));
    }

    /// Clone the stored payload out, if it has type `T`
    pub fn get<T: Any + Clone>(&self) -> Option<T> {
        self.object.lock().as_ref().and_then(|v| v.downcast_ref::<T>()).cloned()
    }
}

/// Server callback invoked once per accepted peer. Returning a context
/// registers the peer; returning `None` refuses and closes it.
pub type OnPeerConnected = dyn Fn(SocketAddr, SocketId, Option<Arc<PeerContext>>, &ConnectionInfo) -> Option<Arc<PeerContext>>
    + Send
    + Sync;

/// Owning-buffer receive callback. Preferred when both receive slots are set.
pub type OnData = dyn Fn(Vec<u8>, MessageControl, Option<Arc<PeerContext>>, SocketId) + Send + Sync;

/// Borrowed-buffer receive callback; the slice is valid only for the call
/// and saves one allocation per message.
pub type OnDataNoCopy =
    dyn Fn(&[u8], &MessageControl, Option<Arc<PeerContext>>, SocketId) + Send + Sync;

/// Disconnect callback, fired in server and client mode alike
pub type OnPeerDisconnected = dyn Fn(Option<Arc<PeerContext>>, SocketId) + Send + Sync;

/// Client callback fired whenever a connection to the server is established
pub type OnConnectedToServer =
    dyn Fn(Option<Arc<PeerContext>>, SocketId, &ConnectionInfo) + Send + Sync;

// ============================================================================
// Shared worker state
// ============================================================================

#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) peer_connected: RwLock<Option<Arc<OnPeerConnected>>>,
    pub(crate) data: RwLock<Option<Arc<OnData>>>,
    pub(crate) data_no_copy: RwLock<Option<Arc<OnDataNoCopy>>>,
    pub(crate) peer_disconnected: RwLock<Option<Arc<OnPeerDisconnected>>>,
    pub(crate) connected_to_server: RwLock<Option<Arc<OnConnectedToServer>>>,
}

/// Everything the worker threads share with the controlling handle
pub(crate) struct Shared {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) log_prefix: String,
    pub(crate) server_active: AtomicBool,
    pub(crate) client_active: AtomicBool,
    pub(crate) client_connected: AtomicBool,
    pub(crate) bound: Mutex<Option<SocketId>>,
    pub(crate) poll: Mutex<Option<PollId>>,
    pub(crate) peers: Mutex<HashMap<SocketId, Arc<PeerContext>>>,
    pub(crate) client_ctx: Mutex<Option<Arc<PeerContext>>>,
    pub(crate) connection_ctx: Mutex<Option<Arc<PeerContext>>>,
    pub(crate) config: RwLock<Config>,
    pub(crate) callbacks: Callbacks,
}

struct State {
    mode: Mode,
    workers: Vec<JoinHandle<()>>,
}

// ============================================================================
// Endpoint
// ============================================================================

/// One session endpoint over an external reliable-UDP streaming transport
///
/// Runs as a server accepting one or many peers, or as a client that keeps
/// reconnecting to a server until stopped. Not clonable; share it behind an
/// `Arc` if several threads need to drive it.
pub struct Endpoint {
    shared: Arc<Shared>,
    state: Mutex<State>,
}

impl Endpoint {
    /// Create an idle endpoint on the given transport
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_log_prefix(transport, "endpoint")
    }

    /// Create an idle endpoint whose own log lines carry `prefix` (the
    /// transport library's logs are unaffected; see [`crate::log`])
    pub fn with_log_prefix(transport: Arc<dyn Transport>, prefix: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                log_prefix: prefix.into(),
                server_active: AtomicBool::new(false),
                client_active: AtomicBool::new(false),
                client_connected: AtomicBool::new(false),
                bound: Mutex::new(None),
                poll: Mutex::new(None),
                peers: Mutex::new(HashMap::new()),
                client_ctx: Mutex::new(None),
                connection_ctx: Mutex::new(None),
                config: RwLock::new(Config::default()),
                callbacks: Callbacks::default(),
            }),
            state: Mutex::new(State {
                mode: Mode::Unset,
                workers: Vec::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Callback slots
    // ------------------------------------------------------------------

    /// Server slot: a peer completed the handshake. Required before
    /// `start_server`.
    pub fn on_peer_connected<F>(&self, callback: F)
    where
        F: Fn(SocketAddr, SocketId, Option<Arc<PeerContext>>, &ConnectionInfo) -> Option<Arc<PeerContext>>
            + Send
            + Sync
            + 'static,
    {
        *self.shared.callbacks.peer_connected.write() = Some(Arc::new(callback));
    }

    /// Receive slot, owning-buffer variant
    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(Vec<u8>, MessageControl, Option<Arc<PeerContext>>, SocketId) + Send + Sync + 'static,
    {
        *self.shared.callbacks.data.write() = Some(Arc::new(callback));
    }

    /// Receive slot, borrowed-buffer variant. Only consulted when the
    /// owning variant is unset.
    pub fn on_data_no_copy<F>(&self, callback: F)
    where
        F: Fn(&[u8], &MessageControl, Option<Arc<PeerContext>>, SocketId) + Send + Sync + 'static,
    {
        *self.shared.callbacks.data_no_copy.write() = Some(Arc::new(callback));
    }

    /// Disconnect slot, fired exactly once per retired peer
    pub fn on_peer_disconnected<F>(&self, callback: F)
    where
        F: Fn(Option<Arc<PeerContext>>, SocketId) + Send + Sync + 'static,
    {
        *self.shared.callbacks.peer_disconnected.write() = Some(Arc::new(callback));
    }

    /// Client slot: the connection to the server was established
    pub fn on_connected_to_server<F>(&self, callback: F)
    where
        F: Fn(Option<Arc<PeerContext>>, SocketId, &ConnectionInfo) + Send + Sync + 'static,
    {
        *self.shared.callbacks.connected_to_server.write() = Some(Arc::new(callback));
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start a server on `local_host:local_port` (port 0 lets the transport
    /// pick one). `context` is handed to every peer-connected callback.
    pub fn start_server(
        &self,
        local_host: &str,
        local_port: u16,
        options: ServerOptions,
        context: Option<Arc<PeerContext>>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode != Mode::Unset {
            return Err(Error::AlreadyRunning(state.mode));
        }
        if self.shared.callbacks.peer_connected.read().is_none() {
            return Err(Error::MissingCallback("on_peer_connected"));
        }
        let single_peer = options.single_peer;
        *self.shared.config.write() = Config::for_server(local_host, local_port, &options);
        *self.shared.connection_ctx.lock() = context;
        state.mode = Mode::Server;
        self.shared.server_active.store(true, Ordering::Release);

        if let Err(e) = self.start_server_workers(&mut state, single_peer) {
            warn!("[{}] failed to start server: {}", self.shared.log_prefix, e);
            self.teardown(&mut state);
            return Err(e);
        }
        Ok(())
    }

    /// Start a client against `remote_host:remote_port` without binding a
    /// specific local address
    pub fn start_client(
        &self,
        remote_host: &str,
        remote_port: u16,
        options: ClientOptions,
        context: Arc<PeerContext>,
    ) -> Result<()> {
        self.start_client_inner(remote_host, remote_port, None, options, context)
    }

    /// Start a client bound to `local_host:local_port` before connecting.
    /// An empty or unparseable local host fails without a connect attempt.
    pub fn start_client_bound(
        &self,
        remote_host: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
        options: ClientOptions,
        context: Arc<PeerContext>,
    ) -> Result<()> {
        self.start_client_inner(
            remote_host,
            remote_port,
            Some((local_host, local_port)),
            options,
            context,
        )
    }

    fn start_client_inner(
        &self,
        remote_host: &str,
        remote_port: u16,
        local: Option<(&str, u16)>,
        options: ClientOptions,
        context: Arc<PeerContext>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode != Mode::Unset {
            return Err(Error::AlreadyRunning(state.mode));
        }
        let fail_on_connection_error = options.fail_on_connection_error;
        *self.shared.config.write() = Config::for_client(remote_host, remote_port, local, &options);
        *self.shared.client_ctx.lock() = Some(context);
        state.mode = Mode::Client;
        self.shared.client_active.store(true, Ordering::Release);

        if let Err(e) = self.start_client_workers(&mut state, fail_on_connection_error) {
            debug!("[{}] failed to start client: {}", self.shared.log_prefix, e);
            self.teardown(&mut state);
            return Err(e);
        }
        Ok(())
    }

    fn start_server_workers(&self, state: &mut State, single_peer: bool) -> Result<()> {
        let transport = &self.shared.transport;
        let listener =
            factory::create_server_socket(transport.as_ref(), &self.shared.config.read())?;
        *self.shared.bound.lock() = Some(listener);
        let poll = transport.create_poll()?;
        *self.shared.poll.lock() = Some(poll);
        transport.add_to_poll(poll, listener)?;
        let local = transport.local_addr(listener)?;

        if single_peer {
            let shared = self.shared.clone();
            state.workers.push(spawn_worker("streamnet-server", move || {
                server::run_single_peer(shared, poll)
            })?);
        } else {
            let shared = self.shared.clone();
            state.workers.push(spawn_worker("streamnet-accept", move || {
                server::run_acceptor(shared, listener, poll)
            })?);
            let shared = self.shared.clone();
            state.workers.push(spawn_worker("streamnet-dispatch", move || {
                dispatch::run_event_loop(&shared, poll, dispatch::DispatchMode::MultiPeer)
            })?);
        }
        info!(
            "[{}] server listening on {} ({})",
            self.shared.log_prefix,
            local,
            if single_peer { "single peer" } else { "multi peer" }
        );
        Ok(())
    }

    fn start_client_workers(&self, state: &mut State, fail_on_connection_error: bool) -> Result<()> {
        let transport = &self.shared.transport;
        let poll = transport.create_poll()?;
        *self.shared.poll.lock() = Some(poll);

        // one synchronous attempt within the fixed connect timeout
        let connected = match client::connect_once(&self.shared) {
            Ok(socket) => {
                *self.shared.bound.lock() = Some(socket);
                transport.add_to_poll(poll, socket)?;
                self.shared.client_connected.store(true, Ordering::Release);
                Some(socket)
            }
            Err(e) if e.is_configuration() || fail_on_connection_error => return Err(e),
            Err(e) => {
                debug!(
                    "[{}] first connection attempt failed, retrying in background: {}",
                    self.shared.log_prefix, e
                );
                None
            }
        };

        let shared = self.shared.clone();
        state.workers.push(spawn_worker("streamnet-reconnect", move || {
            client::run_reconnector(shared, poll)
        })?);
        let shared = self.shared.clone();
        state.workers.push(spawn_worker("streamnet-dispatch", move || {
            dispatch::run_event_loop(&shared, poll, dispatch::DispatchMode::Client)
        })?);

        if let Some(socket) = connected {
            let info = transport.connection_info(socket);
            let ctx = self.shared.client_ctx.lock().clone();
            if let Some(cb) = self.shared.callbacks.connected_to_server.read().clone() {
                cb(ctx, socket, &info);
            }
            let config = self.shared.config.read();
            info!(
                "[{}] connected to {}:{}",
                self.shared.log_prefix, config.remote_host, config.remote_port
            );
        }
        Ok(())
    }

    /// Stop the endpoint. Idempotent; after it returns no callback fires
    /// and every handle, poll set and worker thread is released.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode == Mode::Unset {
            return Ok(());
        }
        info!(
            "[{}] stopping {:?} endpoint",
            self.shared.log_prefix, state.mode
        );
        self.teardown(&mut state);
        Ok(())
    }

    fn teardown(&self, state: &mut State) {
        // signal the workers, then unblock them by closing the bound handle
        self.shared.server_active.store(false, Ordering::Release);
        self.shared.client_active.store(false, Ordering::Release);
        self.shared.client_connected.store(false, Ordering::Release);
        if let Some(socket) = self.shared.bound.lock().take() {
            let _ = self.shared.transport.close(socket);
        }
        for worker in state.workers.drain(..) {
            let _ = worker.join();
        }
        // retire every remaining peer and tell the application about each
        let drained: Vec<(SocketId, Arc<PeerContext>)> =
            self.shared.peers.lock().drain().collect();
        let on_disconnect = self.shared.callbacks.peer_disconnected.read().clone();
        for (socket, ctx) in drained {
            let _ = self.shared.transport.close(socket);
            if let Some(cb) = &on_disconnect {
                cb(Some(ctx), socket);
            }
        }
        if let Some(poll) = self.shared.poll.lock().take() {
            let _ = self.shared.transport.release_poll(poll);
        }
        *self.shared.client_ctx.lock() = None;
        *self.shared.connection_ctx.lock() = None;
        state.mode = Mode::Unset;
    }

    // ------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------

    /// Send one message. Client mode ignores `target` and uses the
    /// connected handle; server mode requires `target`. Payloads above the
    /// transport's live maximum fail locally without a transport call.
    pub fn send_data(
        &self,
        data: &[u8],
        ctrl: &MessageControl,
        target: Option<SocketId>,
    ) -> Result<()> {
        let max = self.shared.transport.max_payload_size();
        if data.len() > max {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }
        let socket = self.select_socket(target)?;
        self.shared.transport.send(socket, data, ctrl)
    }

    /// Statistics for the connected handle (client) or `target` (server).
    /// `clear` resets interval counters after reading; `instantaneous`
    /// selects spot values over smoothed ones.
    pub fn statistics(
        &self,
        clear: bool,
        instantaneous: bool,
        target: Option<SocketId>,
    ) -> Result<Statistics> {
        let socket = self.select_socket(target)?;
        self.shared.transport.statistics(socket, clear, instantaneous)
    }

    fn select_socket(&self, target: Option<SocketId>) -> Result<SocketId> {
        if self.shared.client_active.load(Ordering::Acquire) {
            if !self.shared.client_connected.load(Ordering::Acquire) {
                return Err(Error::NotConnected);
            }
            (*self.shared.bound.lock()).ok_or(Error::NotConnected)
        } else if self.shared.server_active.load(Ordering::Acquire) {
            target.ok_or(Error::MissingTarget)
        } else {
            Err(Error::NotConnected)
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Snapshot of all connected peers and their contexts (server mode)
    pub fn active_clients(&self) -> Vec<(SocketId, Arc<PeerContext>)> {
        let peers = self.shared.peers.lock();
        let mut clients: Vec<_> = peers.iter().map(|(s, c)| (*s, c.clone())).collect();
        clients.sort_by_key(|(s, _)| *s);
        clients
    }

    /// Sockets of all connected peers (server mode)
    pub fn active_client_sockets(&self) -> Vec<SocketId> {
        self.active_clients().into_iter().map(|(s, _)| s).collect()
    }

    /// The connected server's socket and the client context, when this
    /// endpoint is a connected client
    pub fn connected_server(&self) -> Option<(SocketId, Arc<PeerContext>)> {
        if !self.is_connected_to_server() {
            return None;
        }
        let socket = (*self.shared.bound.lock())?;
        let ctx = self.shared.client_ctx.lock().clone()?;
        Some((socket, ctx))
    }

    /// True while a client endpoint holds an established connection
    pub fn is_connected_to_server(&self) -> bool {
        self.shared.client_connected.load(Ordering::Acquire)
    }

    /// The bound handle: the listener (server) or the connected socket
    /// (client); `None` when idle
    pub fn bound_socket(&self) -> Option<SocketId> {
        *self.shared.bound.lock()
    }

    /// The locally bound port, useful after starting with port 0
    pub fn local_port(&self) -> Option<u16> {
        let socket = (*self.shared.bound.lock())?;
        self.shared
            .transport
            .local_addr(socket)
            .ok()
            .map(|a| a.port())
    }

    /// Current operating mode
    pub fn current_mode(&self) -> Mode {
        if self.shared.server_active.load(Ordering::Acquire) {
            Mode::Server
        } else if self.shared.client_active.load(Ordering::Acquire) {
            Mode::Client
        } else {
            Mode::Unset
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn spawn_worker<F>(name: &str, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn transport() -> Arc<dyn Transport> {
        Arc::new(MemoryTransport::new())
    }

    #[test]
    fn test_peer_context_carries_any_value() {
        let ctx = PeerContext::with_value(42i32);
        assert_eq!(ctx.get::<i32>(), Some(42));
        assert_eq!(ctx.get::<String>(), None);
        ctx.set("replaced".to_string());
        assert_eq!(ctx.get::<String>(), Some("replaced".to_string()));
    }

    #[test]
    fn test_start_server_requires_peer_connected_callback() {
        let endpoint = Endpoint::new(transport());
        let result = endpoint.start_server("127.0.0.1", 0, ServerOptions::default(), None);
        assert!(matches!(result, Err(Error::MissingCallback(_))));
        assert_eq!(endpoint.current_mode(), Mode::Unset);
    }

    #[test]
    fn test_roles_are_mutually_exclusive() {
        let endpoint = Endpoint::new(transport());
        endpoint.on_peer_connected(|_, _, ctx, _| ctx);
        endpoint
            .start_server("127.0.0.1", 0, ServerOptions::default(), None)
            .unwrap();
        let result = endpoint.start_client(
            "127.0.0.1",
            9999,
            ClientOptions::default(),
            PeerContext::new(),
        );
        assert!(matches!(result, Err(Error::AlreadyRunning(Mode::Server))));
        endpoint.stop().unwrap();
    }

    #[test]
    fn test_stop_is_idempotent_and_resets_accessors() {
        let endpoint = Endpoint::new(transport());
        endpoint.on_peer_connected(|_, _, ctx, _| ctx);
        endpoint
            .start_server("127.0.0.1", 0, ServerOptions::default(), None)
            .unwrap();
        assert_eq!(endpoint.current_mode(), Mode::Server);
        assert!(endpoint.bound_socket().is_some());
        assert!(endpoint.local_port().unwrap() > 1024);

        endpoint.stop().unwrap();
        endpoint.stop().unwrap();
        assert_eq!(endpoint.current_mode(), Mode::Unset);
        assert!(endpoint.bound_socket().is_none());
        assert!(endpoint.local_port().is_none());
        assert!(endpoint.active_client_sockets().is_empty());
        assert!(!endpoint.is_connected_to_server());
    }

    #[test]
    fn test_send_without_start_is_not_connected() {
        let endpoint = Endpoint::new(transport());
        let result = endpoint.send_data(b"hello", &MessageControl::default(), None);
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[test]
    fn test_oversize_send_rejected_locally() {
        let endpoint = Endpoint::new(transport());
        let max = endpoint.shared.transport.max_payload_size();
        let oversize = vec![1u8; max + 1];
        let result = endpoint.send_data(&oversize, &MessageControl::default(), None);
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    }
}
