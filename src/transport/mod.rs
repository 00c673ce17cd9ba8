//! Transport Layer
//!
//! Responsibilities:
//! - Define the contract this crate expects from a reliable-UDP streaming
//!   transport library (sockets, options, message send/receive, event set,
//!   statistics)
//! - NO protocol implementation, NO retransmission, NO encryption
//!
//! The transport is an external collaborator. Everything above it (the
//! endpoint lifecycle, the worker threads, the callback contract) talks to
//! it exclusively through the [`Transport`] trait, so any library exposing
//! blocking socket-style primitives can be plugged in. [`MemoryTransport`]
//! is the in-process implementation used by the test suite and by
//! embedders that want hermetic wiring.

mod memory;

pub use memory::MemoryTransport;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Handle to one transport socket. Copyable id, not an owning resource;
/// the endpoint owns the socket from accept/connect until close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to one event set (readiness-notification group)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollId(u64);

impl PollId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Payload scheduling profile. Only live mode is defined by this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Live,
}

/// Socket options, applied by the socket factory in the order listed here
#[derive(Debug, Clone, PartialEq)]
pub enum SocketOption {
    /// Reorder window size in packets
    ReorderWindow(i32),
    /// Retransmission window / transmission delay in milliseconds
    Latency(i32),
    /// Extra bandwidth percentage allowed for retransmissions
    Overhead(i32),
    /// Maximum transmission unit in bytes
    Mtu(i32),
    /// Connection considered broken after this idle interval (milliseconds)
    PeerIdleTimeout(i32),
    /// Pre-shared key; never applied when empty
    Passphrase(String),
    /// Opaque stream identifier delivered to the server at connect time
    StreamId(String),
    /// Payload scheduling profile
    TransportType(TransportType),
}

/// Readiness reported by the event set for one socket
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketEvents {
    /// At least one whole message is available to receive
    pub readable: bool,
    /// The connection is broken; only close is meaningful now
    pub broken: bool,
}

/// Per-message metadata carried with send and receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageControl {
    /// Time-to-live in milliseconds; -1 means no limit
    pub ttl: i32,
    /// Deliver only in order
    pub in_order: bool,
    /// Source timestamp in microseconds; 0 lets the transport stamp it
    pub source_time: u64,
    /// Message sequence number assigned by the transport
    pub message_number: i32,
}

impl Default for MessageControl {
    fn default() -> Self {
        Self {
            ttl: -1,
            in_order: false,
            source_time: 0,
            message_number: 0,
        }
    }
}

/// Connection information fetched when a connection is established
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Transport protocol version of the peer
    pub peer_version: String,
    /// Latency negotiated with the peer, in milliseconds
    pub negotiated_latency: i32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            peer_version: "n/a".to_string(),
            negotiated_latency: -1,
        }
    }
}

/// Statistics snapshot for one socket
///
/// `pkt_sent` / `pkt_recv` count since the last clearing read; the `_total`
/// counters never reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    /// Milliseconds since the socket was created
    pub ms_time_stamp: i64,
    pub pkt_sent_total: i64,
    pub pkt_recv_total: i64,
    pub pkt_retrans_total: i64,
    pub byte_sent_total: u64,
    pub byte_recv_total: u64,
    pub pkt_sent: i64,
    pub pkt_recv: i64,
    pub pkt_send_loss: i64,
    pub pkt_recv_loss: i64,
    pub rtt_ms: f64,
    pub mbps_send_rate: f64,
    pub mbps_recv_rate: f64,
}

/// Contract for the external reliable-UDP streaming transport
///
/// All calls are blocking; the ones that can block indefinitely in a native
/// implementation (`accept`, `connect`, `wait`) take an explicit bound so
/// the endpoint workers can observe their activity flags. Implementations
/// must be safe to call from multiple threads: the endpoint sends from
/// application threads while its dispatcher receives.
pub trait Transport: Send + Sync {
    /// Create an unconfigured socket
    fn open_socket(&self) -> Result<SocketId>;

    /// Apply one option to a socket; called before bind/connect only
    fn set_option(&self, socket: SocketId, option: SocketOption) -> Result<()>;

    /// Bind a socket to a local address; port 0 picks an unused port
    fn bind(&self, socket: SocketId, addr: SocketAddr) -> Result<()>;

    /// Start accepting connections on a bound socket
    fn listen(&self, socket: SocketId, backlog: usize) -> Result<()>;

    /// Accept one pending connection. `Ok(None)` on timeout; an error means
    /// the listener is no longer usable (typically closed by stop).
    fn accept(
        &self,
        socket: SocketId,
        timeout: Duration,
    ) -> Result<Option<(SocketId, SocketAddr)>>;

    /// Connect to a listening peer, completing the handshake (including
    /// pre-shared-key verification) within the timeout
    fn connect(&self, socket: SocketId, remote: SocketAddr, timeout: Duration) -> Result<()>;

    /// Send one message; the transport preserves message boundaries
    fn send(&self, socket: SocketId, data: &[u8], ctrl: &MessageControl) -> Result<()>;

    /// Receive one whole message into `buf`, returning its length and the
    /// sender's message control record. Zero means end-of-stream.
    fn recv(&self, socket: SocketId, buf: &mut [u8]) -> Result<(usize, MessageControl)>;

    /// Close a socket; idempotence is not required, double close may error
    fn close(&self, socket: SocketId) -> Result<()>;

    /// Local address of a bound or connected socket
    fn local_addr(&self, socket: SocketId) -> Result<SocketAddr>;

    /// Remote address of a connected socket
    fn peer_addr(&self, socket: SocketId) -> Result<SocketAddr>;

    /// Stream identifier carried by the connect handshake; empty when unset
    fn stream_id(&self, socket: SocketId) -> Result<String>;

    /// Connection information of an established socket; defaults when the
    /// socket never connected
    fn connection_info(&self, socket: SocketId) -> ConnectionInfo;

    /// Statistics for one socket. `clear` resets the interval counters
    /// after reading; `instantaneous` selects spot values over smoothed
    /// ones where the transport distinguishes them.
    fn statistics(&self, socket: SocketId, clear: bool, instantaneous: bool)
        -> Result<Statistics>;

    /// Largest payload accepted by `send` in live mode
    fn max_payload_size(&self) -> usize;

    /// Create an event set
    fn create_poll(&self) -> Result<PollId>;

    /// Register a socket with an event set. Registration wakes a blocked
    /// `wait` so a dispatcher picks up new peers promptly.
    fn add_to_poll(&self, poll: PollId, socket: SocketId) -> Result<()>;

    /// Remove a socket from an event set
    fn remove_from_poll(&self, poll: PollId, socket: SocketId) -> Result<()>;

    /// Wait until at least one registered socket is ready or the timeout
    /// elapses; a timeout returns an empty list
    fn wait(&self, poll: PollId, timeout: Duration) -> Result<Vec<(SocketId, SocketEvents)>>;

    /// Destroy an event set
    fn release_poll(&self, poll: PollId) -> Result<()>;
}
