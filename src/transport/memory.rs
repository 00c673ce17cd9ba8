//! In-memory transport
//!
//! A loopback implementation of the [`Transport`] contract that never
//! touches the network: connects, handshakes (including pre-shared-key
//! verification and stream-id propagation), message queues, event sets and
//! per-socket counters all live in one process. Used by the test suite and
//! by embedders that want hermetic wiring between endpoints.
//!
//! It deliberately implements NO reliability machinery: no pacing, no
//! retransmission, no loss. Delivery is immediate and lossless, so the
//! smoothed and instantaneous statistics views coincide.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::log::{transport_log, LogLevel};

use super::{
    ConnectionInfo, MessageControl, PollId, SocketEvents, SocketId, SocketOption, Statistics,
    Transport, TransportType,
};

/// Largest live-mode payload: a 1500-byte MTU minus UDP and transport
/// headers, mirroring the native reliable-UDP libraries this crate wraps.
pub const LIVE_MAX_PAYLOAD: usize = 1456;

/// Protocol version reported for in-memory connections
const MEMORY_TRANSPORT_VERSION: &str = "mem-1.0";

/// Ephemeral port range for automatic assignment
const EPHEMERAL_PORT_MIN: u16 = 32768;
const EPHEMERAL_PORT_MAX: u16 = 60999;

// The handshake consumes psk, latency and stream id; the other knobs have
// nothing to drive on a lossless in-process link.
#[allow(dead_code)]
#[derive(Debug, Clone, Default)]
struct Options {
    reorder_window: i32,
    latency: i32,
    overhead: i32,
    mtu: i32,
    peer_idle_timeout: i32,
    psk: String,
    stream_id: String,
    live: bool,
}

struct Message {
    payload: Vec<u8>,
    ctrl: MessageControl,
}

#[derive(Default)]
struct Counters {
    pkt_sent_total: i64,
    pkt_recv_total: i64,
    byte_sent_total: u64,
    byte_recv_total: u64,
    pkt_sent: i64,
    pkt_recv: i64,
}

struct Socket {
    options: Options,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    peer: Option<u64>,
    listening: bool,
    /// Fully handshaken connections waiting for `accept`:
    /// (accepted-side socket, peer address)
    backlog: VecDeque<(u64, SocketAddr)>,
    queue: VecDeque<Message>,
    closed: bool,
    peer_closed: bool,
    info: ConnectionInfo,
    counters: Counters,
    created: Instant,
    next_message_number: i32,
}

impl Socket {
    fn new() -> Self {
        Self {
            options: Options::default(),
            local: None,
            remote: None,
            peer: None,
            listening: false,
            backlog: VecDeque::new(),
            queue: VecDeque::new(),
            closed: false,
            peer_closed: false,
            info: ConnectionInfo::default(),
            counters: Counters::default(),
            created: Instant::now(),
            next_message_number: 1,
        }
    }
}

struct State {
    next_socket: u64,
    next_poll: u64,
    sockets: HashMap<u64, Socket>,
    polls: HashMap<u64, HashSet<u64>>,
}

/// In-process loopback transport
///
/// Addressing is per instance: two endpoints can only reach each other
/// through the same `MemoryTransport` (usually shared via `Arc`).
pub struct MemoryTransport {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_socket: 1,
                next_poll: 1,
                sockets: HashMap::new(),
                polls: HashMap::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    fn alloc_port(state: &State) -> Result<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..128 {
            let port = rng.gen_range(EPHEMERAL_PORT_MIN..=EPHEMERAL_PORT_MAX);
            let in_use = state
                .sockets
                .values()
                .any(|s| !s.closed && s.local.map_or(false, |a| a.port() == port));
            if !in_use {
                return Ok(port);
            }
        }
        Err(Error::Transport("no ephemeral ports available".into()))
    }

    fn loopback_for(remote: &SocketAddr) -> IpAddr {
        match remote {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn open_socket(&self) -> Result<SocketId> {
        let mut state = self.state.lock();
        let id = state.next_socket;
        state.next_socket += 1;
        state.sockets.insert(id, Socket::new());
        trace!("memory transport: opened socket #{}", id);
        Ok(SocketId::from_raw(id))
    }

    fn set_option(&self, socket: SocketId, option: SocketOption) -> Result<()> {
        let mut state = self.state.lock();
        let s = state
            .sockets
            .get_mut(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        if s.closed {
            return Err(Error::Closed);
        }
        match option {
            SocketOption::ReorderWindow(v) => s.options.reorder_window = v,
            SocketOption::Latency(v) => s.options.latency = v,
            SocketOption::Overhead(v) => s.options.overhead = v,
            SocketOption::Mtu(v) => s.options.mtu = v,
            SocketOption::PeerIdleTimeout(v) => s.options.peer_idle_timeout = v,
            SocketOption::Passphrase(v) => s.options.psk = v,
            SocketOption::StreamId(v) => s.options.stream_id = v,
            SocketOption::TransportType(TransportType::Live) => s.options.live = true,
        }
        Ok(())
    }

    fn bind(&self, socket: SocketId, addr: SocketAddr) -> Result<()> {
        let mut state = self.state.lock();
        {
            let s = state
                .sockets
                .get(&socket.raw())
                .ok_or(Error::InvalidSocket(socket))?;
            if s.closed {
                return Err(Error::Closed);
            }
            if s.local.is_some() {
                return Err(Error::Transport("socket is already bound".into()));
            }
        }
        let local = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), Self::alloc_port(&state)?)
        } else {
            let in_use = state.sockets.iter().any(|(id, s)| {
                *id != socket.raw()
                    && !s.closed
                    && s.local.map_or(false, |a| a.port() == addr.port())
            });
            if in_use {
                return Err(Error::Transport(format!("address {} already in use", addr)));
            }
            addr
        };
        let s = state.sockets.get_mut(&socket.raw()).expect("checked above");
        s.local = Some(local);
        debug!("memory transport: socket {} bound to {}", socket, local);
        Ok(())
    }

    fn listen(&self, socket: SocketId, _backlog: usize) -> Result<()> {
        let mut state = self.state.lock();
        let s = state
            .sockets
            .get_mut(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        if s.closed {
            return Err(Error::Closed);
        }
        if s.local.is_none() {
            return Err(Error::Transport("socket is not bound".into()));
        }
        if s.peer.is_some() {
            return Err(Error::Transport("socket is connected".into()));
        }
        s.listening = true;
        Ok(())
    }

    fn accept(
        &self,
        socket: SocketId,
        timeout: Duration,
    ) -> Result<Option<(SocketId, SocketAddr)>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let s = state
                .sockets
                .get_mut(&socket.raw())
                .ok_or(Error::InvalidSocket(socket))?;
            if s.closed {
                return Err(Error::Closed);
            }
            if !s.listening {
                return Err(Error::Transport("socket is not listening".into()));
            }
            if let Some((id, peer_addr)) = s.backlog.pop_front() {
                trace!(
                    "memory transport: listener {} accepted #{} from {}",
                    socket,
                    id,
                    peer_addr
                );
                return Ok(Some((SocketId::from_raw(id), peer_addr)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.wakeup.wait_until(&mut state, deadline);
        }
    }

    fn connect(&self, socket: SocketId, remote: SocketAddr, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        {
            let s = state
                .sockets
                .get(&socket.raw())
                .ok_or(Error::InvalidSocket(socket))?;
            if s.closed {
                return Err(Error::Closed);
            }
            if s.peer.is_some() {
                return Err(Error::Transport("socket is already connected".into()));
            }
        }

        // bind-on-connect when the caller never bound explicitly
        if state.sockets[&socket.raw()].local.is_none() {
            let port = Self::alloc_port(&state)?;
            let local = SocketAddr::new(Self::loopback_for(&remote), port);
            state.sockets.get_mut(&socket.raw()).expect("checked above").local = Some(local);
        }

        let listener_id = state.sockets.iter().find_map(|(id, s)| {
            let matches = s.listening
                && !s.closed
                && s.local.map_or(false, |a| {
                    a.port() == remote.port() && (a.ip().is_unspecified() || a.ip() == remote.ip())
                });
            matches.then_some(*id)
        });
        let Some(listener_id) = listener_id else {
            trace!("memory transport: no listener at {}", remote);
            return Err(Error::ConnectionRefused);
        };

        // the pre-shared keys of both sides must agree during the handshake
        let caller_psk = state.sockets[&socket.raw()].options.psk.clone();
        if state.sockets[&listener_id].options.psk != caller_psk {
            transport_log(
                LogLevel::Warning,
                file!(),
                line!(),
                &format!("handshake with {} failed: passphrase mismatch", remote),
            );
            return Err(Error::ConnectionRejected);
        }

        let caller_local = state.sockets[&socket.raw()].local.expect("bound above");
        let caller_latency = state.sockets[&socket.raw()].options.latency;
        let caller_stream_id = state.sockets[&socket.raw()].options.stream_id.clone();
        let listener_options = state.sockets[&listener_id].options.clone();
        let listener_local = state.sockets[&listener_id].local;
        let info = ConnectionInfo {
            peer_version: MEMORY_TRANSPORT_VERSION.to_string(),
            negotiated_latency: caller_latency.max(listener_options.latency),
        };

        // materialize the accepted side of the connection
        let accepted_id = state.next_socket;
        state.next_socket += 1;
        let mut accepted = Socket::new();
        accepted.options = listener_options;
        accepted.options.stream_id = caller_stream_id;
        accepted.local = listener_local;
        accepted.remote = Some(caller_local);
        accepted.peer = Some(socket.raw());
        accepted.info = info.clone();
        state.sockets.insert(accepted_id, accepted);

        let caller = state.sockets.get_mut(&socket.raw()).expect("checked above");
        caller.remote = Some(remote);
        caller.peer = Some(accepted_id);
        caller.info = info;

        state
            .sockets
            .get_mut(&listener_id)
            .expect("found above")
            .backlog
            .push_back((accepted_id, caller_local));
        self.wakeup.notify_all();
        debug!("memory transport: {} connected to {}", socket, remote);
        Ok(())
    }

    fn send(&self, socket: SocketId, data: &[u8], ctrl: &MessageControl) -> Result<()> {
        if data.len() > LIVE_MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                size: data.len(),
                max: LIVE_MAX_PAYLOAD,
            });
        }
        let mut state = self.state.lock();
        let s = state
            .sockets
            .get_mut(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        if s.closed {
            return Err(Error::Closed);
        }
        if s.peer_closed {
            return Err(Error::Closed);
        }
        let Some(peer_id) = s.peer else {
            return Err(Error::NotConnected);
        };
        let mut ctrl = ctrl.clone();
        ctrl.message_number = s.next_message_number;
        s.next_message_number += 1;
        if ctrl.source_time == 0 {
            ctrl.source_time = Self::now_micros();
        }
        s.counters.pkt_sent_total += 1;
        s.counters.pkt_sent += 1;
        s.counters.byte_sent_total += data.len() as u64;

        let peer = state
            .sockets
            .get_mut(&peer_id)
            .ok_or(Error::Closed)?;
        if peer.closed {
            return Err(Error::Closed);
        }
        peer.counters.pkt_recv_total += 1;
        peer.counters.pkt_recv += 1;
        peer.counters.byte_recv_total += data.len() as u64;
        peer.queue.push_back(Message {
            payload: data.to_vec(),
            ctrl,
        });
        self.wakeup.notify_all();
        Ok(())
    }

    fn recv(&self, socket: SocketId, buf: &mut [u8]) -> Result<(usize, MessageControl)> {
        let mut state = self.state.lock();
        let s = state
            .sockets
            .get_mut(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        if s.closed {
            return Err(Error::Closed);
        }
        match s.queue.pop_front() {
            Some(msg) => {
                let n = msg.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&msg.payload[..n]);
                Ok((n, msg.ctrl))
            }
            // end of stream once the peer is gone and the queue is drained
            None if s.peer_closed => Ok((0, MessageControl::default())),
            None => Err(Error::WouldBlock),
        }
    }

    fn close(&self, socket: SocketId) -> Result<()> {
        let mut state = self.state.lock();
        let s = state
            .sockets
            .get_mut(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        if s.closed {
            return Err(Error::Closed);
        }
        s.closed = true;
        s.listening = false;
        let peer = s.peer;
        let parked: Vec<u64> = s.backlog.drain(..).map(|(id, _)| id).collect();

        if let Some(peer_id) = peer {
            if let Some(p) = state.sockets.get_mut(&peer_id) {
                p.peer_closed = true;
            }
        }
        // connections handshaken but never accepted die with the listener
        for accepted_id in parked {
            let caller = state.sockets.get_mut(&accepted_id).and_then(|p| {
                p.closed = true;
                p.peer
            });
            if let Some(caller_id) = caller {
                if let Some(c) = state.sockets.get_mut(&caller_id) {
                    c.peer_closed = true;
                }
            }
        }
        for members in state.polls.values_mut() {
            members.remove(&socket.raw());
        }
        self.wakeup.notify_all();
        debug!("memory transport: closed socket {}", socket);
        Ok(())
    }

    fn local_addr(&self, socket: SocketId) -> Result<SocketAddr> {
        let state = self.state.lock();
        let s = state
            .sockets
            .get(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        if s.closed {
            return Err(Error::Closed);
        }
        s.local
            .ok_or_else(|| Error::Transport("socket is not bound".into()))
    }

    fn peer_addr(&self, socket: SocketId) -> Result<SocketAddr> {
        let state = self.state.lock();
        let s = state
            .sockets
            .get(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        if s.closed {
            return Err(Error::Closed);
        }
        s.remote.ok_or(Error::NotConnected)
    }

    fn stream_id(&self, socket: SocketId) -> Result<String> {
        let state = self.state.lock();
        let s = state
            .sockets
            .get(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        Ok(s.options.stream_id.clone())
    }

    fn connection_info(&self, socket: SocketId) -> ConnectionInfo {
        let state = self.state.lock();
        state
            .sockets
            .get(&socket.raw())
            .map(|s| s.info.clone())
            .unwrap_or_default()
    }

    fn statistics(
        &self,
        socket: SocketId,
        clear: bool,
        _instantaneous: bool,
    ) -> Result<Statistics> {
        let mut state = self.state.lock();
        let s = state
            .sockets
            .get_mut(&socket.raw())
            .ok_or(Error::InvalidSocket(socket))?;
        let stats = Statistics {
            ms_time_stamp: s.created.elapsed().as_millis() as i64,
            pkt_sent_total: s.counters.pkt_sent_total,
            pkt_recv_total: s.counters.pkt_recv_total,
            pkt_retrans_total: 0,
            byte_sent_total: s.counters.byte_sent_total,
            byte_recv_total: s.counters.byte_recv_total,
            pkt_sent: s.counters.pkt_sent,
            pkt_recv: s.counters.pkt_recv,
            pkt_send_loss: 0,
            pkt_recv_loss: 0,
            rtt_ms: 0.0,
            mbps_send_rate: 0.0,
            mbps_recv_rate: 0.0,
        };
        if clear {
            s.counters.pkt_sent = 0;
            s.counters.pkt_recv = 0;
        }
        Ok(stats)
    }

    fn max_payload_size(&self) -> usize {
        LIVE_MAX_PAYLOAD
    }

    fn create_poll(&self) -> Result<PollId> {
        let mut state = self.state.lock();
        let id = state.next_poll;
        state.next_poll += 1;
        state.polls.insert(id, HashSet::new());
        Ok(PollId::from_raw(id))
    }

    fn add_to_poll(&self, poll: PollId, socket: SocketId) -> Result<()> {
        let mut state = self.state.lock();
        match state.sockets.get(&socket.raw()) {
            Some(s) if !s.closed => {}
            _ => return Err(Error::InvalidSocket(socket)),
        }
        state
            .polls
            .get_mut(&poll.raw())
            .ok_or_else(|| Error::Transport("unknown event set".into()))?
            .insert(socket.raw());
        // registration doubles as the new-peer signal for a blocked wait
        self.wakeup.notify_all();
        Ok(())
    }

    fn remove_from_poll(&self, poll: PollId, socket: SocketId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .polls
            .get_mut(&poll.raw())
            .ok_or_else(|| Error::Transport("unknown event set".into()))?
            .remove(&socket.raw());
        Ok(())
    }

    fn wait(&self, poll: PollId, timeout: Duration) -> Result<Vec<(SocketId, SocketEvents)>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let members = state
                .polls
                .get(&poll.raw())
                .ok_or_else(|| Error::Transport("unknown event set".into()))?;
            let mut ready: Vec<(SocketId, SocketEvents)> = Vec::new();
            for id in members {
                let Some(s) = state.sockets.get(id) else {
                    continue;
                };
                // accept readiness is delivered through accept(), not here
                if s.listening || s.closed {
                    continue;
                }
                let readable = !s.queue.is_empty();
                let broken = s.peer_closed && s.queue.is_empty();
                if readable || broken {
                    ready.push((SocketId::from_raw(*id), SocketEvents { readable, broken }));
                }
            }
            if !ready.is_empty() {
                ready.sort_by_key(|(id, _)| *id);
                return Ok(ready);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            self.wakeup.wait_until(&mut state, deadline);
        }
    }

    fn release_poll(&self, poll: PollId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .polls
            .remove(&poll.raw())
            .ok_or_else(|| Error::Transport("unknown event set".into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn listener_on(transport: &MemoryTransport, at: &str) -> SocketId {
        let socket = transport.open_socket().unwrap();
        transport.bind(socket, addr(at)).unwrap();
        transport.listen(socket, 2).unwrap();
        socket
    }

    fn connected_pair(transport: &MemoryTransport) -> (SocketId, SocketId) {
        let listener = listener_on(transport, "127.0.0.1:9000");
        let caller = transport.open_socket().unwrap();
        transport
            .connect(caller, addr("127.0.0.1:9000"), Duration::from_secs(1))
            .unwrap();
        let (accepted, _) = transport
            .accept(listener, Duration::from_millis(100))
            .unwrap()
            .unwrap();
        (caller, accepted)
    }

    #[test]
    fn test_bind_assigns_ephemeral_port() {
        let transport = MemoryTransport::new();
        let socket = transport.open_socket().unwrap();
        transport.bind(socket, addr("0.0.0.0:0")).unwrap();
        let local = transport.local_addr(socket).unwrap();
        assert!(local.port() >= EPHEMERAL_PORT_MIN);
    }

    #[test]
    fn test_bind_rejects_port_in_use() {
        let transport = MemoryTransport::new();
        let first = transport.open_socket().unwrap();
        transport.bind(first, addr("127.0.0.1:9001")).unwrap();
        let second = transport.open_socket().unwrap();
        assert!(transport.bind(second, addr("127.0.0.1:9001")).is_err());
    }

    #[test]
    fn test_connect_without_listener_refused() {
        let transport = MemoryTransport::new();
        let socket = transport.open_socket().unwrap();
        let result = transport.connect(socket, addr("127.0.0.1:9002"), Duration::from_secs(1));
        assert!(matches!(result, Err(Error::ConnectionRefused)));
    }

    #[test]
    fn test_connect_psk_mismatch_rejected() {
        let transport = MemoryTransport::new();
        let listener = transport.open_socket().unwrap();
        transport
            .set_option(listener, SocketOption::Passphrase("right".into()))
            .unwrap();
        transport.bind(listener, addr("127.0.0.1:9003")).unwrap();
        transport.listen(listener, 2).unwrap();

        let caller = transport.open_socket().unwrap();
        transport
            .set_option(caller, SocketOption::Passphrase("wrong".into()))
            .unwrap();
        let result = transport.connect(caller, addr("127.0.0.1:9003"), Duration::from_secs(1));
        assert!(matches!(result, Err(Error::ConnectionRejected)));
    }

    #[test]
    fn test_connect_and_accept() {
        let transport = MemoryTransport::new();
        let listener = transport.open_socket().unwrap();
        transport
            .set_option(listener, SocketOption::Latency(1000))
            .unwrap();
        transport.bind(listener, addr("0.0.0.0:9004")).unwrap();
        transport.listen(listener, 2).unwrap();

        let caller = transport.open_socket().unwrap();
        transport
            .set_option(caller, SocketOption::Latency(250))
            .unwrap();
        transport
            .set_option(caller, SocketOption::StreamId("camera-1".into()))
            .unwrap();
        transport
            .connect(caller, addr("127.0.0.1:9004"), Duration::from_secs(1))
            .unwrap();

        let (accepted, peer_addr) = transport
            .accept(listener, Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(peer_addr, transport.local_addr(caller).unwrap());
        assert_eq!(transport.peer_addr(accepted).unwrap(), peer_addr);
        assert_eq!(transport.stream_id(accepted).unwrap(), "camera-1");

        let info = transport.connection_info(caller);
        assert_eq!(info.peer_version, MEMORY_TRANSPORT_VERSION);
        assert_eq!(info.negotiated_latency, 1000);
        assert_eq!(transport.connection_info(accepted), info);
    }

    #[test]
    fn test_send_recv_and_statistics() {
        let transport = MemoryTransport::new();
        let (caller, accepted) = connected_pair(&transport);

        transport
            .send(caller, b"hello", &MessageControl::default())
            .unwrap();
        let mut buf = [0u8; 64];
        let (n, ctrl) = transport.recv(accepted, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(ctrl.message_number, 1);
        assert!(ctrl.source_time > 0);

        let sent = transport.statistics(caller, true, false).unwrap();
        assert_eq!(sent.pkt_sent_total, 1);
        assert_eq!(sent.byte_sent_total, 5);
        let received = transport.statistics(accepted, false, true).unwrap();
        assert_eq!(received.pkt_recv_total, 1);

        // interval counters were cleared, totals were not
        let again = transport.statistics(caller, false, false).unwrap();
        assert_eq!(again.pkt_sent, 0);
        assert_eq!(again.pkt_sent_total, 1);
    }

    #[test]
    fn test_oversize_send_rejected() {
        let transport = MemoryTransport::new();
        let (caller, _) = connected_pair(&transport);
        let oversize = vec![1u8; LIVE_MAX_PAYLOAD + 1];
        let result = transport.send(caller, &oversize, &MessageControl::default());
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_close_marks_peer_broken() {
        let transport = MemoryTransport::new();
        let (caller, accepted) = connected_pair(&transport);
        let poll = transport.create_poll().unwrap();
        transport.add_to_poll(poll, accepted).unwrap();

        transport
            .send(caller, b"last words", &MessageControl::default())
            .unwrap();
        transport.close(caller).unwrap();

        // undelivered data is drained before the break is reported
        let events = transport.wait(poll, Duration::from_millis(100)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].1.readable);
        assert!(!events[0].1.broken);

        let mut buf = [0u8; 64];
        let (n, _) = transport.recv(accepted, &mut buf).unwrap();
        assert_eq!(n, 10);

        let events = transport.wait(poll, Duration::from_millis(100)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].1.broken);
        let (n, _) = transport.recv(accepted, &mut buf).unwrap();
        assert_eq!(n, 0);

        assert!(matches!(
            transport.send(accepted, b"too late", &MessageControl::default()),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_wait_times_out_empty() {
        let transport = MemoryTransport::new();
        let poll = transport.create_poll().unwrap();
        let started = Instant::now();
        let events = transport.wait(poll, Duration::from_millis(50)).unwrap();
        assert!(events.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_accept_unblocks_on_close() {
        let transport = Arc::new(MemoryTransport::new());
        let listener = listener_on(&transport, "127.0.0.1:9005");

        let worker = {
            let transport = transport.clone();
            thread::spawn(move || transport.accept(listener, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        transport.close(listener).unwrap();
        let result = worker.join().unwrap();
        assert!(matches!(result, Err(Error::Closed)));
    }
}
