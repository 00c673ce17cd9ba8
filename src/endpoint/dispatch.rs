//! Event dispatcher
//!
//! One loop per running endpoint demultiplexes readiness from the event
//! set: readable handles get one message received and delivered through a
//! receive callback, broken handles are retired exactly once through the
//! disconnect callback. Receive callbacks for distinct peers are serialized
//! by construction, since there is only one dispatcher thread per
//! endpoint; the application may keep sending from other threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::transport::{PollId, SocketId};

use super::{PeerContext, Shared, POLL_TIMEOUT};

/// Topology served by the dispatcher; decides context lookup and the
/// retirement path for a broken peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchMode {
    MultiPeer,
    SinglePeer,
    Client,
}

/// Run until the owning activity flag clears. In single-peer mode the loop
/// also returns once its one peer is retired, so the combined worker can
/// re-open the listener.
pub(crate) fn run_event_loop(shared: &Arc<Shared>, poll: PollId, mode: DispatchMode) {
    let mtu = shared.config.read().mtu.max(0) as usize;
    loop {
        if !active(shared, mode) {
            return;
        }
        let events = match shared.transport.wait(poll, POLL_TIMEOUT) {
            Ok(events) => events,
            Err(e) => {
                if active(shared, mode) {
                    warn!("[{}] event set failed: {}", shared.log_prefix, e);
                }
                return;
            }
        };
        for (socket, ready) in events {
            if !active(shared, mode) {
                return;
            }
            // handles we carry no context for (the listener, a peer retired
            // moments ago) are not ours to read or retire
            let Some(ctx) = context_for(shared, socket, mode) else {
                continue;
            };
            let mut retire = ready.broken;
            if ready.readable && !receive_one(shared, socket, mtu, ctx) {
                retire = true;
            }
            if retire {
                retire_peer(shared, poll, socket, mode);
                if mode == DispatchMode::SinglePeer {
                    return;
                }
            }
        }
    }
}

fn active(shared: &Shared, mode: DispatchMode) -> bool {
    match mode {
        DispatchMode::Client => shared.client_active.load(Ordering::Acquire),
        _ => shared.server_active.load(Ordering::Acquire),
    }
}

/// The context to hand to callbacks for this handle, or `None` when the
/// handle is not a live peer of this endpoint
fn context_for(
    shared: &Shared,
    socket: SocketId,
    mode: DispatchMode,
) -> Option<Option<Arc<PeerContext>>> {
    match mode {
        DispatchMode::Client => {
            if *shared.bound.lock() == Some(socket) {
                Some(shared.client_ctx.lock().clone())
            } else {
                None
            }
        }
        _ => shared.peers.lock().get(&socket).cloned().map(Some),
    }
}

/// Receive and deliver one message. `false` means the peer is done (end
/// of stream or a receive failure) and must be retired.
fn receive_one(
    shared: &Arc<Shared>,
    socket: SocketId,
    mtu: usize,
    ctx: Option<Arc<PeerContext>>,
) -> bool {
    let mut buf = vec![0u8; mtu];
    match shared.transport.recv(socket, &mut buf) {
        Ok((0, _)) => {
            trace!("[{}] end of stream on {}", shared.log_prefix, socket);
            false
        }
        Ok((n, ctrl)) => {
            // prefer the owning variant when both receive slots are set
            let on_data = shared.callbacks.data.read().clone();
            if let Some(cb) = on_data {
                buf.truncate(n);
                cb(buf, ctrl, ctx, socket);
            } else if let Some(cb) = shared.callbacks.data_no_copy.read().clone() {
                cb(&buf[..n], &ctrl, ctx, socket);
            }
            true
        }
        Err(Error::WouldBlock) => true,
        Err(e) => {
            debug!("[{}] receive on {} failed: {}", shared.log_prefix, socket, e);
            false
        }
    }
}

/// Retire a peer exactly once: drop it from the registry and the event
/// set, notify the application, close the handle
fn retire_peer(shared: &Arc<Shared>, poll: PollId, socket: SocketId, mode: DispatchMode) {
    let ctx = match mode {
        DispatchMode::Client => {
            shared.client_connected.store(false, Ordering::Release);
            *shared.bound.lock() = None;
            shared.client_ctx.lock().clone()
        }
        DispatchMode::MultiPeer | DispatchMode::SinglePeer => {
            let ctx = shared.peers.lock().remove(&socket);
            if mode == DispatchMode::SinglePeer {
                *shared.bound.lock() = None;
            }
            ctx
        }
    };
    let _ = shared.transport.remove_from_poll(poll, socket);
    if mode == DispatchMode::Client {
        info!("[{}] connection to server lost", shared.log_prefix);
    } else {
        info!("[{}] peer {} disconnected", shared.log_prefix, socket);
    }
    if let Some(cb) = shared.callbacks.peer_disconnected.read().clone() {
        cb(ctx, socket);
    }
    let _ = shared.transport.close(socket);
}
