//! Server workers
//!
//! Two topologies, one machinery. The multi-peer acceptor keeps the
//! listener open for the life of the server and feeds peers to a separate
//! dispatcher thread. The single-peer worker accepts one peer, closes the
//! listener while that peer is connected (promotion), runs the dispatch
//! loop inline and re-opens the listener after the peer disconnects.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::transport::{PollId, SocketId};

use super::{dispatch, factory, Shared, ACCEPT_TIMEOUT};

/// Multi-peer acceptor loop
pub(crate) fn run_acceptor(shared: Arc<Shared>, listener: SocketId, poll: PollId) {
    while shared.server_active.load(Ordering::Acquire) {
        match shared.transport.accept(listener, ACCEPT_TIMEOUT) {
            Ok(None) => continue,
            Ok(Some((peer, addr))) => {
                register_peer(&shared, poll, peer, addr);
            }
            Err(e) => {
                // stop closes the listener to unblock us; anything else is fatal
                if shared.server_active.load(Ordering::Acquire) {
                    error!("[{}] accept failed: {}", shared.log_prefix, e);
                }
                return;
            }
        }
    }
}

/// Ask the application about a freshly accepted peer. A returned context
/// registers the peer with the registry and the event set (in that order,
/// so the connected callback always precedes the first receive); `None`
/// refuses and closes the handle.
fn register_peer(shared: &Arc<Shared>, poll: PollId, peer: SocketId, addr: SocketAddr) -> bool {
    let info = shared.transport.connection_info(peer);
    let Some(on_connected) = shared.callbacks.peer_connected.read().clone() else {
        let _ = shared.transport.close(peer);
        return false;
    };
    let server_ctx = shared.connection_ctx.lock().clone();
    match on_connected(addr, peer, server_ctx, &info) {
        Some(ctx) => {
            shared.peers.lock().insert(peer, ctx);
            if let Err(e) = shared.transport.add_to_poll(poll, peer) {
                warn!("[{}] could not watch peer {}: {}", shared.log_prefix, peer, e);
                shared.peers.lock().remove(&peer);
                let _ = shared.transport.close(peer);
                return false;
            }
            info!("[{}] peer {} connected from {}", shared.log_prefix, peer, addr);
            true
        }
        None => {
            debug!(
                "[{}] peer from {} refused by the application",
                shared.log_prefix, addr
            );
            let _ = shared.transport.close(peer);
            false
        }
    }
}

/// Single-peer combined worker
pub(crate) fn run_single_peer(shared: Arc<Shared>, poll: PollId) {
    while shared.server_active.load(Ordering::Acquire) {
        // (1) make sure a listener exists; the first one comes from start.
        // Copy the handle out before matching so the `bound` guard is not
        // held across the re-open arm, which re-locks it.
        let current = *shared.bound.lock();
        let listener = match current {
            Some(socket) => socket,
            None => {
                let config = shared.config.read().clone();
                let socket =
                    match factory::create_server_socket(shared.transport.as_ref(), &config) {
                        Ok(socket) => socket,
                        Err(e) => {
                            error!("[{}] could not re-open listener: {}", shared.log_prefix, e);
                            return;
                        }
                    };
                {
                    // stop may have raced us; never leave a handle it cannot see
                    let mut bound = shared.bound.lock();
                    if !shared.server_active.load(Ordering::Acquire) {
                        drop(bound);
                        let _ = shared.transport.close(socket);
                        return;
                    }
                    *bound = Some(socket);
                }
                let _ = shared.transport.add_to_poll(poll, socket);
                info!("[{}] listening again for a peer", shared.log_prefix);
                socket
            }
        };

        // (2) wait for exactly one peer
        let (peer, addr) = loop {
            if !shared.server_active.load(Ordering::Acquire) {
                return;
            }
            match shared.transport.accept(listener, ACCEPT_TIMEOUT) {
                Ok(None) => continue,
                Ok(Some(pair)) => break pair,
                Err(e) => {
                    if shared.server_active.load(Ordering::Acquire) {
                        error!("[{}] accept failed: {}", shared.log_prefix, e);
                    }
                    return;
                }
            }
        };

        // (3) promotion: the listener closes, the peer becomes the bound
        // handle, and nobody else can connect until it disconnects
        let _ = shared.transport.remove_from_poll(poll, listener);
        let _ = shared.transport.close(listener);
        {
            let mut bound = shared.bound.lock();
            if !shared.server_active.load(Ordering::Acquire) {
                drop(bound);
                let _ = shared.transport.close(peer);
                return;
            }
            *bound = Some(peer);
        }

        if register_peer(&shared, poll, peer, addr) {
            dispatch::run_event_loop(&shared, poll, dispatch::DispatchMode::SinglePeer);
        } else {
            *shared.bound.lock() = None;
        }
        // either stop cleared the flag or the peer is gone and a fresh
        // listener is needed
    }
}
