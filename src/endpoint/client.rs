//! Client reconnector
//!
//! Owns the client's connection state. The first synchronous attempt is
//! made by the lifecycle controller inside start; every later attempt
//! happens here. When the dispatcher reports a loss (connected flag
//! cleared, handle closed) the loop re-arms and keeps trying, paced by the
//! connect timeout, until stop drains it.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Result;
use crate::transport::{PollId, SocketId};

use super::{factory, Shared, CONNECT_TIMEOUT};

/// Slice of the retry pause, so stop is observed promptly
const RETRY_TICK: Duration = Duration::from_millis(100);

/// One connect attempt: build a configured socket and connect it within
/// the fixed timeout. The socket never outlives a failed attempt.
pub(crate) fn connect_once(shared: &Shared) -> Result<SocketId> {
    let config = shared.config.read().clone();
    let (socket, remote) = factory::create_client_socket(shared.transport.as_ref(), &config)?;
    match shared.transport.connect(socket, remote, CONNECT_TIMEOUT) {
        Ok(()) => Ok(socket),
        Err(e) => {
            let _ = shared.transport.close(socket);
            Err(e)
        }
    }
}

/// Retry loop; parks while a connection is up
pub(crate) fn run_reconnector(shared: Arc<Shared>, poll: PollId) {
    while shared.client_active.load(Ordering::Acquire) {
        if shared.client_connected.load(Ordering::Acquire) {
            thread::sleep(RETRY_TICK);
            continue;
        }
        match connect_once(&shared) {
            Ok(socket) => {
                {
                    // stop may have raced us; never leave a handle it cannot see
                    let mut bound = shared.bound.lock();
                    if !shared.client_active.load(Ordering::Acquire) {
                        drop(bound);
                        let _ = shared.transport.close(socket);
                        return;
                    }
                    *bound = Some(socket);
                }
                if let Err(e) = shared.transport.add_to_poll(poll, socket) {
                    debug!(
                        "[{}] could not watch the server socket: {}",
                        shared.log_prefix, e
                    );
                    *shared.bound.lock() = None;
                    let _ = shared.transport.close(socket);
                    continue;
                }
                shared.client_connected.store(true, Ordering::Release);
                let connection_info = shared.transport.connection_info(socket);
                let ctx = shared.client_ctx.lock().clone();
                if let Some(cb) = shared.callbacks.connected_to_server.read().clone() {
                    cb(ctx, socket, &connection_info);
                }
                let config = shared.config.read();
                info!(
                    "[{}] connected to {}:{}",
                    shared.log_prefix, config.remote_host, config.remote_port
                );
            }
            Err(e) => {
                debug!("[{}] connect attempt failed: {}", shared.log_prefix, e);
                pause(&shared);
            }
        }
    }
}

/// Wait out the retry delay in small slices, bailing as soon as the
/// endpoint goes inactive
fn pause(shared: &Shared) {
    let slices = (CONNECT_TIMEOUT.as_millis() / RETRY_TICK.as_millis()) as u32;
    for _ in 0..slices {
        if !shared.client_active.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(RETRY_TICK);
    }
}
