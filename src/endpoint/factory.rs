//! Socket factory
//!
//! Builds configured transport handles for the lifecycle controller.
//! Options are applied in one fixed order (reorder window, latency,
//! overhead, MTU, idle timeout, passphrase, stream id, live mode) before
//! any bind, listen or connect, and every failure path closes the handle
//! it opened.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{SocketId, SocketOption, Transport, TransportType};

/// Listen backlog for server sockets
const LISTEN_BACKLOG: usize = 2;

/// Resolve `host:port`, accepting IPv4/IPv6 literals and hostnames.
/// Resolution failure is a configuration error, distinct from any connect
/// failure.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if host.is_empty() {
        return Err(Error::InvalidAddress("empty host".into()));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(format!("{} resolved to no addresses", host)))
}

/// Build a bound, listening server socket from the captured configuration
pub(crate) fn create_server_socket(
    transport: &dyn Transport,
    config: &Config,
) -> Result<SocketId> {
    let local = resolve(&config.local_host, config.local_port)?;
    let socket = transport.open_socket()?;
    let configured = apply_options(transport, socket, config, false).and_then(|_| {
        transport.bind(socket, local)?;
        transport.listen(socket, LISTEN_BACKLOG)
    });
    if let Err(e) = configured {
        let _ = transport.close(socket);
        return Err(e);
    }
    Ok(socket)
}

/// Build a configured client socket and resolve the remote address. An
/// explicit local binding is resolved and applied here, before any connect,
/// so a bad local host never reaches the remote end.
pub(crate) fn create_client_socket(
    transport: &dyn Transport,
    config: &Config,
) -> Result<(SocketId, SocketAddr)> {
    let remote = resolve(&config.remote_host, config.remote_port)?;
    let local = if config.wants_local_bind() {
        Some(resolve(&config.local_host, config.local_port)?)
    } else {
        None
    };
    let socket = transport.open_socket()?;
    let configured = apply_options(transport, socket, config, true).and_then(|_| match local {
        Some(addr) => transport.bind(socket, addr),
        None => Ok(()),
    });
    if let Err(e) = configured {
        let _ = transport.close(socket);
        return Err(e);
    }
    Ok((socket, remote))
}

/// The fixed option order; `client` adds the stream identifier
fn apply_options(
    transport: &dyn Transport,
    socket: SocketId,
    config: &Config,
    client: bool,
) -> Result<()> {
    transport.set_option(socket, SocketOption::ReorderWindow(config.reorder_window))?;
    transport.set_option(socket, SocketOption::Latency(config.latency))?;
    transport.set_option(socket, SocketOption::Overhead(config.overhead))?;
    transport.set_option(socket, SocketOption::Mtu(config.mtu))?;
    transport.set_option(socket, SocketOption::PeerIdleTimeout(config.peer_idle_timeout))?;
    if !config.psk.is_empty() {
        transport.set_option(socket, SocketOption::Passphrase(config.psk.clone()))?;
    }
    if client && !config.stream_id.is_empty() {
        transport.set_option(socket, SocketOption::StreamId(config.stream_id.clone()))?;
    }
    transport.set_option(socket, SocketOption::TransportType(TransportType::Live))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_resolve_accepts_ip_literals() {
        assert_eq!(
            resolve("127.0.0.1", 8009).unwrap(),
            "127.0.0.1:8009".parse().unwrap()
        );
        assert_eq!(resolve("::1", 8020).unwrap(), "[::1]:8020".parse().unwrap());
        assert!(resolve("::", 8020).unwrap().ip().is_unspecified());
    }

    #[test]
    fn test_resolve_rejects_empty_and_corrupt_hosts() {
        assert!(matches!(
            resolve("", 8022),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            resolve("123.456.789.012", 8022),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_client_socket_bad_local_bind_fails_before_connect() {
        let transport = MemoryTransport::new();
        let config = Config::for_client(
            "127.0.0.1",
            8009,
            Some(("", 8022)),
            &ClientOptions::default(),
        );
        let result = create_client_socket(&transport, &config);
        assert!(matches!(result, Err(Error::InvalidAddress(_))));
    }
}
