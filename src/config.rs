//! Endpoint configuration
//!
//! Two public option records (server and client knobs) plus the internal
//! configuration captured once at start. All transport tuning values are
//! passed through to the transport verbatim; this layer only fixes the
//! order in which they are applied (see `endpoint::factory`).

use serde::{Deserialize, Serialize};

/// Default peer idle timeout: a connection is considered broken when no
/// packet arrives for this long (milliseconds).
pub const DEFAULT_PEER_IDLE_TIMEOUT: i32 = 5000;

/// Default latency budget in milliseconds (retransmission window, also the
/// transmission delay).
pub const DEFAULT_LATENCY: i32 = 120;

/// Default extra bandwidth percentage allowed for retransmissions.
pub const DEFAULT_OVERHEAD: i32 = 25;

/// Default reorder window size in packets.
pub const DEFAULT_REORDER_WINDOW: i32 = 16;

/// Default maximum transmission unit in bytes.
pub const DEFAULT_MTU: i32 = 1500;

/// Tuning knobs for a listening endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Reorder window size in packets
    #[serde(default = "default_reorder_window")]
    pub reorder_window: i32,

    /// Retransmission window / transmission delay in milliseconds
    #[serde(default = "default_latency")]
    pub latency: i32,

    /// Extra bandwidth percentage allowed for retransmissions
    #[serde(default = "default_overhead")]
    pub overhead: i32,

    /// Maximum transmission unit in bytes
    #[serde(default = "default_mtu")]
    pub mtu: i32,

    /// Connection considered broken after this idle interval (milliseconds)
    #[serde(default = "default_peer_idle_timeout")]
    pub peer_idle_timeout: i32,

    /// Pre-shared key; empty disables encryption
    #[serde(default)]
    pub psk: String,

    /// Accept exactly one peer at a time; the listener is closed while the
    /// peer is connected and re-opened after it disconnects
    #[serde(default)]
    pub single_peer: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            reorder_window: DEFAULT_REORDER_WINDOW,
            latency: DEFAULT_LATENCY,
            overhead: DEFAULT_OVERHEAD,
            mtu: DEFAULT_MTU,
            peer_idle_timeout: DEFAULT_PEER_IDLE_TIMEOUT,
            psk: String::new(),
            single_peer: false,
        }
    }
}

/// Tuning knobs for a connecting endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Reorder window size in packets
    #[serde(default = "default_reorder_window")]
    pub reorder_window: i32,

    /// Retransmission window / transmission delay in milliseconds
    #[serde(default = "default_latency")]
    pub latency: i32,

    /// Extra bandwidth percentage allowed for retransmissions
    #[serde(default = "default_overhead")]
    pub overhead: i32,

    /// Maximum transmission unit in bytes
    #[serde(default = "default_mtu")]
    pub mtu: i32,

    /// Connection considered broken after this idle interval (milliseconds)
    #[serde(default = "default_peer_idle_timeout")]
    pub peer_idle_timeout: i32,

    /// Pre-shared key; empty disables encryption and must match the server
    #[serde(default)]
    pub psk: String,

    /// Opaque stream identifier delivered to the server at connect time
    #[serde(default)]
    pub stream_id: String,

    /// When true, a failed first connection attempt fails the start call.
    /// When false, the endpoint starts anyway and keeps retrying in the
    /// background until stopped.
    #[serde(default)]
    pub fail_on_connection_error: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reorder_window: DEFAULT_REORDER_WINDOW,
            latency: DEFAULT_LATENCY,
            overhead: DEFAULT_OVERHEAD,
            mtu: DEFAULT_MTU,
            peer_idle_timeout: DEFAULT_PEER_IDLE_TIMEOUT,
            psk: String::new(),
            stream_id: String::new(),
            fail_on_connection_error: false,
        }
    }
}

fn default_reorder_window() -> i32 {
    DEFAULT_REORDER_WINDOW
}

fn default_latency() -> i32 {
    DEFAULT_LATENCY
}

fn default_overhead() -> i32 {
    DEFAULT_OVERHEAD
}

fn default_mtu() -> i32 {
    DEFAULT_MTU
}

fn default_peer_idle_timeout() -> i32 {
    DEFAULT_PEER_IDLE_TIMEOUT
}

/// Configuration captured at start, immutable until stop
#[derive(Debug, Clone, Default)]
pub(crate) struct Config {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub reorder_window: i32,
    pub latency: i32,
    pub overhead: i32,
    pub mtu: i32,
    pub peer_idle_timeout: i32,
    pub psk: String,
    pub stream_id: String,
}

impl Config {
    pub(crate) fn for_server(local_host: &str, local_port: u16, options: &ServerOptions) -> Self {
        Self {
            local_host: local_host.to_string(),
            local_port,
            reorder_window: options.reorder_window,
            latency: options.latency,
            overhead: options.overhead,
            mtu: options.mtu,
            peer_idle_timeout: options.peer_idle_timeout,
            psk: options.psk.clone(),
            ..Default::default()
        }
    }

    pub(crate) fn for_client(
        remote_host: &str,
        remote_port: u16,
        local: Option<(&str, u16)>,
        options: &ClientOptions,
    ) -> Self {
        let (local_host, local_port) = local.unwrap_or(("", 0));
        Self {
            local_host: local_host.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            reorder_window: options.reorder_window,
            latency: options.latency,
            overhead: options.overhead,
            mtu: options.mtu,
            peer_idle_timeout: options.peer_idle_timeout,
            psk: options.psk.clone(),
            stream_id: options.stream_id.clone(),
        }
    }

    /// True when the client start requested an explicit local binding
    pub(crate) fn wants_local_bind(&self) -> bool {
        !self.local_host.is_empty() || self.local_port != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_options_defaults() {
        let options = ServerOptions::default();
        assert_eq!(options.peer_idle_timeout, DEFAULT_PEER_IDLE_TIMEOUT);
        assert!(options.psk.is_empty());
        assert!(!options.single_peer);
    }

    #[test]
    fn test_client_options_serialization() {
        let options = ClientOptions {
            psk: "secret".to_string(),
            stream_id: "camera-1".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let parsed: ClientOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.psk, options.psk);
        assert_eq!(parsed.stream_id, options.stream_id);
        assert_eq!(parsed.latency, DEFAULT_LATENCY);
    }

    #[test]
    fn test_client_options_defaults_from_empty_json() {
        let parsed: ClientOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.reorder_window, DEFAULT_REORDER_WINDOW);
        assert_eq!(parsed.mtu, DEFAULT_MTU);
        assert!(!parsed.fail_on_connection_error);
    }

    #[test]
    fn test_client_config_local_bind() {
        let options = ClientOptions::default();
        let config = Config::for_client("127.0.0.1", 8009, None, &options);
        assert!(!config.wants_local_bind());

        let config = Config::for_client("127.0.0.1", 8009, Some(("0.0.0.0", 0)), &options);
        assert!(config.wants_local_bind());

        let config = Config::for_client("127.0.0.1", 8009, Some(("", 8022)), &options);
        assert!(config.wants_local_bind());
    }
}
