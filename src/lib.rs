//! Streamnet - a session layer for reliable-UDP streaming transports
//!
//! # Architecture
//!
//! ```text
//! Application (callbacks, peer contexts)
//! ← Endpoint (lifecycle, worker threads, peer registry, event dispatch)
//! ← Transport trait (the external reliable-UDP streaming library)
//! ```
//!
//! One [`Endpoint`] runs as a listening server (accepting many peers, or
//! exactly one at a time in single-peer mode) or as a client that keeps
//! reconnecting to a server until stopped. The transport itself (congestion
//! control, retransmission, encryption) is an external collaborator behind
//! the [`Transport`] trait; [`MemoryTransport`] is the in-process loopback
//! implementation used for tests and hermetic wiring.
//!
//! ## Core Principles
//!
//! - The endpoint owns every socket handle from accept/connect to close;
//!   applications only see copyable ids
//! - All callbacks are delivered from the endpoint's own worker threads,
//!   never after `stop` returns
//! - Peer failures stay contained to that peer; endpoint failures fail
//!   start atomically
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── endpoint/        # Lifecycle, workers, dispatch, socket factory
//! ├── transport/       # Transport seam + in-memory implementation
//! ├── config.rs        # Server/client option records
//! ├── error.rs         # Crate-wide error type
//! └── log.rs           # Process-wide transport log shim
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod log;
pub mod transport;

// Re-exports for convenience
pub use config::{ClientOptions, ServerOptions};
pub use endpoint::{Endpoint, Mode, PeerContext};
pub use error::{Error, Result};
pub use transport::{
    ConnectionInfo, MemoryTransport, MessageControl, SocketId, Statistics, Transport,
};
