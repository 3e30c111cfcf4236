//! # audiocast
//!
//! Real-time streaming of system-captured audio to LAN listeners.
//!
//! ## Architecture Overview
//!
//! ```text
//!  capture thread                       net-reactor thread (one current-thread runtime)
//! ┌─────────────────┐                  ┌──────────────────────────────────────────────┐
//! │ LoopbackCapture │  broadcast_audio │  StreamServer (TCP control + UDP fan-out)    │
//! │     (cpal)      ├──────data───────►│    accept loop → per-peer read / heartbeat / │
//! └─────────────────┘                  │    writer tasks, peer registry               │
//!                                      │                                              │
//!                                      │    segment (≤1444 B, whole sample frames)    │
//!                                      │      └─► send_to every registered UDP peer   │
//!                                      │                                              │
//!                                      │  WsGateway (axum, port + 1)                  │
//!                                      │    per-session bounded queue → binary frames │
//!                                      └──────────────────────────────────────────────┘
//! ```
//!
//! Listeners negotiate the stream format over TCP, register a UDP endpoint
//! with a single 4-byte datagram, and then receive raw PCM segments.
//! Browsers connect to the WebSocket gateway instead and receive the same
//! PCM as binary frames after a JSON format message.

pub mod audio;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod websocket;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default port for the TCP control channel and the UDP data channel.
    pub const DEFAULT_PORT: u16 = 65530;

    /// Smallest acceptable port number
    pub const MIN_PORT: u16 = 1;

    /// Largest acceptable port number
    pub const MAX_PORT: u16 = 65535;

    /// Conservative Ethernet MTU used to size datagrams
    pub const DEFAULT_MTU: usize = 1492;

    /// IPv4 header size in bytes
    pub const IPV4_HEADER_SIZE: usize = 20;

    /// IPv6 header size in bytes
    pub const IPV6_HEADER_SIZE: usize = 40;

    /// UDP header size in bytes
    pub const UDP_HEADER_SIZE: usize = 8;

    /// Largest datagram payload we ever send. Subtracting the IPv6 header
    /// keeps the bound safe for both address families.
    pub const MAX_UDP_PAYLOAD: usize = DEFAULT_MTU - IPV6_HEADER_SIZE - UDP_HEADER_SIZE;

    /// How often the server pings a playing TCP listener
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

    /// Silence window after which a TCP listener is dropped
    pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

    /// How often a WebSocket session is checked for liveness
    pub const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

    /// Silence window after which a WebSocket session is closed
    pub const WS_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Nap taken by a WebSocket send loop when its queue is drained
    pub const WS_SEND_IDLE: Duration = Duration::from_millis(5);

    /// Per-session WebSocket queue bound; audio beyond this is dropped
    pub const WS_MAX_QUEUE: usize = 50;

    /// Cap on the serialized format message sent over TCP
    pub const MAX_FORMAT_SIZE: usize = 1024;

    /// Admission cap for concurrently playing listeners
    pub const MAX_CLIENTS: usize = 100;

    /// Datagram buffers pre-allocated by the segment pool
    pub const POOL_INITIAL_CAPACITY: usize = 16;

    /// Most datagram buffers the segment pool will retain
    pub const POOL_MAX_SIZE: usize = 128;
}
