//! Browser-facing WebSocket transport

pub mod gateway;

pub use gateway::WsGateway;
