//! Gateway protocol server
//!
//! The WebSocket handler adapts a socket to the transport-agnostic connection
//! loop; the hub owns shared presence/health state and fans events out through
//! each connection's sequenced outbound queue.

pub mod connection;
pub mod handler;
pub mod hub;
pub mod methods;
pub mod rpc;
pub mod sequencer;

pub use handler::gateway_ws_handler;
