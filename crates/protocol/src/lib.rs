//! Wire protocol for the control plane gateway
//!
//! Every message on the transport is one JSON `GatewayFrame` carrying a
//! required `type` discriminator (`req`, `res`, `event`). This crate owns:
//! - the frame, handshake and snapshot types
//! - params/result types for every RPC method family
//! - the closed-schema `SchemaRegistry`
//! - `decode`/`encode` for frames

pub mod codec;
pub mod frame;
pub mod handshake;
pub mod methods;
pub mod schema;
pub mod snapshot;

pub use codec::{decode, decode_bounded, decode_value, encode, FrameError};
pub use frame::{error_codes, events, ErrorShape, EventFrame, GatewayFrame, RequestFrame, ResponseFrame};
pub use frame::{ShutdownEvent, TickEvent};
pub use handshake::*;
pub use schema::{parse_params, SchemaRegistry, Validate, ValidationError};
pub use snapshot::{PresenceEntry, Snapshot, StateVersion};

/// Highest protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 3;
