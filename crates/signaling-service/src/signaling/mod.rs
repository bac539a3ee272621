//! Signaling protocol and per-connection request handling.
//!
//! - [`protocol`] - JSON frames exchanged over the signaling channel
//! - [`handler`] - `SignalingHandler`, one per connection

pub mod handler;
pub mod protocol;

pub use handler::SignalingHandler;
pub use protocol::{
    parse_frame, InboundFrame, NetworkPolicy, Notification, ServerMessage, SignalingRequest,
    SignalingResponse,
};
