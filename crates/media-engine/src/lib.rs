//! Media engine capability surface for the SFU signaling service.
//!
//! The signaling service never touches RTP, ICE or DTLS itself. Everything it
//! needs from the media engine goes through the [`MediaEngine`] trait:
//!
//! - `initialize` once at startup, yielding the process-wide
//!   [`RouterCapabilities`]
//! - `create_webrtc_transport` / `connect_transport`
//! - `produce` / `consume`
//! - `close` (idempotent for every handle kind)
//!
//! Engine failure after initialization is reported through a [`FatalSignal`]
//! that the process supervises.
//!
//! # Backends
//!
//! - `mediasoup` feature: [`mediasoup::MediasoupEngine`], backed by a
//!   mediasoup worker process.
//! - Test doubles live in the `sfu-test-utils` crate.

#![warn(clippy::pedantic)]

pub mod engine;
pub mod error;
pub mod types;

#[cfg(feature = "mediasoup")]
pub mod mediasoup;

pub use engine::{
    ConsumerHandle, CreatedConsumer, CreatedTransport, FatalSignal, MediaEngine, ProducerHandle,
    ResourceHandle, TransportHandle,
};
pub use error::EngineError;
pub use types::*;
