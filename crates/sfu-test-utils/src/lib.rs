//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU signaling service.
//!
//! This crate provides a scriptable media engine and negotiation fixtures so
//! the signaling layer can be tested without a mediasoup worker.
//!
//! ## Modules
//!
//! - `mock_engine` - [`MockMediaEngine`] with call counts, close accounting,
//!   failure injection and gates that hold calls in flight
//! - `fixtures` - RTP/DTLS parameters and wire request helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let engine = MockMediaEngine::builder()
//!         .fail(EngineOperation::CreateTransport, "no ports left")
//!         .build();
//!
//!     // Hand `Arc::new(engine)` to the service under test...
//! }
//! ```
//!
//! ## Holding Calls In Flight
//!
//! ```rust,ignore
//! engine.hold(EngineOperation::Produce);
//! let request = tokio::spawn(async move { client.create_producer(..).await });
//! engine.wait_for_calls(EngineOperation::Produce, 1).await;
//! // ...disconnect while produce is suspended...
//! engine.release(EngineOperation::Produce);
//! ```

pub mod fixtures;
pub mod mock_engine;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_engine::*;
