//! Realtime voice/chat session layer.
//!
//! A [`coordinator::SessionCoordinator`] owns one logical session and picks the
//! transport underneath it: a peer-to-peer connection negotiated over a
//! [`signaling::SignalingChannel`], or the server-relayed
//! [`fallback::FallbackTransport`] when peer connectivity cannot be
//! established. Callers see a single connect/disconnect/send/receive surface
//! regardless of which transport is live.

pub mod audio;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fallback;
pub mod peer;
pub mod signaling;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{RealtimeError, Result};
pub use newme_realtime_types as types;
