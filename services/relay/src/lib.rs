//! Signaling relay service.
//!
//! Clients connect a WebSocket to `/ws/{channel}` and every frame they send is
//! relayed, unchanged, to the other sockets joined to the same channel.

pub mod config;
pub mod router;
pub mod state;
pub mod ws;
