//! WebRTC signaling relay: admits authenticated peers over WebSocket and
//! forwards offers, answers and ICE candidates between producers and
//! consumers.

pub mod auth;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod id;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod session;
pub mod signaling;
pub mod state;
pub mod telemetry;
pub mod websocket;
