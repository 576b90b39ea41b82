//! Transport layer for agent stream sessions.
//!
//! Provides:
//! - Wire protocol (JSON request/response bodies, WebSocket messages)
//! - HTTP routes with an SSE event feed
//! - WebSocket transport (feature: websocket)

pub mod http;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use http::create_router;
pub use protocol::{ApiError, ClientMessage, ServerMessage};
