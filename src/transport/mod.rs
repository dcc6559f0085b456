//! Network plumbing: the live websocket and the relay's HTTP endpoints.

pub mod relay;
pub mod ws;
