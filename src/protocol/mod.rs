//! Wire models of the bidirectional live endpoint.

pub mod client_events;
pub mod models;
pub mod server_events;
