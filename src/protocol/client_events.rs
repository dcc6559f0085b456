use serde::{Deserialize, Serialize};
use super::models::{Blob, Setup};

/// Messages sent from the client to the live endpoint.
///
/// Externally tagged: each message is a single-key object such as `{"setup": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientEvent {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
}

impl ClientEvent {
    /// One captured audio frame, already encoded for transit.
    #[must_use]
    pub const fn audio(blob: Blob) -> Self {
        Self::RealtimeInput(RealtimeInput { audio: Some(blob) })
    }
}
