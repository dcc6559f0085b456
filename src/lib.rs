#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::multiple_crate_versions)]

pub mod audio;
pub mod protocol;
pub mod transport;
pub mod error;
pub mod sdk;

pub use error::{Error, ErrorKind, Result};
pub use sdk::{
    Connector, EventHandlers, LiveEvent, RelayConnector, SessionHandle, SessionStatus, Speaker, Transcript,
    Transport, VoiceMessage, VoiceSession, VoiceSessionBuilder,
};
pub use protocol::client_events::ClientEvent;
pub use protocol::server_events::ServerEvent;
pub use protocol::models::{DEFAULT_MODEL, DEFAULT_VOICE, LiveConfig, Modality};
pub use transport::relay::{Credential, RelayAction, RelayClient, RelayResponse};

use futures::{SinkExt, StreamExt};
use serde_json::from_slice;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use transport::ws::WsStream;

const TRACE_LOG_MAX_BYTES: usize = 1024;
const MAX_AUDIO_FRAME_BYTES: usize = 1024 * 1024;
const TRACE_TRUNCATE_SUFFIX: &str = "... (truncated)";

/// Typed client for one live websocket stream.
///
/// Thread safety: `LiveClient` is `Send` but not `Sync` because the underlying
/// WebSocket stream is not `Sync`.
#[must_use]
pub struct LiveClient {
    sender: LiveSender,
    receiver: LiveReceiver,
}

impl LiveClient {
    /// Open the stream and send the setup message for `config`.
    ///
    /// The session is usable once the server answers with `setupComplete`.
    ///
    /// # Errors
    /// Returns an error if the handshake fails or the setup cannot be sent.
    pub async fn connect(endpoint: &str, credential: &Credential, config: &LiveConfig) -> Result<Self> {
        config.validate()?;
        let stream = transport::ws::connect(endpoint, credential).await?;
        let (write, read) = stream.split();
        let mut client = Self { sender: LiveSender { write }, receiver: LiveReceiver { read } };
        client.send(ClientEvent::Setup(config.to_setup())).await?;
        tracing::debug!(model = %config.model, voice = %config.voice, "Setup sent");
        Ok(client)
    }

    /// Send a client message to the server.
    ///
    /// # Errors
    /// Returns an error if validation or serialization fails, or if the WebSocket send fails.
    pub async fn send(&mut self, event: ClientEvent) -> Result<()> {
        self.sender.send(event).await
    }

    /// Receive the next server message. `Ok(None)` after a normal close.
    ///
    /// # Errors
    /// Returns `AuthFailure` if the server closes with a policy violation
    /// (expired or rejected key), otherwise a WebSocket or JSON error.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        self.receiver.next_event().await
    }

    /// Split the client into a sender and a receiver for concurrent usage.
    pub fn split(self) -> (LiveSender, LiveReceiver) {
        (self.sender, self.receiver)
    }
}

/// The sending half of a split `LiveClient`.
pub struct LiveSender {
    write: futures::stream::SplitSink<WsStream, Message>,
}

impl LiveSender {
    /// Send a client message.
    ///
    /// # Errors
    /// Returns an error if validation, serialization or sending fails.
    pub async fn send(&mut self, event: ClientEvent) -> Result<()> {
        validate_client_event(&event)?;
        let json = serde_json::to_string(&event)?;
        tracing::trace!("Sending event: {}", safe_truncate(&json, TRACE_LOG_MAX_BYTES));
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }
}

/// The receiving half of a split `LiveClient`.
pub struct LiveReceiver {
    read: futures::stream::SplitStream<WsStream>,
}

impl LiveReceiver {
    /// Receive the next server message. `Ok(None)` after a normal close.
    ///
    /// Pings are answered by the websocket layer on the next read or write.
    ///
    /// # Errors
    /// Returns `AuthFailure` on a policy-violation close, otherwise a WebSocket or JSON error.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>> {
        while let Some(msg) = self.read.next().await {
            match msg? {
                Message::Text(text) => {
                    tracing::trace!("Received event: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    return Ok(Some(from_slice::<ServerEvent>(text.as_bytes())?));
                }
                Message::Binary(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    tracing::trace!("Received event: {}", safe_truncate(&text, TRACE_LOG_MAX_BYTES));
                    return Ok(Some(from_slice::<ServerEvent>(&bytes)?));
                }
                Message::Close(frame) => {
                    if let Some(frame) = frame {
                        let reason: &str = &frame.reason;
                        tracing::info!(code = u16::from(frame.code), reason, "WebSocket connection closed by server");
                        if frame.code == CloseCode::Policy {
                            return Err(Error::AuthFailure(reason.to_string()));
                        }
                    } else {
                        tracing::info!("WebSocket connection closed by server");
                    }
                    return Ok(None);
                }
                Message::Ping(_) => tracing::debug!("Received Ping"),
                _ => (),
            }
        }
        Ok(None)
    }
}

fn safe_truncate(s: &str, max_bytes: usize) -> std::borrow::Cow<'_, str> {
    if s.len() <= max_bytes {
        return std::borrow::Cow::Borrowed(s);
    }

    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!(
        "{} {} {} bytes",
        &s[..end],
        TRACE_TRUNCATE_SUFFIX,
        s.len() - end
    ))
}

#[allow(clippy::result_large_err)]
fn validate_client_event(event: &ClientEvent) -> Result<()> {
    match event {
        ClientEvent::Setup(setup) => {
            if setup.model.trim_start_matches("models/").is_empty() {
                return Err(Error::InvalidConfig("setup.model must not be empty".to_string()));
            }
        }
        ClientEvent::RealtimeInput(input) => {
            if let Some(audio) = &input.audio {
                let size = estimate_base64_decoded_len(&audio.data)?;
                if size > MAX_AUDIO_FRAME_BYTES {
                    return Err(Error::InvalidAudio(format!(
                        "realtime audio frame exceeds 1MB ({size} bytes)",
                    )));
                }
                if size % 2 != 0 {
                    return Err(Error::InvalidAudio(
                        "realtime audio frame is not whole pcm16 samples".to_string(),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::result_large_err)]
fn estimate_base64_decoded_len(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidAudio("invalid base64 length".to_string()));
    }

    let mut padding = 0;
    let mut seen_padding = false;
    for &b in bytes {
        if b == b'=' {
            seen_padding = true;
            padding += 1;
            continue;
        }
        if seen_padding {
            return Err(Error::InvalidAudio("invalid base64 padding".to_string()));
        }
        let is_valid = matches!(b,
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/'
        );
        if !is_valid {
            return Err(Error::InvalidAudio("invalid base64 character".to_string()));
        }
    }

    if padding > 2 {
        return Err(Error::InvalidAudio("invalid base64 padding length".to_string()));
    }

    Ok(bytes.len() / 4 * 3 - padding)
}
