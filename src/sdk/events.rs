use crate::Error;
use crate::Result;
use crate::protocol::models::Blob;
use crate::protocol::server_events::ServerEvent;

/// One thing that happened on the live stream, in the order it must be handled.
#[derive(Debug)]
pub enum LiveEvent {
    /// The server acknowledged the setup message.
    Opened,
    InputTranscript(String),
    TurnComplete,
    OutputTranscript(String),
    AudioChunk(Blob),
    /// The user barged in; queued playback must stop.
    Interrupted,
    GoAway { time_left: Option<String> },
    Closed,
    Failed(Error),
}

impl LiveEvent {
    /// Split one server message into events.
    ///
    /// Within a message: input transcription, turn completion, output
    /// transcription, audio, then interruption.
    #[must_use]
    pub fn from_server(event: ServerEvent) -> Vec<Self> {
        let mut events = Vec::new();
        if event.setup_complete.is_some() {
            events.push(Self::Opened);
        }

        if let Some(content) = event.server_content {
            let audio: Vec<Blob> = content.inline_audio().cloned().collect();
            if let Some(text) = content.input_transcription.and_then(|t| t.text) {
                events.push(Self::InputTranscript(text));
            }
            if content.turn_complete {
                events.push(Self::TurnComplete);
            }
            if let Some(text) = content.output_transcription.and_then(|t| t.text) {
                events.push(Self::OutputTranscript(text));
            }
            events.extend(audio.into_iter().map(Self::AudioChunk));
            if content.interrupted {
                events.push(Self::Interrupted);
            }
        }

        if let Some(go_away) = event.go_away {
            events.push(Self::GoAway { time_left: go_away.time_left });
        }
        if event.tool_call.is_some() {
            tracing::debug!("Ignoring tool call, no tools are declared");
        }
        if let Some(usage) = event.usage_metadata {
            tracing::trace!(?usage, "Usage reported");
        }
        events
    }

    /// Map the outcome of one transport read.
    #[must_use]
    pub fn from_inbound(inbound: Result<Option<ServerEvent>>) -> Vec<Self> {
        match inbound {
            Ok(Some(event)) => Self::from_server(event),
            Ok(None) => vec![Self::Closed],
            Err(err @ Error::Serialization(_)) => {
                tracing::warn!(error = %err, "Dropping undecodable server message");
                Vec::new()
            }
            Err(err) => vec![Self::Failed(err)],
        }
    }
}
