use crate::audio::capture::{AudioCapture, CaptureConstraints};
use crate::audio::playback::OutputDevice;
use crate::protocol::models::LiveConfig;
use crate::transport::relay::RelayClient;
use crate::{Error, Result};

use super::connector::{Connector, RelayConnector};
use super::session::VoiceSession;
use super::EventHandlers;

pub struct VoiceSessionBuilder {
    relay_url: Option<String>,
    endpoint: Option<String>,
    config: LiveConfig,
    constraints: CaptureConstraints,
    connector: Option<Box<dyn Connector>>,
    capture: Option<Box<dyn AudioCapture>>,
    output: Option<Box<dyn OutputDevice>>,
    handlers: EventHandlers,
}

impl VoiceSessionBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            relay_url: None,
            endpoint: None,
            config: LiveConfig::default(),
            constraints: CaptureConstraints::default(),
            connector: None,
            capture: None,
            output: None,
            handlers: EventHandlers::new(),
        }
    }

    /// URL of the relay that issues live credentials.
    #[must_use]
    pub fn relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = Some(url.into());
        self
    }

    /// Override the live websocket endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    #[must_use]
    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.config.voice = voice.into();
        self
    }

    #[must_use]
    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.system_instruction = instruction.into();
        self
    }

    #[must_use]
    pub const fn input_transcription(mut self, enabled: bool) -> Self {
        self.config.input_transcription = enabled;
        self
    }

    #[must_use]
    pub const fn output_transcription(mut self, enabled: bool) -> Self {
        self.config.output_transcription = enabled;
        self
    }

    #[must_use]
    pub const fn constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Samples per captured frame sent to the server.
    #[must_use]
    pub const fn frame_size(mut self, frame_size: usize) -> Self {
        self.constraints.frame_size = frame_size;
        self
    }

    /// Use a custom connector instead of the relay.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    #[must_use]
    pub fn capture(mut self, capture: impl AudioCapture + 'static) -> Self {
        self.capture = Some(Box::new(capture));
        self
    }

    #[must_use]
    pub fn output(mut self, output: impl OutputDevice + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    #[must_use]
    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// # Errors
    /// Returns `InvalidConfig` if the configuration is incomplete, or an error
    /// if the relay client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<VoiceSession> {
        self.config.validate()?;
        if self.constraints.frame_size == 0 {
            return Err(Error::InvalidConfig("frame_size must be positive".to_string()));
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                let url = self
                    .relay_url
                    .ok_or_else(|| Error::InvalidConfig("relay_url or connector required".to_string()))?;
                let mut connector = RelayConnector::new(RelayClient::new(&url)?);
                if let Some(endpoint) = self.endpoint {
                    connector = connector.with_endpoint(endpoint);
                }
                Box::new(connector)
            }
        };
        let capture = self.capture.ok_or_else(|| Error::InvalidConfig("capture backend required".to_string()))?;
        let output = self.output.ok_or_else(|| Error::InvalidConfig("output device required".to_string()))?;

        Ok(VoiceSession::new(
            self.config,
            self.constraints,
            connector,
            capture,
            output,
            self.handlers,
        ))
    }
}

impl Default for VoiceSessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
