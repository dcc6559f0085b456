use crate::Error;

use super::session::SessionStatus;
use super::transcript::VoiceMessage;

pub type StatusHandler = Box<dyn Fn(SessionStatus) + Send + Sync>;
pub type TranscriptHandler = Box<dyn Fn(&str) + Send + Sync>;
pub type HistoryHandler = Box<dyn Fn(&[VoiceMessage]) + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(&Error, &str) + Send + Sync>;
pub type SpeakingHandler = Box<dyn Fn(bool) + Send + Sync>;

/// Callbacks a UI registers to follow a voice session.
///
/// Handlers run inline on the session's task and must not block.
#[derive(Default)]
pub struct EventHandlers {
    pub on_status: Option<StatusHandler>,
    pub on_transcript: Option<TranscriptHandler>,
    pub on_history: Option<HistoryHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_speaking: Option<SpeakingHandler>,
}

impl EventHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_status<F>(mut self, handler: F) -> Self
    where
        F: Fn(SessionStatus) + Send + Sync + 'static,
    {
        self.on_status = Some(Box::new(handler));
        self
    }

    /// Called with the user's in-progress utterance; empty once it is committed or dropped.
    #[must_use]
    pub fn on_transcript<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_transcript = Some(Box::new(handler));
        self
    }

    #[must_use]
    pub fn on_history<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[VoiceMessage]) + Send + Sync + 'static,
    {
        self.on_history = Some(Box::new(handler));
        self
    }

    /// Called with the failure and its user-facing message.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error, &str) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(handler));
        self
    }

    /// Called when model audio starts, and again when it drains or is cut off.
    #[must_use]
    pub fn on_speaking<F>(mut self, handler: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_speaking = Some(Box::new(handler));
        self
    }

    pub(crate) fn status(&self, status: SessionStatus) {
        if let Some(handler) = &self.on_status {
            handler(status);
        }
    }

    pub(crate) fn transcript(&self, text: &str) {
        if let Some(handler) = &self.on_transcript {
            handler(text);
        }
    }

    pub(crate) fn history(&self, messages: &[VoiceMessage]) {
        if let Some(handler) = &self.on_history {
            handler(messages);
        }
    }

    pub(crate) fn error(&self, err: &Error, message: &str) {
        if let Some(handler) = &self.on_error {
            handler(err, message);
        }
    }

    pub(crate) fn speaking(&self, speaking: bool) {
        if let Some(handler) = &self.on_speaking {
            handler(speaking);
        }
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_status", &self.on_status.is_some())
            .field("on_transcript", &self.on_transcript.is_some())
            .field("on_history", &self.on_history.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_speaking", &self.on_speaking.is_some())
            .finish()
    }
}
