use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceMessage {
    pub speaker: Speaker,
    pub text: String,
}

/// Conversation history plus the user's in-progress utterance.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pending: String,
    messages: Vec<VoiceMessage>,
}

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_input(&mut self, text: &str) {
        self.pending.push_str(text);
    }

    /// Commit the pending input as a user entry.
    ///
    /// Blank input produces no entry. The pending buffer is cleared either way.
    pub fn complete_turn(&mut self) -> Option<&VoiceMessage> {
        let text = std::mem::take(&mut self.pending);
        if text.trim().is_empty() {
            return None;
        }
        self.messages.push(VoiceMessage { speaker: Speaker::User, text });
        self.messages.last()
    }

    /// Append model speech, merging into the latest entry if the model is still talking.
    pub fn push_output(&mut self, text: &str) {
        match self.messages.last_mut() {
            Some(last) if last.speaker == Speaker::Model => last.text.push_str(text),
            _ => self.messages.push(VoiceMessage { speaker: Speaker::Model, text: text.to_string() }),
        }
    }

    #[must_use]
    pub fn pending(&self) -> &str {
        &self.pending
    }

    #[must_use]
    pub fn messages(&self) -> &[VoiceMessage] {
        &self.messages
    }

    /// The last `n` entries, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> &[VoiceMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.messages.clear();
    }
}
