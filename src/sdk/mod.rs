//! Voice session controller over the live protocol.
//!
//! [`VoiceSession`] owns the microphone, the playback scheduler and the live
//! stream, and reports progress through [`EventHandlers`]. The wire types stay
//! reachable through `crate::protocol` for callers driving [`crate::LiveClient`] directly.

mod builder;
mod connector;
mod events;
mod handlers;
mod session;
mod transcript;
mod transport;

pub use builder::VoiceSessionBuilder;
pub use connector::{Connector, RelayConnector};
pub use events::LiveEvent;
pub use handlers::{ErrorHandler, EventHandlers, HistoryHandler, SpeakingHandler, StatusHandler, TranscriptHandler};
pub use session::{SessionHandle, SessionStatus, VoiceSession};
pub use transcript::{Speaker, Transcript, VoiceMessage};
pub use transport::{BoxFuture, Transport};
