use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::audio::capture::{AudioCapture, AudioFrame, CaptureConstraints, CaptureStream};
use crate::audio::codec::{self, OUTPUT_SAMPLE_RATE};
use crate::audio::playback::{OutputDevice, PlaybackScheduler};
use crate::protocol::client_events::ClientEvent;
use crate::protocol::models::{Blob, LiveConfig};
use crate::transport::relay::Credential;
use crate::{Error, ErrorKind, Result};

use super::builder::VoiceSessionBuilder;
use super::connector::Connector;
use super::events::LiveEvent;
use super::handlers::EventHandlers;
use super::transcript::{Transcript, VoiceMessage};
use super::transport::{BoxFuture, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

#[derive(Debug)]
enum Command {
    Stop,
}

/// Cloneable remote control for a [`VoiceSession`].
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Ask the session to stop, including while it is still connecting.
    ///
    /// Returns `false` if the session no longer exists.
    pub fn stop(&self) -> bool {
        self.sender.send(Command::Stop).is_ok()
    }
}

/// Resources held by one live connection. Each is acquired in order and may
/// be missing if the start was cut short.
#[derive(Default)]
struct ActiveSession {
    credential: Option<Credential>,
    playback: Option<PlaybackScheduler>,
    capture: Option<CaptureStream>,
    transport: Option<Box<dyn Transport>>,
    sending: Option<BoxFuture<'static, Result<()>>>,
    opened: bool,
}

impl ActiveSession {
    fn teardown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.close();
        }
        self.sending = None;
        self.transport = None;
        self.credential = None;
        self.opened = false;
    }
}

enum Inbound {
    Command,
    Server(Result<Option<crate::ServerEvent>>),
    Sent(Result<()>),
    Frame(Option<AudioFrame>),
    PlaybackDrained,
}

/// A full-duplex voice conversation with the live model.
///
/// Drive it with [`VoiceSession::start`] and then [`VoiceSession::run`] (or
/// repeated [`VoiceSession::step`] calls). All state lives on the driving task.
pub struct VoiceSession {
    config: LiveConfig,
    constraints: CaptureConstraints,
    connector: Box<dyn Connector>,
    capture: Box<dyn AudioCapture>,
    output: Box<dyn OutputDevice>,
    handlers: EventHandlers,
    status: SessionStatus,
    error: Option<String>,
    transcript: Transcript,
    speaking: bool,
    active: Option<ActiveSession>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
}

impl VoiceSession {
    #[must_use]
    pub fn builder() -> VoiceSessionBuilder {
        VoiceSessionBuilder::new()
    }

    pub(crate) fn new(
        config: LiveConfig,
        constraints: CaptureConstraints,
        connector: Box<dyn Connector>,
        capture: Box<dyn AudioCapture>,
        output: Box<dyn OutputDevice>,
        handlers: EventHandlers,
    ) -> Self {
        let (command_tx, commands) = mpsc::unbounded_channel();
        Self {
            config,
            constraints,
            connector,
            capture,
            output,
            handlers,
            status: SessionStatus::Idle,
            error: None,
            transcript: Transcript::new(),
            speaking: false,
            active: None,
            commands,
            command_tx,
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle { sender: self.command_tx.clone() }
    }

    #[must_use]
    pub const fn status(&self) -> SessionStatus {
        self.status
    }

    /// User-facing message of the last failure, cleared by the next start.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[must_use]
    pub fn history(&self) -> &[VoiceMessage] {
        self.transcript.messages()
    }

    /// What the user is saying right now, before the turn is committed.
    #[must_use]
    pub fn live_transcript(&self) -> &str {
        self.transcript.pending()
    }

    #[must_use]
    pub const fn config(&self) -> &LiveConfig {
        &self.config
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Whether model audio is queued or playing.
    pub fn is_speaking(&mut self) -> bool {
        self.active
            .as_mut()
            .and_then(|active| active.playback.as_mut())
            .is_some_and(PlaybackScheduler::is_speaking)
    }

    /// Acquire a credential, the output, the microphone and the stream, in that order.
    ///
    /// Does nothing if a session is already connecting or connected. Any
    /// failure is reported through the status, the error message and the
    /// handlers, and every partially acquired resource is released.
    ///
    /// # Errors
    /// Returns the failure, or `Cancelled` if a stop request arrived first.
    pub async fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            tracing::debug!(status = %self.status, "Session already active, ignoring start");
            return Ok(());
        }
        while self.commands.try_recv().is_ok() {}

        self.error = None;
        self.transcript.reset();
        self.handlers.transcript("");
        self.handlers.history(self.transcript.messages());
        self.active = Some(ActiveSession::default());
        self.set_status(SessionStatus::Connecting);

        match self.acquire().await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => {
                tracing::info!("Start cancelled");
                self.stop();
                Err(Error::Cancelled)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn acquire(&mut self) -> Result<()> {
        let credential = until_stopped(&mut self.commands, self.connector.fetch_credential()).await?;
        self.active_mut()?.credential = Some(credential);

        let output = self.output.open(OUTPUT_SAMPLE_RATE)?;
        self.active_mut()?.playback = Some(PlaybackScheduler::new(output));

        let stream = until_stopped(&mut self.commands, self.capture.open(&self.constraints)).await?;
        self.active_mut()?.capture = Some(stream);

        let credential = self
            .active
            .as_ref()
            .and_then(|active| active.credential.as_ref())
            .ok_or(Error::Cancelled)?;
        let transport = until_stopped(&mut self.commands, self.connector.connect(credential, &self.config)).await?;
        self.active_mut()?.transport = Some(transport);

        tracing::info!(model = %self.config.model, "Live stream connected, awaiting setup");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn active_mut(&mut self) -> Result<&mut ActiveSession> {
        self.active.as_mut().ok_or(Error::Cancelled)
    }

    /// Start if idle, otherwise stop.
    ///
    /// # Errors
    /// Returns the start failure, if any.
    pub async fn toggle(&mut self) -> Result<()> {
        if self.active.is_some() {
            self.stop();
            Ok(())
        } else {
            self.start().await
        }
    }

    /// Release every resource and return to idle. Safe in any state.
    pub fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            tracing::info!("Stopping voice session");
            active.teardown();
        }
        self.set_speaking(false);
        if !self.transcript.pending().is_empty() {
            self.transcript.clear_pending();
            self.handlers.transcript("");
        }
        self.set_status(SessionStatus::Idle);
    }

    /// Handle the next stop request, server message, finished send or captured frame.
    ///
    /// A frame is only taken once the previous one has been written, so a
    /// slow socket holds frames back in the capture stream while stop
    /// requests and server messages keep being handled.
    ///
    /// Returns whether the session is still active.
    pub async fn step(&mut self) -> bool {
        let speaking = self.speaking;
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.transport.is_none() {
            tracing::debug!("Session has no stream, tearing down");
            self.stop();
            return false;
        }

        let inbound = {
            let ActiveSession { transport, capture, sending, playback, .. } = active;
            let Some(transport) = transport.as_mut() else {
                return false;
            };
            let writing = sending.is_some();
            tokio::select! {
                biased;
                _ = self.commands.recv() => Inbound::Command,
                event = transport.next_event() => Inbound::Server(event),
                sent = flush(sending) => Inbound::Sent(sent),
                frame = next_frame(capture.as_mut()), if !writing => Inbound::Frame(frame),
                () = drained(playback.as_ref()), if speaking => Inbound::PlaybackDrained,
            }
        };

        match inbound {
            Inbound::Command => self.stop(),
            Inbound::Server(result) => {
                for event in LiveEvent::from_inbound(result) {
                    self.handle_event(event);
                    if self.active.is_none() {
                        break;
                    }
                }
            }
            Inbound::Sent(result) => self.sent(result),
            Inbound::Frame(Some(frame)) => self.forward_frame(frame),
            Inbound::Frame(None) => self.fail(&Error::Capture("capture stream ended".to_string())),
            Inbound::PlaybackDrained => {}
        }
        self.sync_speaking();
        self.active.is_some()
    }

    /// Drive the session until it stops.
    pub async fn run(&mut self) {
        while self.step().await {}
    }

    fn handle_event(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Opened => {
                if let Some(active) = self.active.as_mut() {
                    active.opened = true;
                }
                tracing::info!("Live session open");
                self.set_status(SessionStatus::Connected);
            }
            LiveEvent::InputTranscript(text) => {
                self.transcript.push_input(&text);
                self.handlers.transcript(self.transcript.pending());
            }
            LiveEvent::TurnComplete => {
                if self.transcript.complete_turn().is_some() {
                    self.handlers.history(self.transcript.messages());
                }
                self.handlers.transcript("");
            }
            LiveEvent::OutputTranscript(text) => {
                self.transcript.push_output(&text);
                self.handlers.history(self.transcript.messages());
            }
            LiveEvent::AudioChunk(blob) => {
                self.play(&blob);
                self.sync_speaking();
            }
            LiveEvent::Interrupted => {
                if let Some(playback) = self.active.as_mut().and_then(|active| active.playback.as_mut()) {
                    playback.interrupt();
                }
                self.sync_speaking();
            }
            LiveEvent::GoAway { time_left } => {
                tracing::warn!(?time_left, "Server will close the session soon");
            }
            LiveEvent::Closed => {
                tracing::info!("Live session closed by server");
                if self.status == SessionStatus::Connecting {
                    self.fail(&Error::ConnectionClosed);
                } else {
                    self.stop();
                }
            }
            LiveEvent::Failed(err) => self.fail(&err),
        }
    }

    fn play(&mut self, blob: &Blob) {
        let Some(playback) = self.active.as_mut().and_then(|active| active.playback.as_mut()) else {
            return;
        };
        if !blob.mime_type.starts_with("audio/pcm") {
            tracing::debug!(mime_type = %blob.mime_type, "Skipping non-PCM inline data");
            return;
        }
        match codec::decode_payload(&blob.data) {
            Ok(buffer) => {
                if let Err(err) = playback.enqueue(&buffer) {
                    tracing::warn!(error = %err, "Could not schedule audio chunk");
                }
            }
            Err(err) => tracing::warn!(error = %err, "Dropping undecodable audio chunk"),
        }
    }

    fn forward_frame(&mut self, frame: AudioFrame) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.opened {
            tracing::trace!("Discarding frame captured before the session opened");
            return;
        }
        let Some(transport) = active.transport.as_mut() else {
            return;
        };

        let blob = codec::encode_frame(&frame.samples, self.constraints.sample_rate);
        active.sending = Some(transport.send(ClientEvent::audio(blob)));
    }

    fn sent(&mut self, result: Result<()>) {
        if let Some(active) = self.active.as_mut() {
            active.sending = None;
        }
        if let Err(err) = result {
            if err.kind() == ErrorKind::NetworkError {
                self.fail(&err);
            } else {
                tracing::error!(error = %err, "Failed to send audio frame");
            }
        }
    }

    fn sync_speaking(&mut self) {
        let speaking = self.is_speaking();
        self.set_speaking(speaking);
    }

    fn set_speaking(&mut self, speaking: bool) {
        if self.speaking != speaking {
            tracing::debug!(speaking, "Model playback changed");
            self.speaking = speaking;
            self.handlers.speaking(speaking);
        }
    }

    fn fail(&mut self, err: &Error) {
        let message = err.user_message();
        tracing::error!(error = %err, kind = ?err.kind(), "Voice session failed");
        self.error = Some(message.clone());
        self.handlers.error(err, &message);
        self.set_status(SessionStatus::Error);
        self.stop();
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            tracing::debug!(from = %self.status, to = %status, "Session status changed");
            self.status = status;
            self.handlers.status(status);
        }
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.teardown();
        }
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("status", &self.status)
            .field("error", &self.error)
            .field("config", &self.config)
            .field("active", &self.active.is_some())
            .finish_non_exhaustive()
    }
}

async fn until_stopped<T>(
    commands: &mut mpsc::UnboundedReceiver<Command>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = commands.recv() => Err(Error::Cancelled),
        res = fut => res,
    }
}

async fn next_frame(capture: Option<&mut CaptureStream>) -> Option<AudioFrame> {
    match capture {
        Some(capture) => capture.next_frame().await,
        None => std::future::pending().await,
    }
}

async fn flush(sending: &mut Option<BoxFuture<'static, Result<()>>>) -> Result<()> {
    match sending.as_mut() {
        Some(send) => send.await,
        None => std::future::pending().await,
    }
}

/// Resolves once everything queued on `playback` should have finished.
async fn drained(playback: Option<&PlaybackScheduler>) {
    match playback {
        Some(playback) => {
            let remaining = Duration::try_from_secs_f64(playback.cursor() - playback.now()).unwrap_or_default();
            tokio::time::sleep(remaining).await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::{CaptureFeed, ChannelCapture};
    use crate::audio::playback::{VirtualClock, VirtualDevice};
    use crate::protocol::models::{Content, Part, Transcription};
    use crate::protocol::server_events::{ServerContent, ServerEvent};
    use crate::sdk::transport::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct MockTransport {
        incoming: mpsc::UnboundedReceiver<Result<ServerEvent>>,
        outgoing: mpsc::UnboundedSender<ClientEvent>,
        /// Writes never complete, like a socket whose peer stopped reading.
        stalled: bool,
    }

    impl Transport for MockTransport {
        fn send(&mut self, event: ClientEvent) -> BoxFuture<'static, Result<()>> {
            if self.stalled {
                return Box::pin(std::future::pending());
            }
            let queued = self.outgoing.send(event).map_err(|_| Error::ConnectionClosed);
            Box::pin(std::future::ready(queued))
        }

        fn next_event(&mut self) -> BoxFuture<'_, Result<Option<ServerEvent>>> {
            Box::pin(async move { self.incoming.recv().await.transpose() })
        }
    }

    #[derive(Default)]
    struct MockConnector {
        credential_error: Option<Error>,
        never_issue: bool,
        transports: VecDeque<MockTransport>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Connector for MockConnector {
        async fn fetch_credential(&mut self) -> Result<Credential> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.never_issue {
                std::future::pending::<()>().await;
            }
            match self.credential_error.take() {
                Some(err) => Err(err),
                None => Ok(Credential::new("ephemeral")),
            }
        }

        async fn connect(&mut self, _credential: &Credential, _config: &LiveConfig) -> Result<Box<dyn Transport>> {
            let transport = self.transports.pop_front().ok_or(Error::ConnectionClosed)?;
            Ok(Box::new(transport))
        }
    }

    /// Refuses the microphone on the first open only.
    struct DeniedOnce {
        inner: ChannelCapture,
        denied: bool,
    }

    #[async_trait::async_trait]
    impl AudioCapture for DeniedOnce {
        async fn open(&mut self, constraints: &CaptureConstraints) -> Result<CaptureStream> {
            if !self.denied {
                self.denied = true;
                return Err(Error::PermissionDenied);
            }
            self.inner.open(constraints).await
        }
    }

    struct Server {
        events: mpsc::UnboundedSender<Result<ServerEvent>>,
        sent: mpsc::UnboundedReceiver<ClientEvent>,
    }

    impl Server {
        fn push(&self, event: ServerEvent) {
            self.events.send(Ok(event)).unwrap();
        }
    }

    fn mock_transport() -> (MockTransport, Server) {
        let (events, incoming) = mpsc::unbounded_channel();
        let (outgoing, sent) = mpsc::unbounded_channel();
        (MockTransport { incoming, outgoing, stalled: false }, Server { events, sent })
    }

    struct Harness {
        session: VoiceSession,
        server: Server,
        feed: CaptureFeed,
        device: VirtualDevice,
        statuses: Arc<Mutex<Vec<SessionStatus>>>,
        speaking: Arc<Mutex<Vec<bool>>>,
        fetches: Arc<AtomicUsize>,
    }

    fn harness_on(
        clock: VirtualClock,
        mut connector: MockConnector,
        capture: impl AudioCapture + 'static,
        feed: CaptureFeed,
    ) -> Harness {
        let (transport, server) = mock_transport();
        connector.transports.push_back(transport);
        let fetches = Arc::clone(&connector.fetches);
        let device = VirtualDevice::new(clock);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let speaking = Arc::new(Mutex::new(Vec::new()));
        let (recorded, heard) = (Arc::clone(&statuses), Arc::clone(&speaking));

        let session = VoiceSession::builder()
            .connector(connector)
            .capture(capture)
            .output(device.clone())
            .frame_size(4)
            .handlers(
                EventHandlers::new()
                    .on_status(move |status| recorded.lock().unwrap().push(status))
                    .on_speaking(move |speaking| heard.lock().unwrap().push(speaking)),
            )
            .build()
            .unwrap();

        Harness { session, server, feed, device, statuses, speaking, fetches }
    }

    fn harness_with(connector: MockConnector, capture: impl AudioCapture + 'static, feed: CaptureFeed) -> Harness {
        harness_on(VirtualClock::manual(), connector, capture, feed)
    }

    fn harness() -> Harness {
        let (capture, feed) = ChannelCapture::channel();
        harness_with(MockConnector::default(), capture, feed)
    }

    /// Swap in a connector whose only stream is `transport`.
    fn reconnect_through(h: &mut Harness, transport: MockTransport) {
        h.session.connector = Box::new(MockConnector {
            transports: VecDeque::from([transport]),
            ..MockConnector::default()
        });
    }

    fn statuses(h: &Harness) -> Vec<SessionStatus> {
        h.statuses.lock().unwrap().clone()
    }

    fn speaking(h: &Harness) -> Vec<bool> {
        h.speaking.lock().unwrap().clone()
    }

    fn setup_complete() -> ServerEvent {
        ServerEvent { setup_complete: Some(serde_json::json!({})), ..ServerEvent::default() }
    }

    fn content(content: ServerContent) -> ServerEvent {
        ServerEvent { server_content: Some(content), ..ServerEvent::default() }
    }

    fn input(text: &str) -> ServerEvent {
        content(ServerContent {
            input_transcription: Some(Transcription { text: Some(text.to_string()) }),
            ..ServerContent::default()
        })
    }

    fn output(text: &str) -> ServerEvent {
        content(ServerContent {
            output_transcription: Some(Transcription { text: Some(text.to_string()) }),
            ..ServerContent::default()
        })
    }

    fn turn_complete() -> ServerEvent {
        content(ServerContent { turn_complete: true, ..ServerContent::default() })
    }

    fn interrupted() -> ServerEvent {
        content(ServerContent { interrupted: true, ..ServerContent::default() })
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn speech(seconds: f64) -> ServerEvent {
        let samples = vec![0.1; (seconds * f64::from(OUTPUT_SAMPLE_RATE)).round() as usize];
        let blob = codec::encode_frame(&samples, OUTPUT_SAMPLE_RATE);
        content(ServerContent {
            model_turn: Some(Content {
                role: Some("model".to_string()),
                parts: vec![Part { text: None, inline_data: Some(blob) }],
            }),
            ..ServerContent::default()
        })
    }

    async fn open(h: &mut Harness) {
        h.session.start().await.unwrap();
        h.server.push(setup_complete());
        assert!(h.session.step().await);
        assert_eq!(h.session.status(), SessionStatus::Connected);
    }

    async fn pump(h: &mut Harness, events: Vec<ServerEvent>) {
        for event in events {
            h.server.push(event);
            h.session.step().await;
        }
    }

    #[tokio::test]
    async fn denied_microphone_reports_then_recovers() {
        let (inner, feed) = ChannelCapture::channel();
        let mut h = harness_with(MockConnector::default(), DeniedOnce { inner, denied: false }, feed);

        let err = h.session.start().await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
        assert_eq!(statuses(&h), vec![SessionStatus::Connecting, SessionStatus::Error, SessionStatus::Idle]);
        assert_eq!(
            h.session.error_message(),
            Some("Microphone permission denied. Check your system audio settings.")
        );
        assert_eq!(h.device.log().open_outputs(), 0);
        assert!(!h.session.is_active());

        h.session.start().await.unwrap();
        assert_eq!(h.session.error_message(), None);
        assert_eq!(h.session.status(), SessionStatus::Connecting);
        assert!(h.feed.is_live());
    }

    #[tokio::test]
    async fn rejected_credential_never_touches_devices() {
        let (capture, feed) = ChannelCapture::channel();
        let connector = MockConnector {
            credential_error: Some(Error::AuthFailure("relay returned 500".to_string())),
            ..MockConnector::default()
        };
        let mut h = harness_with(connector, capture, feed);

        assert!(h.session.start().await.is_err());
        assert_eq!(h.session.error_message(), Some("Could not authenticate with the voice server."));
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(!h.feed.is_live());
        assert!(h.device.log().records().is_empty());
        assert_eq!(h.device.log().open_outputs(), 0);
    }

    #[tokio::test]
    async fn failed_connect_releases_microphone_and_output() {
        let mut h = harness();
        h.session.connector = Box::new(MockConnector::default());

        let err = h.session.start().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(statuses(&h), vec![SessionStatus::Connecting, SessionStatus::Error, SessionStatus::Idle]);
        assert_eq!(h.session.error_message(), Some("Connection error with the AI. Please try again."));
        assert!(!h.feed.is_live());
        assert_eq!(h.device.log().open_outputs(), 0);
        assert!(!h.session.is_active());
        assert!(!h.session.step().await);
    }

    #[tokio::test]
    async fn missing_microphone_releases_the_opened_output() {
        let (mut capture, feed) = ChannelCapture::channel();
        capture.set_permission(crate::audio::capture::Permission::NoDevice);
        let mut h = harness_with(MockConnector::default(), capture, feed);

        let err = h.session.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);
        assert_eq!(statuses(&h), vec![SessionStatus::Connecting, SessionStatus::Error, SessionStatus::Idle]);
        assert_eq!(h.session.error_message(), Some("No microphone found."));
        assert_eq!(h.device.log().open_outputs(), 0);
    }

    #[tokio::test]
    async fn start_while_active_is_ignored() {
        let mut h = harness();
        open(&mut h).await;

        h.session.start().await.unwrap();
        h.session.toggle().await.unwrap();
        assert_eq!(h.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn stop_is_safe_in_every_state() {
        let mut h = harness();
        h.session.stop();
        assert!(statuses(&h).is_empty());

        h.session.start().await.unwrap();
        h.session.stop();
        assert_eq!(h.session.status(), SessionStatus::Idle);

        let (transport, mut server) = mock_transport();
        reconnect_through(&mut h, transport);
        h.session.start().await.unwrap();
        server.events.send(Ok(setup_complete())).unwrap();
        h.session.step().await;
        assert_eq!(h.session.status(), SessionStatus::Connected);

        h.session.stop();
        h.session.stop();
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(!h.feed.is_live());
        assert_eq!(h.device.log().open_outputs(), 0);
        assert!(server.sent.try_recv().is_err());
        assert!(!h.session.step().await);
    }

    #[tokio::test]
    async fn frames_flow_only_after_open_in_capture_order() {
        let mut h = harness();
        h.session.start().await.unwrap();

        assert!(h.feed.push(&[0.5; 4]));
        assert!(h.session.step().await);
        assert!(h.server.sent.try_recv().is_err());

        h.server.push(setup_complete());
        h.session.step().await;

        h.feed.push(&[0.25, 0.25, 0.25, 0.25, -0.5, -0.5]);
        h.feed.push(&[-0.5, -0.5]);
        for _ in 0..4 {
            assert!(h.session.step().await);
        }

        let expected = [
            codec::encode_frame(&[0.25; 4], crate::audio::INPUT_SAMPLE_RATE),
            codec::encode_frame(&[-0.5; 4], crate::audio::INPUT_SAMPLE_RATE),
        ];
        for blob in expected {
            match h.server.sent.try_recv().unwrap() {
                ClientEvent::RealtimeInput(input) => assert_eq!(input.audio, Some(blob)),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn transcripts_build_history_per_turn() {
        let mut h = harness();
        open(&mut h).await;

        pump(&mut h, vec![input("What is "), input("a tort?")]).await;
        assert_eq!(h.session.live_transcript(), "What is a tort?");

        pump(&mut h, vec![turn_complete(), output("A tort "), output("is a civil wrong."), turn_complete()]).await;
        assert_eq!(h.session.live_transcript(), "");

        pump(&mut h, vec![input("Thanks"), turn_complete(), output("Anytime.")]).await;

        let history: Vec<_> = h.session.history().iter().map(|m| (m.speaker, m.text.as_str())).collect();
        assert_eq!(
            history,
            vec![
                (crate::Speaker::User, "What is a tort?"),
                (crate::Speaker::Model, "A tort is a civil wrong."),
                (crate::Speaker::User, "Thanks"),
                (crate::Speaker::Model, "Anytime."),
            ]
        );
    }

    #[tokio::test]
    async fn audio_chunks_play_back_to_back() {
        let mut h = harness();
        open(&mut h).await;

        pump(&mut h, vec![speech(0.5)]).await;
        h.device.clock().advance(0.1);
        pump(&mut h, vec![speech(0.3)]).await;

        let starts: Vec<f64> = h.device.log().records().iter().map(|r| r.start).collect();
        assert_eq!(starts.len(), 2);
        assert!(starts[0].abs() < 1e-9);
        assert!((starts[1] - 0.5).abs() < 1e-9);
        assert!(h.session.is_speaking());
    }

    #[tokio::test]
    async fn interruption_silences_queued_audio() {
        let mut h = harness();
        open(&mut h).await;

        pump(&mut h, vec![speech(0.4), speech(0.4), speech(0.4)]).await;
        h.device.clock().advance(0.2);
        pump(&mut h, vec![interrupted()]).await;

        assert!(h.device.log().records().iter().all(|r| r.stopped));
        assert!(!h.session.is_speaking());

        pump(&mut h, vec![speech(0.2)]).await;
        let last = h.device.log().records().last().copied().unwrap();
        assert!((last.start - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn stalled_send_keeps_interrupt_and_stop_responsive() {
        let mut h = harness();
        let (mut transport, server) = mock_transport();
        transport.stalled = true;
        reconnect_through(&mut h, transport);
        h.server = server;
        open(&mut h).await;

        pump(&mut h, vec![speech(1.0), speech(1.0)]).await;
        assert!(h.feed.push(&[0.5; 4]));
        assert!(h.session.step().await);

        let server = &h.server;
        let (stepped, ()) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(500), h.session.step()),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                server.push(interrupted());
            }
        );
        assert_eq!(stepped.ok(), Some(true));
        assert!(h.device.log().records().iter().all(|r| r.stopped));
        assert!(!h.session.is_speaking());

        assert!(h.feed.push(&[0.5; 4]));
        let handle = h.session.handle();
        let (stepped, ()) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(500), h.session.step()),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(handle.stop());
            }
        );
        assert_eq!(stepped.ok(), Some(false));
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(!h.feed.is_live());
        assert_eq!(h.device.log().open_outputs(), 0);
    }

    #[tokio::test]
    async fn speaking_follows_playback() {
        let mut h = harness();
        open(&mut h).await;

        pump(&mut h, vec![speech(0.4), speech(0.4)]).await;
        assert_eq!(speaking(&h), vec![true]);

        h.device.clock().advance(0.2);
        pump(&mut h, vec![interrupted()]).await;
        assert_eq!(speaking(&h), vec![true, false]);

        pump(&mut h, vec![speech(0.3)]).await;
        h.device.clock().advance(0.5);
        pump(&mut h, vec![input("hm")]).await;
        assert_eq!(speaking(&h), vec![true, false, true, false]);

        pump(&mut h, vec![speech(0.3)]).await;
        h.session.stop();
        assert_eq!(speaking(&h), vec![true, false, true, false, true, false]);
    }

    #[tokio::test]
    async fn speaking_ends_once_queued_audio_drains() {
        let (capture, feed) = ChannelCapture::channel();
        let mut h = harness_on(VirtualClock::wall(), MockConnector::default(), capture, feed);
        open(&mut h).await;

        pump(&mut h, vec![speech(0.05)]).await;
        assert_eq!(speaking(&h), vec![true]);

        let stepped = tokio::time::timeout(Duration::from_secs(1), h.session.step()).await;
        assert_eq!(stepped.ok(), Some(true));
        assert_eq!(speaking(&h), vec![true, false]);
        assert_eq!(h.session.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn server_close_returns_to_idle_quietly() {
        let mut h = harness();
        open(&mut h).await;

        drop(std::mem::replace(&mut h.server.events, mpsc::unbounded_channel().0));
        assert!(!h.session.step().await);
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert_eq!(h.session.error_message(), None);
        assert!(!h.feed.is_live());
        assert_eq!(h.device.log().open_outputs(), 0);
    }

    #[tokio::test]
    async fn close_before_setup_is_a_failure() {
        let mut h = harness();
        h.session.start().await.unwrap();

        drop(std::mem::replace(&mut h.server.events, mpsc::unbounded_channel().0));
        assert!(!h.session.step().await);
        assert_eq!(statuses(&h), vec![SessionStatus::Connecting, SessionStatus::Error, SessionStatus::Idle]);
        assert_eq!(h.session.error_message(), Some("Connection error with the AI. Please try again."));
    }

    #[tokio::test]
    async fn stream_error_reports_and_tears_down() {
        let mut h = harness();
        open(&mut h).await;
        h.server.push(input("half a sent"));
        h.session.step().await;

        h.server.events.send(Err(Error::AuthFailure("credential expired".to_string()))).unwrap();
        assert!(!h.session.step().await);

        assert_eq!(
            statuses(&h),
            vec![SessionStatus::Connecting, SessionStatus::Connected, SessionStatus::Error, SessionStatus::Idle]
        );
        assert_eq!(h.session.error_message(), Some("Could not authenticate with the voice server."));
        assert_eq!(h.session.live_transcript(), "");
        assert!(!h.feed.is_live());
    }

    #[tokio::test]
    async fn handle_cancels_a_pending_connect() {
        let (capture, feed) = ChannelCapture::channel();
        let connector = MockConnector { never_issue: true, ..MockConnector::default() };
        let mut h = harness_with(connector, capture, feed);
        let handle = h.session.handle();

        let (result, sent) = tokio::join!(h.session.start(), async { handle.stop() });
        assert!(sent);
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert_eq!(h.session.error_message(), None);
        assert!(!h.session.is_active());
    }

    #[tokio::test]
    async fn handle_stops_a_running_session() {
        let mut h = harness();
        open(&mut h).await;

        assert!(h.session.handle().stop());
        assert!(!h.session.step().await);
        assert_eq!(h.session.status(), SessionStatus::Idle);
        assert!(!h.feed.is_live());
    }

    #[tokio::test]
    async fn dropping_the_session_releases_devices() {
        let mut h = harness();
        open(&mut h).await;
        pump(&mut h, vec![speech(1.0)]).await;

        let Harness { session, feed, device, .. } = h;
        drop(session);
        assert!(!feed.is_live());
        assert_eq!(device.log().open_outputs(), 0);
        assert!(device.log().records().iter().all(|r| r.stopped));
    }
}
