use tokio::sync::mpsc;

use super::codec::INPUT_SAMPLE_RATE;
use crate::{Error, Result};

pub const DEFAULT_FRAME_SIZE: usize = 4096;
const FEED_CAPACITY: usize = 64;

/// Processing requested from the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub frame_size: usize,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate: INPUT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

/// One block of captured mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

/// A live microphone stream.
///
/// Backends hold the sending half and must release the device once
/// [`mpsc::Sender::is_closed`] reports the stream was stopped or dropped.
#[derive(Debug)]
pub struct CaptureStream {
    frames: mpsc::Receiver<AudioFrame>,
}

impl CaptureStream {
    #[must_use]
    pub const fn new(frames: mpsc::Receiver<AudioFrame>) -> Self {
        Self { frames }
    }

    /// Await the next captured frame. `None` once the device is gone.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }

    /// Stop every track of the stream. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.frames.close();
    }
}

/// A microphone backend.
#[async_trait::async_trait]
pub trait AudioCapture: Send {
    /// Request access to the device and start streaming frames.
    ///
    /// # Errors
    /// `PermissionDenied`, `DeviceNotFound`, or `Capture` for any other failure.
    async fn open(&mut self, constraints: &CaptureConstraints) -> Result<CaptureStream>;
}

/// Capture backend fed by the host application through a [`CaptureFeed`].
///
/// Whatever owns the platform's audio callback pushes sample blocks into the
/// feed; each `open` connects a fresh stream to it.
#[derive(Debug)]
pub struct ChannelCapture {
    slot: std::sync::Arc<std::sync::Mutex<Option<FeedSlot>>>,
    permission: Permission,
}

#[derive(Debug)]
struct FeedSlot {
    tx: mpsc::Sender<AudioFrame>,
    frame_size: usize,
    pending: Vec<f32>,
}

/// Outcome a [`ChannelCapture`] reports on `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    #[default]
    Granted,
    Denied,
    NoDevice,
}

/// Producer side of a [`ChannelCapture`].
#[derive(Debug, Clone)]
pub struct CaptureFeed {
    slot: std::sync::Arc<std::sync::Mutex<Option<FeedSlot>>>,
}

impl ChannelCapture {
    #[must_use]
    pub fn channel() -> (Self, CaptureFeed) {
        let slot = std::sync::Arc::new(std::sync::Mutex::new(None));
        let feed = CaptureFeed { slot: std::sync::Arc::clone(&slot) };
        (Self { slot, permission: Permission::Granted }, feed)
    }

    /// Change what the next `open` reports, e.g. after the user revokes access.
    pub const fn set_permission(&mut self, permission: Permission) {
        self.permission = permission;
    }
}

#[async_trait::async_trait]
impl AudioCapture for ChannelCapture {
    async fn open(&mut self, constraints: &CaptureConstraints) -> Result<CaptureStream> {
        match self.permission {
            Permission::Denied => return Err(Error::PermissionDenied),
            Permission::NoDevice => return Err(Error::DeviceNotFound),
            Permission::Granted => {}
        }
        if constraints.frame_size == 0 {
            return Err(Error::Capture("frame size must be positive".to_string()));
        }

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        {
            let mut slot = self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Some(FeedSlot {
                tx,
                frame_size: constraints.frame_size,
                pending: Vec::with_capacity(constraints.frame_size),
            });
        }

        tracing::info!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            sample_rate = constraints.sample_rate,
            "Capture stream opened"
        );
        Ok(CaptureStream::new(rx))
    }
}

impl CaptureFeed {
    /// Push captured samples. They are regrouped into fixed-size frames.
    ///
    /// Returns `false` when no stream is open, in which case the samples are dropped.
    pub fn push(&self, samples: &[f32]) -> bool {
        let mut guard = self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(slot) = guard.as_mut() else {
            return false;
        };
        if slot.tx.is_closed() {
            tracing::debug!("Capture stream released");
            *guard = None;
            return false;
        }

        slot.pending.extend_from_slice(samples);
        while slot.pending.len() >= slot.frame_size {
            let rest = slot.pending.split_off(slot.frame_size);
            let samples = std::mem::replace(&mut slot.pending, rest);
            if slot.tx.try_send(AudioFrame { samples }).is_err() {
                tracing::warn!("Capture consumer is behind, dropping frame");
            }
        }
        true
    }

    /// Whether a session is currently holding the stream open.
    #[must_use]
    pub fn is_live(&self) -> bool {
        let guard = self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.as_ref().is_some_and(|slot| !slot.tx.is_closed())
    }
}
