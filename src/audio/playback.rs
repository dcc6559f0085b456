//! Gapless playback of audio chunks that arrive at irregular intervals.
//!
//! The scheduler keeps one cursor on the output clock. Each chunk starts at
//! the cursor (snapped forward to "now" after a stall) and pushes the cursor
//! by its duration, so chunks play back to back in arrival order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::codec::PcmBuffer;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackHandle(pub u64);

/// An output audio context: a clock plus the ability to start buffers at a given time.
pub trait AudioOutput: Send {
    /// Current time on the output clock, in seconds.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` on the output clock.
    ///
    /// # Errors
    /// Returns an error if the output has been closed or rejects the buffer.
    #[allow(clippy::result_large_err)]
    fn schedule(&mut self, buffer: &PcmBuffer, start_at: f64) -> Result<PlaybackHandle>;

    /// Stop a scheduled buffer immediately. Unknown or finished handles are ignored.
    fn stop(&mut self, handle: PlaybackHandle);

    /// Release the output. Further scheduling fails.
    fn close(&mut self);
}

/// Opens a fresh [`AudioOutput`] for each session.
pub trait OutputDevice: Send {
    /// # Errors
    /// Returns an error if no output can be opened at `sample_rate`.
    #[allow(clippy::result_large_err)]
    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn AudioOutput>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub handle: PlaybackHandle,
    pub start: f64,
    pub end: f64,
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    cursor: f64,
    scheduled: Vec<ScheduledChunk>,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        let cursor = output.current_time();
        Self { output, cursor, scheduled: Vec::new() }
    }

    /// Schedule a decoded chunk right after everything already queued.
    ///
    /// Empty buffers are ignored and yield `None`.
    ///
    /// # Errors
    /// Returns an error if the output refuses the buffer.
    #[allow(clippy::result_large_err)]
    pub fn enqueue(&mut self, buffer: &PcmBuffer) -> Result<Option<ScheduledChunk>> {
        if buffer.is_empty() {
            return Ok(None);
        }
        self.reap();

        let now = self.output.current_time();
        if self.cursor < now {
            tracing::trace!(behind = now - self.cursor, "Playback cursor snapped to now");
            self.cursor = now;
        }

        let start = self.cursor;
        let handle = self.output.schedule(buffer, start)?;
        let chunk = ScheduledChunk { handle, start, end: start + buffer.duration() };
        self.cursor = chunk.end;
        self.scheduled.push(chunk);
        Ok(Some(chunk))
    }

    /// Hard-cancel every pending chunk and reset the cursor to now.
    ///
    /// Returns how many chunks were cancelled.
    pub fn interrupt(&mut self) -> usize {
        self.reap();
        let cancelled = self.scheduled.len();
        for chunk in self.scheduled.drain(..) {
            self.output.stop(chunk.handle);
        }
        self.cursor = self.output.current_time();
        if cancelled > 0 {
            tracing::debug!(cancelled, "Playback interrupted");
        }
        cancelled
    }

    /// Forget chunks that have finished playing.
    pub fn reap(&mut self) {
        let now = self.output.current_time();
        self.scheduled.retain(|chunk| chunk.end > now);
    }

    /// Whether any chunk is still queued or playing.
    pub fn is_speaking(&mut self) -> bool {
        self.reap();
        !self.scheduled.is_empty()
    }

    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }

    #[must_use]
    pub fn pending(&self) -> &[ScheduledChunk] {
        &self.scheduled
    }

    #[must_use]
    pub fn now(&self) -> f64 {
        self.output.current_time()
    }

    /// Cancel everything and release the output.
    pub fn close(&mut self) {
        self.interrupt();
        self.output.close();
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("cursor", &self.cursor)
            .field("scheduled", &self.scheduled)
            .finish_non_exhaustive()
    }
}

/// Shared clock for [`VirtualOutput`]s. Manual clocks only move when advanced.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    origin: Option<Instant>,
    offset: Arc<Mutex<f64>>,
}

impl VirtualClock {
    #[must_use]
    pub fn manual() -> Self {
        Self { origin: None, offset: Arc::new(Mutex::new(0.0)) }
    }

    /// A clock that follows wall time from the moment it is created.
    #[must_use]
    pub fn wall() -> Self {
        Self { origin: Some(Instant::now()), offset: Arc::new(Mutex::new(0.0)) }
    }

    #[must_use]
    pub fn now(&self) -> f64 {
        let offset = *self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        offset + self.origin.map_or(0.0, |origin| origin.elapsed().as_secs_f64())
    }

    pub fn advance(&self, seconds: f64) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += seconds;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackRecord {
    pub handle: PlaybackHandle,
    pub start: f64,
    pub duration: f64,
    pub stopped: bool,
}

/// Records a [`PlaybackLog`] keeps before dropping the oldest.
pub const MAX_PLAYBACK_RECORDS: usize = 4096;

#[derive(Debug, Default)]
struct LogState {
    records: VecDeque<PlaybackRecord>,
    opened: usize,
    closed: usize,
}

/// What a [`VirtualDevice`] was asked to play, shared across its outputs.
///
/// Only the most recent [`MAX_PLAYBACK_RECORDS`] chunks are kept, so a
/// long headless run on a wall clock stays bounded.
#[derive(Debug, Clone, Default)]
pub struct PlaybackLog {
    inner: Arc<Mutex<LogState>>,
}

impl PlaybackLog {
    #[must_use]
    pub fn records(&self) -> Vec<PlaybackRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).records.iter().copied().collect()
    }

    /// Outputs opened and not yet closed.
    #[must_use]
    pub fn open_outputs(&self) -> usize {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.opened - state.closed
    }

    fn with<T>(&self, f: impl FnOnce(&mut LogState) -> T) -> T {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Output that keeps time and records scheduling without touching hardware.
///
/// Meant for tests and headless runs.
#[derive(Debug)]
pub struct VirtualOutput {
    clock: VirtualClock,
    log: PlaybackLog,
    next_handle: u64,
    closed: bool,
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&mut self, buffer: &PcmBuffer, start_at: f64) -> Result<PlaybackHandle> {
        if self.closed {
            return Err(Error::InvalidAudio("output is closed".to_string()));
        }
        self.next_handle += 1;
        let handle = PlaybackHandle(self.next_handle);
        self.log.with(|state| {
            if state.records.len() == MAX_PLAYBACK_RECORDS {
                state.records.pop_front();
            }
            state.records.push_back(PlaybackRecord {
                handle,
                start: start_at,
                duration: buffer.duration(),
                stopped: false,
            });
        });
        Ok(handle)
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        self.log.with(|state| {
            if let Some(record) = state.records.iter_mut().rev().find(|r| r.handle == handle) {
                record.stopped = true;
            }
        });
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.with(|state| state.closed += 1);
        }
    }
}

/// Device producing [`VirtualOutput`]s on a shared clock.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    clock: VirtualClock,
    log: PlaybackLog,
}

impl VirtualDevice {
    #[must_use]
    pub fn new(clock: VirtualClock) -> Self {
        Self { clock, log: PlaybackLog::default() }
    }

    #[must_use]
    pub const fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    #[must_use]
    pub const fn log(&self) -> &PlaybackLog {
        &self.log
    }
}

impl OutputDevice for VirtualDevice {
    fn open(&mut self, sample_rate: u32) -> Result<Box<dyn AudioOutput>> {
        tracing::debug!(sample_rate, "Opening virtual output");
        self.log.with(|state| state.opened += 1);
        Ok(Box::new(VirtualOutput {
            clock: self.clock.clone(),
            log: self.log.clone(),
            next_handle: 0,
            closed: false,
        }))
    }
}
