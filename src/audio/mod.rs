//! Audio capture, the PCM wire codec, and playback scheduling.

pub mod capture;
pub mod codec;
pub mod playback;

pub use capture::{AudioCapture, AudioFrame, CaptureConstraints, CaptureFeed, CaptureStream, ChannelCapture, Permission};
pub use codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, PcmBuffer};
pub use playback::{
    AudioOutput, OutputDevice, PlaybackHandle, PlaybackLog, PlaybackRecord, PlaybackScheduler, ScheduledChunk,
    VirtualClock, VirtualDevice, VirtualOutput,
};
