//! Voice processing module
//!
//! Handles capture segmentation, WAV framing, and the playback queue.
//! Transport-specific sources and sinks live in `discord` and [`local`].

pub mod activity;
mod capture;
pub mod local;
mod playback;
mod sink;
pub mod wav;

use tokio::sync::mpsc;

pub use activity::{GateEvent, SpeechGate};
pub use capture::{
    ArtifactNamer, CaptureConfig, CaptureSegment, CaptureSegmenter, SegmentId,
    prepare_recordings_dir,
};
pub use playback::{PlayTicket, PlaybackAction, PlaybackItem, PlaybackQueue};
pub use sink::{PlaybackDone, PlaybackSink};
pub use wav::WavSpec;

/// Identity of one speaker within a session (a Discord user id, or a fixed id locally)
pub type SpeakerId = u64;

/// Decoded PCM chunks for one speaker; the sender dropping ends the stream
pub type AudioStream = mpsc::Receiver<crate::Result<Vec<i16>>>;
