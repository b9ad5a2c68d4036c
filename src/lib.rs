//! Parley - turn-taking voice bridge for a speech-processing service
//!
//! This library coordinates full-duplex voice between a live audio source
//! and an external speech service:
//! - Capture each speaker's utterance and frame it as a WAV artifact
//! - Announce captures and receive reply artifacts over a control channel
//! - Play replies in order, pausing whenever somebody starts talking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Transports                        │
//! │      Discord (serenity/songbird)  │  Local devices   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ speaker streams / playback
//! ┌────────────────────▼────────────────────────────────┐
//! │                Session actor                         │
//! │  TurnCoordinator │ CaptureSegmenter │ PlaybackQueue  │
//! └────────────────────┬────────────────────────────────┘
//!                      │ speech_start / speech_end / artifacts
//! ┌────────────────────▼────────────────────────────────┐
//! │          Speech service (WebSocket control)          │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod commands;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod discord;
pub mod error;
pub mod voice;

pub use commands::{CommandRegistry, Reply};
pub use config::Config;
pub use control::{
    ControlChannel, ControlConfig, ControlHandle, ControlMessage, ControlRouter, ControlSink, Route,
};
pub use coordinator::{Effect, Event, Mode, Session, SessionHandle, SessionInput, TurnCoordinator};
pub use error::{Error, ErrorKind, Result};
pub use voice::{
    AudioStream, CaptureConfig, CaptureSegmenter, PlayTicket, PlaybackAction, PlaybackDone,
    PlaybackQueue, PlaybackSink, SegmentId, SpeakerId, WavSpec,
};
