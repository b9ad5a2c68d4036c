//! Turn-taking state machine
//!
//! [`TurnCoordinator::handle`] is a pure transition function: it updates the
//! session state and returns the [`Effect`]s the session must carry out, in
//! order. It never performs I/O, so every barge-in and cancellation rule can
//! be exercised without a voice channel or a speech service.
//!
//! A live speaker always pre-empts playback. Playback resumes once the last
//! speaker finishes unless the peer deletes the queue first.

mod session;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::control::ControlMessage;
use crate::voice::{PlayTicket, PlaybackAction, PlaybackQueue, SegmentId, SpeakerId};
use crate::{Error, Result};

pub use session::{Session, SessionHandle, SessionInput};

/// What the session is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Nothing captured or playing
    Idle,
    /// At least one speaker is being captured; playback is forbidden
    Capturing,
    /// An artifact is playing and nobody is speaking
    Playing,
    /// Capturing, with playback paused by the speaker and due to resume
    Suspended,
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A speaker began talking
    SpeakerStarted(SpeakerId),
    /// A capture segment ended; `artifact` is absent when nothing was written
    CaptureEnded {
        /// Speaker the segment belonged to
        speaker: SpeakerId,
        /// Segment that ended
        segment: SegmentId,
        /// Written artifact, if any
        artifact: Option<PathBuf>,
    },
    /// Inbound control message
    Control(ControlMessage),
    /// The item started under this ticket played to its end
    PlaybackFinished(PlayTicket),
    /// The item started under this ticket could not be played
    PlaybackFailed(PlayTicket),
    /// The session is ending
    Shutdown,
}

/// Side effect to carry out, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send a message to the speech service
    Send(ControlMessage),
    /// Drive the playback output or delete an artifact
    Playback(PlaybackAction),
    /// Start accumulating audio for a speaker
    BeginCapture {
        /// Speaker to capture
        speaker: SpeakerId,
        /// Identity of the new segment
        segment: SegmentId,
    },
    /// Drop a speaker's in-flight audio without writing it
    DiscardCapture(SpeakerId),
}

impl From<PlaybackAction> for Effect {
    fn from(action: PlaybackAction) -> Self {
        Self::Playback(action)
    }
}

/// Per-session turn-taking state
#[derive(Debug)]
pub struct TurnCoordinator {
    mode: Mode,
    queue: PlaybackQueue,
    captures: BTreeMap<SpeakerId, SegmentId>,
    next_segment: u64,
}

impl Default for TurnCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnCoordinator {
    /// Create an idle coordinator with an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mode::Idle,
            queue: PlaybackQueue::new(),
            captures: BTreeMap::new(),
            next_segment: 0,
        }
    }

    /// Apply one event
    ///
    /// # Errors
    ///
    /// Returns `AlreadyCapturing` if a speaker who is already being captured
    /// starts again; the state is left untouched
    pub fn handle(&mut self, event: Event) -> Result<Vec<Effect>> {
        let effects = match event {
            Event::SpeakerStarted(speaker) => self.speaker_started(speaker)?,
            Event::CaptureEnded {
                speaker,
                segment,
                artifact,
            } => self.capture_ended(speaker, segment, artifact),
            Event::Control(message) => self.control(message),
            Event::PlaybackFinished(ticket) => self.playback_ended(ticket),
            Event::PlaybackFailed(ticket) => {
                tracing::warn!(%ticket, "playback failed, skipping artifact");
                self.playback_ended(ticket)
            }
            Event::Shutdown => self.cancel(),
        };

        debug_assert!(
            !(self.queue.is_playing() && !self.captures.is_empty()),
            "playback active during capture"
        );
        Ok(effects)
    }

    fn speaker_started(&mut self, speaker: SpeakerId) -> Result<Vec<Effect>> {
        if self.captures.contains_key(&speaker) {
            return Err(Error::AlreadyCapturing(speaker));
        }

        self.next_segment += 1;
        let segment = SegmentId(self.next_segment);
        self.captures.insert(speaker, segment);

        let mut effects = Vec::new();
        if self.queue.is_playing() {
            tracing::info!(speaker, "speaker interrupted playback");
            effects.extend(self.queue.pause().into_iter().map(Effect::from));
            self.mode = Mode::Suspended;
        } else if self.mode != Mode::Suspended {
            self.mode = Mode::Capturing;
        }

        effects.push(Effect::Send(ControlMessage::SpeechStarted));
        effects.push(Effect::BeginCapture { speaker, segment });
        Ok(effects)
    }

    fn capture_ended(
        &mut self,
        speaker: SpeakerId,
        segment: SegmentId,
        artifact: Option<PathBuf>,
    ) -> Vec<Effect> {
        if self.captures.get(&speaker) != Some(&segment) {
            tracing::debug!(speaker, %segment, "ignoring stale capture");
            return artifact
                .map(|path| vec![Effect::Playback(PlaybackAction::Delete(path))])
                .unwrap_or_default();
        }

        self.captures.remove(&speaker);

        let mut effects = Vec::new();
        if let Some(path) = artifact {
            effects.push(Effect::Send(ControlMessage::SpeechEnded(path)));
        }

        if self.captures.is_empty() {
            let actions = if self.queue.is_paused() {
                self.queue.resume(true)
            } else {
                self.queue.advance(true)
            };
            effects.extend(actions.into_iter().map(Effect::from));
            self.settle();
        }

        effects
    }

    fn control(&mut self, message: ControlMessage) -> Vec<Effect> {
        match message {
            ControlMessage::Ready => {
                tracing::info!("speech service ready");
                Vec::new()
            }
            ControlMessage::ArtifactAvailable(path) => {
                let actions = self.queue.enqueue(path, self.playback_permitted());
                if self.captures.is_empty() {
                    self.settle();
                }
                actions.into_iter().map(Effect::from).collect()
            }
            ControlMessage::Restart => {
                // A live speaker keeps playback forbidden; resume happens when the last one ends
                if !self.captures.is_empty() {
                    tracing::info!(
                        speakers = self.captures.len(),
                        "restart ignored while capturing"
                    );
                    return Vec::new();
                }

                let actions = if self.queue.is_paused() {
                    self.queue.resume(true)
                } else {
                    self.queue.advance(true)
                };
                self.settle();
                actions.into_iter().map(Effect::from).collect()
            }
            ControlMessage::Delete => {
                tracing::info!(
                    queued = self.queue.len(),
                    speakers = self.captures.len(),
                    "deleting queued artifacts"
                );
                self.cancel()
            }
            message => {
                debug_assert!(message.is_outbound());
                tracing::trace!(%message, "ignoring outbound-only message");
                Vec::new()
            }
        }
    }

    fn playback_ended(&mut self, ticket: PlayTicket) -> Vec<Effect> {
        let actions = self.queue.complete(ticket, self.playback_permitted());
        if self.captures.is_empty() {
            self.settle();
        }
        actions.into_iter().map(Effect::from).collect()
    }

    /// Discard every capture and cancel all playback
    fn cancel(&mut self) -> Vec<Effect> {
        let mut effects: Vec<Effect> = std::mem::take(&mut self.captures)
            .into_keys()
            .map(Effect::DiscardCapture)
            .collect();
        effects.extend(self.queue.cancel_all().into_iter().map(Effect::from));
        self.mode = Mode::Idle;
        effects
    }

    /// Derive the resting mode once no capture is active
    fn settle(&mut self) {
        self.mode = if self.queue.is_playing() {
            Mode::Playing
        } else {
            Mode::Idle
        };
    }

    fn playback_permitted(&self) -> bool {
        self.captures.is_empty()
    }

    /// Current mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Playback queue state
    #[must_use]
    pub const fn queue(&self) -> &PlaybackQueue {
        &self.queue
    }

    /// Whether `speaker` is being captured
    #[must_use]
    pub fn is_capturing(&self, speaker: SpeakerId) -> bool {
        self.captures.contains_key(&speaker)
    }

    /// Number of active capture segments
    #[must_use]
    pub fn active_captures(&self) -> usize {
        self.captures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(coordinator: &mut TurnCoordinator, path: &str) -> Vec<Effect> {
        coordinator
            .handle(Event::Control(ControlMessage::ArtifactAvailable(path.into())))
            .unwrap()
    }

    fn started_ticket(effects: &[Effect]) -> PlayTicket {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::Playback(PlaybackAction::Start { ticket, .. }) => Some(*ticket),
                _ => None,
            })
            .expect("no playback start")
    }

    fn begun_segment(effects: &[Effect]) -> SegmentId {
        effects
            .iter()
            .find_map(|e| match e {
                Effect::BeginCapture { segment, .. } => Some(*segment),
                _ => None,
            })
            .expect("no capture begin")
    }

    #[test]
    fn artifact_plays_when_idle() {
        let mut c = TurnCoordinator::new();
        let effects = artifact(&mut c, "a.wav");

        assert!(matches!(
            effects.as_slice(),
            [Effect::Playback(PlaybackAction::Start { .. })]
        ));
        assert_eq!(c.mode(), Mode::Playing);
    }

    #[test]
    fn speaker_start_announces_then_captures() {
        let mut c = TurnCoordinator::new();
        let effects = c.handle(Event::SpeakerStarted(1)).unwrap();

        assert_eq!(effects[0], Effect::Send(ControlMessage::SpeechStarted));
        assert!(matches!(effects[1], Effect::BeginCapture { speaker: 1, .. }));
        assert_eq!(c.mode(), Mode::Capturing);
    }

    #[test]
    fn duplicate_start_leaves_state_untouched() {
        let mut c = TurnCoordinator::new();
        c.handle(Event::SpeakerStarted(1)).unwrap();

        let err = c.handle(Event::SpeakerStarted(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyCapturing(1)));
        assert_eq!(c.active_captures(), 1);
        assert_eq!(c.mode(), Mode::Capturing);
    }

    #[test]
    fn barge_in_stops_before_capturing() {
        let mut c = TurnCoordinator::new();
        artifact(&mut c, "a.wav");

        let effects = c.handle(Event::SpeakerStarted(7)).unwrap();
        assert_eq!(effects[0], Effect::Playback(PlaybackAction::Stop));
        assert_eq!(effects[1], Effect::Send(ControlMessage::SpeechStarted));
        assert!(matches!(effects[2], Effect::BeginCapture { speaker: 7, .. }));
        assert_eq!(c.mode(), Mode::Suspended);
        assert!(!c.queue().is_playing());
    }

    #[test]
    fn capture_end_reports_path_and_resumes() {
        let mut c = TurnCoordinator::new();
        artifact(&mut c, "a.wav");
        let segment = begun_segment(&c.handle(Event::SpeakerStarted(7)).unwrap());

        let effects = c
            .handle(Event::CaptureEnded {
                speaker: 7,
                segment,
                artifact: Some("rec/1.wav".into()),
            })
            .unwrap();

        assert_eq!(
            effects[0],
            Effect::Send(ControlMessage::SpeechEnded("rec/1.wav".into()))
        );
        assert!(matches!(
            &effects[1],
            Effect::Playback(PlaybackAction::Start { path, .. }) if path.as_path() == std::path::Path::new("a.wav")
        ));
        assert_eq!(c.mode(), Mode::Playing);
    }

    #[test]
    fn failed_capture_sends_no_speech_end() {
        let mut c = TurnCoordinator::new();
        let segment = begun_segment(&c.handle(Event::SpeakerStarted(2)).unwrap());

        let effects = c
            .handle(Event::CaptureEnded {
                speaker: 2,
                segment,
                artifact: None,
            })
            .unwrap();

        assert!(effects.is_empty());
        assert_eq!(c.mode(), Mode::Idle);
        assert!(!c.is_capturing(2));
    }

    #[test]
    fn artifacts_wait_for_every_speaker() {
        let mut c = TurnCoordinator::new();
        let first = begun_segment(&c.handle(Event::SpeakerStarted(1)).unwrap());
        let second = begun_segment(&c.handle(Event::SpeakerStarted(2)).unwrap());
        assert_ne!(first, second);

        assert!(artifact(&mut c, "a.wav").is_empty());

        let effects = c
            .handle(Event::CaptureEnded {
                speaker: 1,
                segment: first,
                artifact: None,
            })
            .unwrap();
        assert!(effects.is_empty());
        assert_eq!(c.mode(), Mode::Capturing);

        let effects = c
            .handle(Event::CaptureEnded {
                speaker: 2,
                segment: second,
                artifact: None,
            })
            .unwrap();
        started_ticket(&effects);
        assert_eq!(c.mode(), Mode::Playing);
    }

    #[test]
    fn delete_discards_captures_and_cancels_queue() {
        let mut c = TurnCoordinator::new();
        artifact(&mut c, "a.wav");
        artifact(&mut c, "b.wav");
        c.handle(Event::SpeakerStarted(3)).unwrap();

        let effects = c.handle(Event::Control(ControlMessage::Delete)).unwrap();
        assert_eq!(
            effects,
            vec![
                Effect::DiscardCapture(3),
                Effect::Playback(PlaybackAction::Delete("a.wav".into())),
                Effect::Playback(PlaybackAction::Delete("b.wav".into())),
            ]
        );
        assert_eq!(c.mode(), Mode::Idle);
        assert!(c.queue().is_empty());
    }

    #[test]
    fn stale_capture_artifact_is_deleted() {
        let mut c = TurnCoordinator::new();
        let segment = begun_segment(&c.handle(Event::SpeakerStarted(3)).unwrap());
        c.handle(Event::Control(ControlMessage::Delete)).unwrap();

        let effects = c
            .handle(Event::CaptureEnded {
                speaker: 3,
                segment,
                artifact: Some("rec/9.wav".into()),
            })
            .unwrap();
        assert_eq!(
            effects,
            vec![Effect::Playback(PlaybackAction::Delete("rec/9.wav".into()))]
        );
    }

    #[test]
    fn restart_ignored_while_capturing() {
        let mut c = TurnCoordinator::new();
        c.handle(Event::SpeakerStarted(1)).unwrap();
        artifact(&mut c, "a.wav");

        let effects = c.handle(Event::Control(ControlMessage::Restart)).unwrap();
        assert!(effects.is_empty());
        assert_eq!(c.mode(), Mode::Capturing);
    }

    #[test]
    fn outbound_messages_from_peer_are_ignored() {
        let mut c = TurnCoordinator::new();
        artifact(&mut c, "a.wav");

        for message in [
            ControlMessage::SpeechStarted,
            ControlMessage::SpeechEnded("rec/1.wav".into()),
        ] {
            let effects = c.handle(Event::Control(message)).unwrap();
            assert!(effects.is_empty());
        }
        assert_eq!(c.mode(), Mode::Playing);
    }

    #[test]
    fn playback_failure_skips_to_next() {
        let mut c = TurnCoordinator::new();
        let first = started_ticket(&artifact(&mut c, "a.wav"));
        artifact(&mut c, "b.wav");

        let effects = c.handle(Event::PlaybackFailed(first)).unwrap();
        assert_eq!(effects[0], Effect::Playback(PlaybackAction::Delete("a.wav".into())));
        started_ticket(&effects);
        assert_eq!(c.mode(), Mode::Playing);

        let last = started_ticket(&effects);
        c.handle(Event::PlaybackFinished(last)).unwrap();
        assert_eq!(c.mode(), Mode::Idle);
    }

    #[test]
    fn never_plays_while_capturing() {
        // Deterministic pseudo-random event sequences
        let mut seed: u64 = 0x5eed;
        let mut next = move || {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            seed >> 33
        };

        for _ in 0..200 {
            let mut c = TurnCoordinator::new();
            let mut segments: Vec<(SpeakerId, SegmentId)> = Vec::new();
            let mut tickets: Vec<PlayTicket> = Vec::new();

            for step in 0..40 {
                let effects = match next() % 6 {
                    0 | 1 => {
                        let speaker = next() % 3;
                        c.handle(Event::SpeakerStarted(speaker)).unwrap_or_default()
                    }
                    2 if !segments.is_empty() => {
                        let (speaker, segment) = segments.remove(0);
                        c.handle(Event::CaptureEnded {
                            speaker,
                            segment,
                            artifact: None,
                        })
                        .unwrap()
                    }
                    3 if !tickets.is_empty() => {
                        c.handle(Event::PlaybackFinished(tickets.remove(0))).unwrap()
                    }
                    4 => c.handle(Event::Control(ControlMessage::Restart)).unwrap(),
                    _ => artifact(&mut c, &format!("{step}.wav")),
                };

                for effect in effects {
                    match effect {
                        Effect::BeginCapture { speaker, segment } => segments.push((speaker, segment)),
                        Effect::Playback(PlaybackAction::Start { ticket, .. }) => tickets.push(ticket),
                        _ => {}
                    }
                }

                assert!(
                    !(c.queue().is_playing() && c.active_captures() > 0),
                    "playback overlapped capture"
                );
                assert_eq!(
                    c.active_captures() > 0,
                    matches!(c.mode(), Mode::Capturing | Mode::Suspended)
                );
            }
        }
    }
}
