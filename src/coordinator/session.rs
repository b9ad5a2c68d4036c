//! Session actor
//!
//! Every voice session runs one task that owns its [`TurnCoordinator`],
//! [`CaptureSegmenter`] and playback sink. All inputs for the session arrive
//! on one channel and are applied one at a time, so no two transitions ever
//! interleave and effects run in the order the coordinator produced them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::{Effect, Event, Mode, TurnCoordinator};
use crate::Result;
use crate::control::{ControlMessage, ControlSink};
use crate::voice::{
    AudioStream, CaptureConfig, CaptureSegmenter, PlayTicket, PlaybackAction, PlaybackDone,
    PlaybackSink, SegmentId, SpeakerId,
};

/// Input delivered to a session
#[derive(Debug)]
pub enum SessionInput {
    /// A speaker began talking; `audio` carries their decoded PCM
    SpeakerStarted {
        /// Speaker identity
        speaker: SpeakerId,
        /// Decoded audio for this utterance
        audio: AudioStream,
    },
    /// The transport saw the speaker stop; flush their segment now
    SpeakerEnded(SpeakerId),
    /// Inbound control message
    Control(ControlMessage),
    /// A capture task finished
    CaptureFinished {
        /// Speaker the segment belonged to
        speaker: SpeakerId,
        /// Segment that finished
        segment: SegmentId,
        /// Written artifact, or why none was written
        result: Result<PathBuf>,
    },
    /// The sink reported the end of a playback
    PlaybackEnded {
        /// Ticket the playback was started under
        ticket: PlayTicket,
        /// Whether it played to its end
        result: Result<()>,
    },
    /// Flush captures, cancel playback, and stop
    Leave,
}

/// Handle to a running session
pub struct SessionHandle {
    input: mpsc::UnboundedSender<SessionInput>,
    mode: watch::Receiver<Mode>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Sender for transport inputs
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<SessionInput> {
        self.input.clone()
    }

    /// Deliver one input; returns `false` once the session has stopped
    pub fn send(&self, input: SessionInput) -> bool {
        self.input.send(input).is_ok()
    }

    /// Mode after the most recent transition
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    /// Watch mode changes
    #[must_use]
    pub fn watch_mode(&self) -> watch::Receiver<Mode> {
        self.mode.clone()
    }

    /// Whether the session task has stopped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// End the session and wait for in-progress captures to be written
    pub async fn leave(mut self) {
        let _ = self.input.send(SessionInput::Leave);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "session task failed");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.input.send(SessionInput::Leave);
        }
    }
}

/// One voice session
pub struct Session {
    coordinator: TurnCoordinator,
    segmenter: CaptureSegmenter,
    sink: Arc<dyn PlaybackSink>,
    control: Arc<dyn ControlSink>,
    input_tx: mpsc::UnboundedSender<SessionInput>,
    input: mpsc::UnboundedReceiver<SessionInput>,
    mode: watch::Sender<Mode>,
    pending_audio: HashMap<SpeakerId, AudioStream>,
    /// Utterances waiting for the speaker's previous segment to report back
    deferred: HashMap<SpeakerId, AudioStream>,
    leaving: bool,
}

impl Session {
    /// Start a session task
    ///
    /// Inbound control messages are taken from `inbound`; outbound ones go to
    /// `control`. Artifacts play through `sink`.
    pub fn spawn(
        capture: CaptureConfig,
        sink: Arc<dyn PlaybackSink>,
        control: Arc<dyn ControlSink>,
        inbound: broadcast::Receiver<ControlMessage>,
    ) -> SessionHandle {
        let (input_tx, input) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(Mode::Idle);

        let forwarder = tokio::spawn(forward_control(inbound, input_tx.clone()));
        let session = Self {
            coordinator: TurnCoordinator::new(),
            segmenter: CaptureSegmenter::new(capture, input_tx.clone()),
            sink,
            control,
            input_tx: input_tx.clone(),
            input,
            mode: mode_tx,
            pending_audio: HashMap::new(),
            deferred: HashMap::new(),
            leaving: false,
        };

        let task = tokio::spawn(async move {
            session.run().await;
            forwarder.abort();
        });

        SessionHandle {
            input: input_tx,
            mode: mode_rx,
            task: Some(task),
        }
    }

    async fn run(mut self) {
        tracing::info!("session started");

        while let Some(input) = self.input.recv().await {
            match input {
                SessionInput::SpeakerStarted { speaker, audio } => {
                    if self.leaving {
                        continue;
                    }
                    if self.segmenter.is_finishing(speaker) {
                        tracing::debug!(speaker, "previous segment still writing, holding new utterance");
                        self.deferred.insert(speaker, audio);
                        continue;
                    }
                    self.start_capture(speaker, audio).await;
                }
                SessionInput::SpeakerEnded(speaker) => self.segmenter.finish(speaker),
                SessionInput::Control(message) => {
                    if self.leaving {
                        tracing::debug!(%message, "session leaving, ignoring control message");
                        continue;
                    }
                    self.apply(Event::Control(message)).await;
                }
                SessionInput::CaptureFinished {
                    speaker,
                    segment,
                    result,
                } => {
                    self.segmenter.release(speaker, segment);
                    let artifact = match result {
                        Ok(path) => Some(path),
                        Err(e) => {
                            tracing::warn!(speaker, %segment, kind = ?e.kind(), error = %e, "capture abandoned");
                            None
                        }
                    };
                    self.apply(Event::CaptureEnded {
                        speaker,
                        segment,
                        artifact,
                    })
                    .await;

                    if let Some(audio) = self.deferred.remove(&speaker)
                        && !self.leaving
                    {
                        self.start_capture(speaker, audio).await;
                    }
                }
                SessionInput::PlaybackEnded { ticket, result } => {
                    let event = match result {
                        Ok(()) => Event::PlaybackFinished(ticket),
                        Err(e) => {
                            tracing::warn!(%ticket, kind = ?e.kind(), error = %e, "playback error");
                            Event::PlaybackFailed(ticket)
                        }
                    };
                    self.apply(event).await;
                }
                SessionInput::Leave => {
                    if !self.leaving {
                        tracing::info!(
                            captures = self.segmenter.active_count(),
                            "session leaving"
                        );
                        self.leaving = true;
                        self.deferred.clear();
                        self.segmenter.finish_all();
                    }
                }
            }

            if self.leaving && self.segmenter.active_count() == 0 {
                break;
            }
        }

        self.apply(Event::Shutdown).await;
        tracing::info!("session ended");
    }

    async fn start_capture(&mut self, speaker: SpeakerId, audio: AudioStream) {
        self.pending_audio.insert(speaker, audio);
        self.apply(Event::SpeakerStarted(speaker)).await;
        self.pending_audio.remove(&speaker);
    }

    /// Apply an event and every follow-up it produces
    async fn apply(&mut self, event: Event) {
        let mut events = VecDeque::from([event]);

        while let Some(event) = events.pop_front() {
            let effects = match self.coordinator.handle(event) {
                Ok(effects) => effects,
                Err(e) => {
                    tracing::warn!(kind = ?e.kind(), error = %e, "transition rejected");
                    continue;
                }
            };

            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    events.push_back(follow_up);
                }
            }
        }

        let mode = self.coordinator.mode();
        self.mode.send_if_modified(|current| {
            let changed = *current != mode;
            *current = mode;
            changed
        });
        tracing::trace!(?mode, queued = self.coordinator.queue().len(), "transition applied");
    }

    async fn execute(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::Send(message) => {
                self.control.send(message);
                None
            }
            Effect::BeginCapture { speaker, segment } => {
                let ended = Event::CaptureEnded {
                    speaker,
                    segment,
                    artifact: None,
                };
                let Some(audio) = self.pending_audio.remove(&speaker) else {
                    tracing::warn!(speaker, %segment, "no audio stream for capture");
                    return Some(ended);
                };
                if let Err(e) = self.segmenter.begin(speaker, segment, audio) {
                    tracing::warn!(speaker, kind = ?e.kind(), error = %e, "capture not started");
                    return Some(ended);
                }
                None
            }
            Effect::DiscardCapture(speaker) => {
                self.segmenter.discard(speaker);
                self.deferred.remove(&speaker);
                None
            }
            Effect::Playback(PlaybackAction::Start { ticket, path }) => {
                if self.leaving {
                    tracing::debug!(%ticket, "session leaving, not starting playback");
                    return None;
                }
                let done = PlaybackDone::new(ticket, self.input_tx.clone());
                match self.sink.start(ticket, &path, done).await {
                    Ok(()) => {
                        tracing::info!(%ticket, path = %path.display(), "playing artifact");
                        None
                    }
                    Err(e) => {
                        tracing::warn!(%ticket, path = %path.display(), kind = ?e.kind(), error = %e, "playback failed to start");
                        Some(Event::PlaybackFailed(ticket))
                    }
                }
            }
            Effect::Playback(PlaybackAction::Stop) => {
                if let Err(e) = self.sink.stop().await {
                    tracing::warn!(kind = ?e.kind(), error = %e, "playback stop failed");
                }
                None
            }
            Effect::Playback(PlaybackAction::Delete(path)) => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => tracing::debug!(path = %path.display(), "artifact deleted"),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to delete artifact");
                    }
                }
                None
            }
        }
    }
}

async fn forward_control(
    mut inbound: broadcast::Receiver<ControlMessage>,
    session: mpsc::UnboundedSender<SessionInput>,
) {
    loop {
        match inbound.recv().await {
            Ok(message) => {
                if session.send(SessionInput::Control(message)).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session lagged behind control channel");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
