//! Playback through a songbird call

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{Call, Event, EventContext, EventHandler, TrackEvent};

use crate::voice::{PlayTicket, PlaybackDone, PlaybackSink};
use crate::{Error, Result};

type DoneSlot = Arc<Mutex<Option<PlaybackDone>>>;

/// Plays artifacts into the voice call as songbird tracks
pub struct SongbirdSink {
    call: Arc<tokio::sync::Mutex<Call>>,
    current: Mutex<Option<(TrackHandle, DoneSlot)>>,
}

impl SongbirdSink {
    /// Create a sink for `call`
    #[must_use]
    pub const fn new(call: Arc<tokio::sync::Mutex<Call>>) -> Self {
        Self {
            call,
            current: Mutex::new(None),
        }
    }

    fn take_current(&self) -> Option<(TrackHandle, DoneSlot)> {
        self.current.lock().ok().and_then(|mut current| current.take())
    }
}

#[async_trait]
impl PlaybackSink for SongbirdSink {
    async fn start(&self, ticket: PlayTicket, path: &Path, done: PlaybackDone) -> Result<()> {
        tokio::fs::metadata(path).await?;

        let input = songbird::input::File::new(path.to_path_buf());
        let track = {
            let mut call = self.call.lock().await;
            call.play_input(input.into())
        };

        let slot: DoneSlot = Arc::new(Mutex::new(Some(done)));
        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(Event::Track(event), TrackNotifier(Arc::clone(&slot)))
                .map_err(|e| Error::Discord(format!("track event error: {e}")))?;
        }

        tracing::debug!(%ticket, path = %path.display(), "track started");

        if let Ok(mut current) = self.current.lock()
            && let Some((previous, _)) = current.replace((track, slot))
        {
            let _ = previous.stop();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some((track, slot)) = self.take_current() else {
            return Ok(());
        };

        // Silence the completion before the stop triggers a track end
        if let Ok(mut done) = slot.lock() {
            *done = None;
        }
        track
            .stop()
            .map_err(|e| Error::Discord(format!("track stop error: {e}")))
    }
}

/// Reports a track's end or failure to the session once
struct TrackNotifier(DoneSlot);

#[async_trait]
impl EventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let done = self.0.lock().ok().and_then(|mut done| done.take())?;

        let failure = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{e:?}")),
                _ => None,
            }),
            _ => None,
        };

        match failure {
            Some(reason) => done.failed(Error::Decode(reason)),
            None => done.finished(),
        }
        None
    }
}
