//! Per-speaker audio streams from a songbird call

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use songbird::events::context_data::VoiceTick;
use songbird::{Event, EventContext, EventHandler};
use tokio::sync::mpsc;

use crate::coordinator::SessionInput;
use crate::voice::SpeakerId;
use crate::{Error, Result};

/// Voice ticks buffered per speaker stream (20 ms each)
const STREAM_BUFFER: usize = 500;

#[derive(Default)]
struct ReceiverState {
    /// SSRC to Discord user, learned from speaking-state updates
    users: HashMap<u32, u64>,
    /// Open stream per SSRC
    streams: HashMap<u32, mpsc::Sender<Result<Vec<i16>>>>,
}

/// Turns decoded voice ticks into session speaker streams
///
/// The first packet from a speaker without an open stream raises
/// `SpeakerStarted`. The stream stays open until the capture segment stops
/// reading it (silence) or the speaker disconnects.
#[derive(Clone)]
pub struct VoiceReceiver {
    session: mpsc::UnboundedSender<SessionInput>,
    state: Arc<Mutex<ReceiverState>>,
}

impl VoiceReceiver {
    /// Create a receiver feeding `session`
    #[must_use]
    pub fn new(session: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            session,
            state: Arc::new(Mutex::new(ReceiverState::default())),
        }
    }

    /// Remember which user an SSRC belongs to
    pub fn map_user(&self, ssrc: u32, user: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.users.insert(ssrc, user);
        }
    }

    /// Forward one decoded chunk (or a decode failure) from `ssrc`
    pub fn push(&self, ssrc: u32, chunk: Result<Vec<i16>>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let speaker: SpeakerId = state.users.get(&ssrc).copied().unwrap_or(u64::from(ssrc));

        let needs_stream = state.streams.get(&ssrc).is_none_or(mpsc::Sender::is_closed);
        if needs_stream {
            let (tx, audio) = mpsc::channel(STREAM_BUFFER);
            if self
                .session
                .send(SessionInput::SpeakerStarted { speaker, audio })
                .is_err()
            {
                return;
            }
            tracing::debug!(speaker, ssrc, "speaker stream opened");
            state.streams.insert(ssrc, tx);
        }

        if let Some(tx) = state.streams.get(&ssrc)
            && tx.try_send(chunk).is_err()
        {
            tracing::trace!(speaker, "speaker stream full, dropping voice tick");
        }
    }

    /// End the stream of a user who left the call
    pub fn disconnect(&self, user: u64) {
        if let Ok(mut state) = self.state.lock() {
            let ssrcs: Vec<u32> = state
                .users
                .iter()
                .filter(|(_, u)| **u == user)
                .map(|(ssrc, _)| *ssrc)
                .collect();
            for ssrc in ssrcs {
                state.users.remove(&ssrc);
                state.streams.remove(&ssrc);
            }
            tracing::debug!(user, "speaker disconnected");
        }
    }
}

#[async_trait]
impl EventHandler for VoiceReceiver {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        match ctx {
            EventContext::VoiceTick(VoiceTick { speaking, .. }) => {
                for (&ssrc, data) in speaking {
                    let chunk = data
                        .decoded_voice
                        .clone()
                        .ok_or_else(|| Error::Decode(format!("no decoded audio for ssrc {ssrc}")));
                    self.push(ssrc, chunk);
                }
            }
            EventContext::SpeakingStateUpdate(speaking) => {
                if let Some(user) = speaking.user_id {
                    tracing::trace!(ssrc = speaking.ssrc, user = user.0, "speaking state update");
                    self.map_user(speaking.ssrc, user.0);
                }
            }
            EventContext::ClientDisconnect(disconnect) => self.disconnect(disconnect.user_id.0),
            _ => {}
        }

        None
    }
}
