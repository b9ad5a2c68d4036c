//! Audio output seam

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::PlayTicket;
use crate::coordinator::SessionInput;
use crate::{Error, Result};

/// Output device or voice call that artifacts are played through
///
/// Only one start is ever outstanding: the session stops the previous
/// item before starting the next.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Begin playing `path`; report the natural end through `done`
    ///
    /// # Errors
    ///
    /// Returns error if playback could not be started at all
    async fn start(&self, ticket: PlayTicket, path: &Path, done: PlaybackDone) -> Result<()>;

    /// Stop whatever is playing
    ///
    /// # Errors
    ///
    /// Returns error if the output rejected the stop
    async fn stop(&self) -> Result<()>;
}

/// One-shot completion reporter handed to a sink with each start
#[derive(Debug)]
pub struct PlaybackDone {
    ticket: PlayTicket,
    input: mpsc::UnboundedSender<SessionInput>,
}

impl PlaybackDone {
    pub(crate) const fn new(ticket: PlayTicket, input: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self { ticket, input }
    }

    /// Ticket this reporter belongs to
    #[must_use]
    pub const fn ticket(&self) -> PlayTicket {
        self.ticket
    }

    /// The item played through to its end
    pub fn finished(self) {
        self.finish(Ok(()));
    }

    /// The item could not be played to the end
    pub fn failed(self, error: Error) {
        self.finish(Err(error));
    }

    /// Report `result` for this ticket
    pub fn finish(self, result: Result<()>) {
        let ticket = self.ticket;
        if self
            .input
            .send(SessionInput::PlaybackEnded { ticket, result })
            .is_err()
        {
            tracing::debug!(%ticket, "session gone before playback ended");
        }
    }
}
