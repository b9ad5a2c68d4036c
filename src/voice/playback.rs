//! Ordered playback queue with at most one active item
//!
//! The queue never touches audio output or the filesystem itself. Every
//! operation returns the [`PlaybackAction`]s the owner must carry out, in
//! order, so the same queue drives a songbird call, local speakers, or a test
//! double.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Identifies one start of one item
///
/// Re-playing a paused item issues a fresh ticket, so completions reported for
/// an earlier start can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayTicket(u64);

impl std::fmt::Display for PlayTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An artifact waiting to be played
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackItem {
    /// Backing audio file
    pub path: PathBuf,
    /// When the item was queued
    pub queued_at: DateTime<Utc>,
}

impl PlaybackItem {
    /// Create an item queued now
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            queued_at: Utc::now(),
        }
    }
}

/// Side effect requested by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackAction {
    /// Begin playing `path` on the output
    Start {
        /// Ticket to report completion against
        ticket: PlayTicket,
        /// Artifact to play
        path: PathBuf,
    },
    /// Stop the output immediately
    Stop,
    /// Remove the artifact's backing file
    Delete(PathBuf),
}

#[derive(Debug)]
struct Current {
    ticket: PlayTicket,
    item: PlaybackItem,
}

/// FIFO of pending artifacts plus the one currently playing
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    pending: VecDeque<PlaybackItem>,
    current: Option<Current>,
    paused: bool,
    next_ticket: u64,
}

impl PlaybackQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an artifact, starting it right away when idle and permitted
    pub fn enqueue(&mut self, path: PathBuf, permitted: bool) -> Vec<PlaybackAction> {
        tracing::debug!(path = %path.display(), pending = self.pending.len(), "artifact queued");
        self.pending.push_back(PlaybackItem::new(path));
        self.advance(permitted)
    }

    /// Start the head of the queue if nothing is playing and playback is permitted
    ///
    /// An empty or forbidden queue simply stays idle.
    pub fn advance(&mut self, permitted: bool) -> Vec<PlaybackAction> {
        if self.current.is_some() || !permitted {
            return Vec::new();
        }

        let Some(item) = self.pending.pop_front() else {
            return Vec::new();
        };

        self.paused = false;
        self.next_ticket += 1;
        let ticket = PlayTicket(self.next_ticket);
        let path = item.path.clone();

        tracing::debug!(%ticket, path = %path.display(), "playback starting");
        self.current = Some(Current { ticket, item });

        vec![PlaybackAction::Start { ticket, path }]
    }

    /// Record that the item started under `ticket` has ended
    ///
    /// Deletes its file and moves on to the next item. Tickets that do not
    /// match the current item (stopped or superseded starts) are ignored.
    pub fn complete(&mut self, ticket: PlayTicket, permitted: bool) -> Vec<PlaybackAction> {
        let Some(current) = self.current.take_if(|c| c.ticket == ticket) else {
            tracing::trace!(%ticket, "ignoring stale playback completion");
            return Vec::new();
        };

        let mut actions = vec![PlaybackAction::Delete(current.item.path)];
        actions.extend(self.advance(permitted));
        actions
    }

    /// Stop the current item and put it back at the front of the queue
    pub fn pause(&mut self) -> Vec<PlaybackAction> {
        let Some(current) = self.current.take() else {
            return Vec::new();
        };

        tracing::debug!(ticket = %current.ticket, path = %current.item.path.display(), "playback paused");
        self.pending.push_front(current.item);
        self.paused = true;

        vec![PlaybackAction::Stop]
    }

    /// Continue after [`pause`](Self::pause)
    pub fn resume(&mut self, permitted: bool) -> Vec<PlaybackAction> {
        if !self.paused {
            return Vec::new();
        }
        self.advance(permitted)
    }

    /// Stop playback and delete every queued artifact, current one included
    pub fn cancel_all(&mut self) -> Vec<PlaybackAction> {
        let mut actions = Vec::with_capacity(self.pending.len() + 2);

        if let Some(current) = self.current.take() {
            actions.push(PlaybackAction::Stop);
            actions.push(PlaybackAction::Delete(current.item.path));
        }

        actions.extend(
            self.pending
                .drain(..)
                .map(|item| PlaybackAction::Delete(item.path)),
        );
        self.paused = false;

        actions
    }

    /// Whether an item is currently playing
    #[must_use]
    pub const fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Whether the head of the queue was interrupted by [`pause`](Self::pause)
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Number of items waiting (excluding the current one)
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting or playing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }

    /// Path of the item currently playing
    #[must_use]
    pub fn current_path(&self) -> Option<&std::path::Path> {
        self.current.as_ref().map(|c| c.item.path.as_path())
    }

    /// Paths waiting to play, head first
    pub fn pending_paths(&self) -> impl Iterator<Item = &std::path::Path> {
        self.pending.iter().map(|item| item.path.as_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(actions: &[PlaybackAction]) -> Vec<PathBuf> {
        actions
            .iter()
            .filter_map(|a| match a {
                PlaybackAction::Start { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    fn ticket_of(actions: &[PlaybackAction]) -> PlayTicket {
        actions
            .iter()
            .find_map(|a| match a {
                PlaybackAction::Start { ticket, .. } => Some(*ticket),
                _ => None,
            })
            .expect("no start action")
    }

    #[test]
    fn plays_in_fifo_order() {
        let mut queue = PlaybackQueue::new();
        let mut order = Vec::new();

        let first = queue.enqueue("a.wav".into(), true);
        order.extend(started(&first));
        assert!(queue.enqueue("b.wav".into(), true).is_empty());
        assert!(queue.enqueue("c.wav".into(), true).is_empty());

        let mut ticket = ticket_of(&first);
        for _ in 0..2 {
            let next = queue.complete(ticket, true);
            order.extend(started(&next));
            ticket = ticket_of(&next);
        }
        let last = queue.complete(ticket, true);

        assert_eq!(
            order,
            vec![PathBuf::from("a.wav"), "b.wav".into(), "c.wav".into()]
        );
        assert_eq!(last, vec![PlaybackAction::Delete("c.wav".into())]);
        assert!(queue.is_empty());
    }

    #[test]
    fn forbidden_enqueue_waits() {
        let mut queue = PlaybackQueue::new();
        assert!(queue.enqueue("a.wav".into(), false).is_empty());
        assert!(!queue.is_playing());
        assert_eq!(started(&queue.advance(true)), vec![PathBuf::from("a.wav")]);
    }

    #[test]
    fn pause_requeues_at_front() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue("a.wav".into(), true);
        queue.enqueue("b.wav".into(), true);

        assert_eq!(queue.pause(), vec![PlaybackAction::Stop]);
        assert!(queue.is_paused());
        assert_eq!(
            queue.pending_paths().collect::<Vec<_>>(),
            vec![std::path::Path::new("a.wav"), std::path::Path::new("b.wav")]
        );

        let resumed = queue.resume(true);
        assert_eq!(started(&resumed), vec![PathBuf::from("a.wav")]);
        assert!(!queue.is_paused());
    }

    #[test]
    fn pause_is_idempotent() {
        let mut queue = PlaybackQueue::new();
        assert!(queue.pause().is_empty());

        queue.enqueue("a.wav".into(), true);
        queue.pause();
        assert!(queue.pause().is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn stale_ticket_is_ignored_after_pause() {
        let mut queue = PlaybackQueue::new();
        let first = ticket_of(&queue.enqueue("a.wav".into(), true));
        queue.pause();
        let second = ticket_of(&queue.resume(true));

        assert_ne!(first, second);
        assert!(queue.complete(first, true).is_empty());
        assert_eq!(queue.current_path(), Some(std::path::Path::new("a.wav")));
    }

    #[test]
    fn cancel_all_deletes_everything_once() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue("a.wav".into(), true);
        queue.enqueue("b.wav".into(), true);
        queue.enqueue("c.mp3".into(), true);

        let actions = queue.cancel_all();
        assert_eq!(
            actions,
            vec![
                PlaybackAction::Stop,
                PlaybackAction::Delete("a.wav".into()),
                PlaybackAction::Delete("b.wav".into()),
                PlaybackAction::Delete("c.mp3".into()),
            ]
        );
        assert!(queue.is_empty());
        assert!(queue.cancel_all().is_empty());
    }

    #[test]
    fn cancel_all_while_paused_has_nothing_to_stop() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue("a.wav".into(), true);
        queue.pause();

        assert_eq!(queue.cancel_all(), vec![PlaybackAction::Delete("a.wav".into())]);
        assert!(!queue.is_paused());
    }
}
