//! Shared test utilities

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley::voice::WavSpec;
use parley::{
    CaptureConfig, ControlMessage, ControlSink, PlayTicket, PlaybackDone, PlaybackSink, Result,
    Session, SessionHandle,
};
use tokio::sync::broadcast;

/// Call made on a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Start(PathBuf),
    Stop,
}

/// Playback sink that records calls and lets the test end playback
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    playing: Mutex<Option<PlaybackDone>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SinkCall::Start(path) => Some(path),
                SinkCall::Stop => None,
            })
            .collect()
    }

    /// Report the current item as played to the end
    pub fn finish_current(&self) -> Option<PlayTicket> {
        let done = self.playing.lock().unwrap().take()?;
        let ticket = done.ticket();
        done.finished();
        Some(ticket)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.lock().unwrap().is_some()
    }
}

#[async_trait]
impl PlaybackSink for RecordingSink {
    async fn start(&self, _ticket: PlayTicket, path: &Path, done: PlaybackDone) -> Result<()> {
        tokio::fs::metadata(path).await?;
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Start(path.to_path_buf()));
        *self.playing.lock().unwrap() = Some(done);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.calls.lock().unwrap().push(SinkCall::Stop);
        self.playing.lock().unwrap().take();
        Ok(())
    }
}

/// Control sink that records outbound messages
#[derive(Default)]
pub struct RecordingOutbox {
    sent: Mutex<Vec<ControlMessage>>,
}

impl RecordingOutbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Paths announced with `speech_end`
    pub fn speech_ends(&self) -> Vec<PathBuf> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::SpeechEnded(path) => Some(path),
                _ => None,
            })
            .collect()
    }
}

impl ControlSink for RecordingOutbox {
    fn send(&self, message: ControlMessage) {
        self.sent.lock().unwrap().push(message);
    }
}

/// A running session wired to recording collaborators
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub sink: Arc<RecordingSink>,
    pub outbox: Arc<RecordingOutbox>,
    pub inbound: broadcast::Sender<ControlMessage>,
    pub session: SessionHandle,
}

impl Harness {
    pub fn start(silence: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let outbox = RecordingOutbox::new();
        let (inbound, inbound_rx) = broadcast::channel(16);

        let capture = CaptureConfig {
            dir: dir.path().join("recorded"),
            spec: WavSpec::VOICE,
            silence,
        };
        std::fs::create_dir_all(&capture.dir).unwrap();

        let session = Session::spawn(capture, sink.clone(), outbox.clone(), inbound_rx);

        Self {
            dir,
            sink,
            outbox,
            inbound,
            session,
        }
    }

    /// Create an artifact file the peer could announce
    pub fn artifact(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"audio").unwrap();
        path
    }

    pub fn announce(&self, path: &Path) {
        self.inbound
            .send(ControlMessage::ArtifactAvailable(path.to_path_buf()))
            .unwrap();
    }

    pub fn control(&self, message: ControlMessage) {
        self.inbound.send(message).unwrap();
    }
}

/// Wait until `condition` holds, panicking after two seconds
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
