//! Per-speaker capture segmentation
//!
//! Each active speaker gets one task that accumulates decoded samples until
//! the stream ends, goes quiet for the silence threshold, or is flushed by the
//! session. The finished segment is framed as WAV, written under a unique
//! name, and reported back to the session as [`SessionInput::CaptureFinished`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use super::wav::{self, WavSpec};
use super::{AudioStream, SpeakerId};
use crate::coordinator::SessionInput;
use crate::{Error, Result};

/// File extensions treated as artifacts when cleaning the recordings directory
const ARTIFACT_EXTENSIONS: &[&str] = &["wav", "dat"];

/// Identifies one capture segment within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u64);

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capture settings shared by every segment in a session
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Directory finished artifacts are written to
    pub dir: PathBuf,
    /// PCM layout of the incoming stream
    pub spec: WavSpec,
    /// Continuous silence that ends a segment
    pub silence: Duration,
}

/// One speaker utterance being accumulated
#[derive(Debug)]
pub struct CaptureSegment {
    /// Speaker being captured
    pub speaker: SpeakerId,
    /// Segment identity assigned by the coordinator
    pub segment: SegmentId,
    /// When capture began
    pub started_at: DateTime<Utc>,
    /// Continuous silence that ends the segment
    pub silence: Duration,
    samples: Vec<i16>,
}

impl CaptureSegment {
    /// Start an empty segment
    #[must_use]
    pub fn new(speaker: SpeakerId, segment: SegmentId, silence: Duration) -> Self {
        Self {
            speaker,
            segment,
            started_at: Utc::now(),
            silence,
            samples: Vec::new(),
        }
    }

    /// Append decoded samples
    pub fn push(&mut self, chunk: &[i16]) {
        self.samples.extend_from_slice(chunk);
    }

    /// Number of accumulated samples
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Frame the accumulated samples as a WAV file
    #[must_use]
    pub fn to_wav(&self, spec: WavSpec) -> Vec<u8> {
        wav::frame(&wav::samples_to_bytes(&self.samples), spec)
    }
}

/// Issues collision-free artifact paths from the wall clock
///
/// Names are `<unix-millis>.wav` and strictly increase within the process,
/// even when two segments end in the same millisecond.
#[derive(Debug)]
pub struct ArtifactNamer {
    dir: PathBuf,
    last: AtomicI64,
}

impl ArtifactNamer {
    /// Create a namer writing into `dir`
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            last: AtomicI64::new(0),
        }
    }

    /// Next unused artifact path
    pub fn next_path(&self) -> PathBuf {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let id = now.max(previous + 1);

        self.dir.join(format!("{id}.wav"))
    }
}

/// Why a segment stopped accumulating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Silence,
    EndOfStream,
    Flushed,
}

struct ActiveCapture {
    segment: SegmentId,
    flush: Option<oneshot::Sender<()>>,
    flags: Arc<SegmentFlags>,
}

/// State shared between a segment task and its owner
#[derive(Debug, Default)]
struct SegmentFlags {
    /// Set by the task once it stops reading audio
    collected: AtomicBool,
    discarded: AtomicBool,
}

impl ActiveCapture {
    /// Stop the task and make it drop whatever it captured, written or not
    fn discard(&mut self) {
        self.flags.discarded.store(true, Ordering::SeqCst);
        if let Some(flush) = self.flush.take() {
            let _ = flush.send(());
        }
    }
}

/// Owns the per-speaker capture tasks of one session
pub struct CaptureSegmenter {
    config: CaptureConfig,
    namer: Arc<ArtifactNamer>,
    events: mpsc::UnboundedSender<SessionInput>,
    active: HashMap<SpeakerId, ActiveCapture>,
}

impl CaptureSegmenter {
    /// Create a segmenter reporting finished segments on `events`
    #[must_use]
    pub fn new(config: CaptureConfig, events: mpsc::UnboundedSender<SessionInput>) -> Self {
        let namer = Arc::new(ArtifactNamer::new(config.dir.clone()));
        Self {
            config,
            namer,
            events,
            active: HashMap::new(),
        }
    }

    /// Start accumulating `audio` for `speaker`
    ///
    /// # Errors
    ///
    /// Returns `AlreadyCapturing` if the speaker already has a segment; the
    /// existing segment is left untouched
    pub fn begin(&mut self, speaker: SpeakerId, segment: SegmentId, audio: AudioStream) -> Result<()> {
        if self.active.contains_key(&speaker) {
            return Err(Error::AlreadyCapturing(speaker));
        }

        let (flush_tx, flush_rx) = oneshot::channel();
        let flags = Arc::new(SegmentFlags::default());
        let state = CaptureSegment::new(speaker, segment, self.config.silence);
        tokio::spawn(run_segment(
            state,
            audio,
            flush_rx,
            Arc::clone(&flags),
            self.config.spec,
            Arc::clone(&self.namer),
            self.events.clone(),
        ));

        tracing::debug!(speaker, %segment, "capture started");
        self.active.insert(
            speaker,
            ActiveCapture {
                segment,
                flush: Some(flush_tx),
                flags,
            },
        );

        Ok(())
    }

    /// End `speaker`'s segment now, writing what was captured so far
    pub fn finish(&mut self, speaker: SpeakerId) {
        if let Some(flush) = self.active.get_mut(&speaker).and_then(|a| a.flush.take()) {
            let _ = flush.send(());
        }
    }

    /// End every segment now, writing what was captured so far
    pub fn finish_all(&mut self) {
        for active in self.active.values_mut() {
            if let Some(flush) = active.flush.take() {
                let _ = flush.send(());
            }
        }
    }

    /// Drop `speaker`'s segment without keeping an artifact
    ///
    /// The segment never reports back. If its file is already being written,
    /// the task deletes it once the write completes.
    pub fn discard(&mut self, speaker: SpeakerId) {
        if let Some(mut active) = self.active.remove(&speaker) {
            active.discard();
            tracing::debug!(speaker, segment = %active.segment, "capture discarded");
        }
    }

    /// Whether `speaker`'s segment stopped taking audio but has not reported back yet
    #[must_use]
    pub fn is_finishing(&self, speaker: SpeakerId) -> bool {
        self.active
            .get(&speaker)
            .is_some_and(|a| a.flush.is_none() || a.flags.collected.load(Ordering::SeqCst))
    }

    /// Forget a segment whose task has reported back
    pub fn release(&mut self, speaker: SpeakerId, segment: SegmentId) {
        if self
            .active
            .get(&speaker)
            .is_some_and(|a| a.segment == segment)
        {
            self.active.remove(&speaker);
        }
    }

    /// Number of segments still accumulating
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl Drop for CaptureSegmenter {
    fn drop(&mut self) {
        for (_, mut active) in self.active.drain() {
            active.discard();
        }
    }
}

async fn run_segment(
    mut state: CaptureSegment,
    mut audio: AudioStream,
    mut flush: oneshot::Receiver<()>,
    flags: Arc<SegmentFlags>,
    spec: WavSpec,
    namer: Arc<ArtifactNamer>,
    events: mpsc::UnboundedSender<SessionInput>,
) {
    let speaker = state.speaker;
    let segment = state.segment;

    let collect_result = collect(&mut state, &mut audio, &mut flush).await;
    flags.collected.store(true, Ordering::SeqCst);
    drop(audio);

    let result = match collect_result {
        Ok(_) if flags.discarded.load(Ordering::SeqCst) => {
            tracing::debug!(speaker, %segment, "discarded capture dropped");
            return;
        }
        Ok(reason) => {
            tracing::debug!(
                speaker,
                %segment,
                ?reason,
                samples = state.sample_count(),
                "capture ended"
            );
            write_artifact(&state, spec, &namer).await
        }
        Err(e) => Err(e),
    };

    // Discarded while the file was being written
    if flags.discarded.load(Ordering::SeqCst) {
        if let Ok(path) = &result
            && let Err(e) = tokio::fs::remove_file(path).await
        {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove discarded capture");
        }
        tracing::debug!(speaker, %segment, "discarded capture dropped");
        return;
    }

    let _ = events.send(SessionInput::CaptureFinished {
        speaker,
        segment,
        result,
    });
}

async fn collect(
    state: &mut CaptureSegment,
    audio: &mut AudioStream,
    flush: &mut oneshot::Receiver<()>,
) -> Result<EndReason> {
    loop {
        tokio::select! {
            _ = &mut *flush => {
                // Keep what already arrived
                while let Ok(chunk) = audio.try_recv() {
                    state.push(&chunk?);
                }
                return Ok(EndReason::Flushed);
            }
            chunk = tokio::time::timeout(state.silence, audio.recv()) => match chunk {
                Err(_) => return Ok(EndReason::Silence),
                Ok(None) => return Ok(EndReason::EndOfStream),
                Ok(Some(Ok(pcm))) => state.push(&pcm),
                Ok(Some(Err(e))) => return Err(e),
            },
        }
    }
}

async fn write_artifact(state: &CaptureSegment, spec: WavSpec, namer: &ArtifactNamer) -> Result<PathBuf> {
    let path = namer.next_path();
    tokio::fs::write(&path, state.to_wav(spec)).await?;

    tracing::info!(
        speaker = state.speaker,
        samples = state.sample_count(),
        path = %path.display(),
        "capture saved"
    );
    Ok(path)
}

/// Create the recordings directory and remove artifacts left by an earlier run
///
/// Returns the number of stale files removed.
///
/// # Errors
///
/// Returns error if the directory cannot be created or listed
pub fn prepare_recordings_dir(dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(dir)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_artifact = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ARTIFACT_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)));

        if !is_artifact || !path.is_file() {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove stale artifact"),
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "removed stale recordings");
    }
    Ok(removed)
}
