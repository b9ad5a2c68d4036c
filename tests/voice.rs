//! Voice pipeline integration tests
//!
//! Tests capture framing, artifact writing and speech detection without
//! any audio devices.

mod common;

use std::time::Duration;

use parley::voice::activity::{GateEvent, SpeechGate};
use parley::voice::{prepare_recordings_dir, wav};
use parley::{CaptureConfig, CaptureSegmenter, SegmentId, SessionInput, WavSpec};
use tokio::sync::mpsc;

fn generate_sine_samples(frequency: f32, sample_rate: u32, samples: usize) -> Vec<f32> {
    #[allow(clippy::cast_precision_loss)]
    (0..samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.5
        })
        .collect()
}

fn generate_silence(samples: usize) -> Vec<f32> {
    vec![0.0; samples]
}

fn capture_config(dir: &std::path::Path, silence: Duration) -> CaptureConfig {
    CaptureConfig {
        dir: dir.to_path_buf(),
        spec: WavSpec::VOICE,
        silence,
    }
}

async fn next_capture(
    events: &mut mpsc::UnboundedReceiver<SessionInput>,
) -> (SegmentId, parley::Result<std::path::PathBuf>) {
    let input = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("capture did not finish")
        .expect("segmenter dropped");

    match input {
        SessionInput::CaptureFinished {
            segment, result, ..
        } => (segment, result),
        other => panic!("unexpected input: {other:?}"),
    }
}

// =============================================================================
// WAV framing
// =============================================================================

#[test]
fn test_framed_pcm_is_readable_wav() {
    let samples: Vec<i16> = (0..960).map(|i| (i % 200 - 100) * 50).collect();
    let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

    let bytes = wav::frame(&pcm, WavSpec::VOICE);
    assert_eq!(bytes.len(), wav::HEADER_LEN + pcm.len());

    let reader = hound::WavReader::new(std::io::Cursor::new(bytes)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 48_000);
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.bits_per_sample, 16);

    let decoded: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(decoded, samples);
}

#[test]
fn test_empty_pcm_frames_header_only() {
    let bytes = wav::frame(&[], WavSpec::MICROPHONE);
    assert_eq!(bytes.len(), wav::HEADER_LEN);

    let reader = hound::WavReader::new(std::io::Cursor::new(bytes)).unwrap();
    assert_eq!(reader.spec().sample_rate, 16_000);
    assert_eq!(reader.len(), 0);
}

// =============================================================================
// Capture segmenter
// =============================================================================

#[tokio::test]
async fn test_segment_written_when_stream_closes() {
    let dir = tempfile::tempdir().unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut segmenter = CaptureSegmenter::new(
        capture_config(dir.path(), Duration::from_secs(5)),
        events_tx,
    );

    let (audio_tx, audio) = mpsc::channel(8);
    tokio_test::assert_ok!(segmenter.begin(7, SegmentId(1), audio));

    audio_tx.send(Ok(vec![1, -1, 2, -2])).await.unwrap();
    audio_tx.send(Ok(vec![3, -3])).await.unwrap();
    drop(audio_tx);

    let (segment, result) = next_capture(&mut events).await;
    assert_eq!(segment, SegmentId(1));

    let path = result.unwrap();
    assert!(path.starts_with(dir.path()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("wav"));

    let reader = hound::WavReader::open(&path).unwrap();
    let decoded: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(decoded, vec![1, -1, 2, -2, 3, -3]);
}

#[tokio::test]
async fn test_segment_ends_after_silence() {
    let dir = tempfile::tempdir().unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut segmenter = CaptureSegmenter::new(
        capture_config(dir.path(), Duration::from_millis(50)),
        events_tx,
    );

    // Sender stays open, so only the silence timeout can end the segment
    let (audio_tx, audio) = mpsc::channel(8);
    segmenter.begin(1, SegmentId(4), audio).unwrap();
    audio_tx.send(Ok(vec![10; 4])).await.unwrap();

    let (segment, result) = next_capture(&mut events).await;
    assert_eq!(segment, SegmentId(4));
    assert!(result.unwrap().exists());
    drop(audio_tx);
}

#[tokio::test]
async fn test_concurrent_speakers_get_distinct_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut segmenter = CaptureSegmenter::new(
        capture_config(dir.path(), Duration::from_secs(5)),
        events_tx,
    );

    let (a_tx, a) = mpsc::channel(8);
    let (b_tx, b) = mpsc::channel(8);
    segmenter.begin(1, SegmentId(1), a).unwrap();
    segmenter.begin(2, SegmentId(2), b).unwrap();
    assert_eq!(segmenter.active_count(), 2);

    drop(a_tx);
    drop(b_tx);

    let (_, first) = next_capture(&mut events).await;
    let (_, second) = next_capture(&mut events).await;
    assert_ne!(first.unwrap(), second.unwrap());
}

#[tokio::test]
async fn test_second_begin_for_speaker_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (events_tx, _events) = mpsc::unbounded_channel();
    let mut segmenter = CaptureSegmenter::new(
        capture_config(dir.path(), Duration::from_secs(5)),
        events_tx,
    );

    let (_a_tx, a) = mpsc::channel(8);
    let (_b_tx, b) = mpsc::channel(8);
    tokio_test::assert_ok!(segmenter.begin(3, SegmentId(1), a));

    let err = tokio_test::assert_err!(segmenter.begin(3, SegmentId(2), b));
    assert!(matches!(err, parley::Error::AlreadyCapturing(3)));
    assert_eq!(segmenter.active_count(), 1);
}

#[tokio::test]
async fn test_discarded_segment_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut segmenter = CaptureSegmenter::new(
        capture_config(dir.path(), Duration::from_millis(20)),
        events_tx,
    );

    let (audio_tx, audio) = mpsc::channel(8);
    segmenter.begin(9, SegmentId(1), audio).unwrap();
    audio_tx.send(Ok(vec![5; 16])).await.unwrap();
    segmenter.discard(9);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_prepare_recordings_dir_clears_stale_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = dir.path().join("recorded");
    std::fs::create_dir_all(&recorded).unwrap();
    std::fs::write(recorded.join("1.wav"), b"x").unwrap();
    std::fs::write(recorded.join("2.DAT"), b"x").unwrap();
    std::fs::write(recorded.join("notes.txt"), b"keep").unwrap();

    let removed = tokio_test::assert_ok!(prepare_recordings_dir(&recorded));
    assert_eq!(removed, 2);
    assert!(recorded.join("notes.txt").exists());

    let fresh = dir.path().join("fresh");
    assert_eq!(prepare_recordings_dir(&fresh).unwrap(), 0);
    assert!(fresh.is_dir());
}

// =============================================================================
// Speech gate
// =============================================================================

#[test]
fn test_gate_ignores_silence() {
    let mut gate = SpeechGate::new(0.03, Duration::from_millis(300), 16_000);
    for _ in 0..10 {
        assert_eq!(gate.process(&generate_silence(1600)), GateEvent::Idle);
    }
    assert!(!gate.is_speaking());
}

#[test]
fn test_gate_detects_utterance_and_trailing_silence() {
    let mut gate = SpeechGate::new(0.03, Duration::from_millis(300), 16_000);
    let speech = generate_sine_samples(440.0, 16_000, 1600);
    let silence = generate_silence(1600);

    assert_eq!(gate.process(&speech), GateEvent::Started);
    assert_eq!(gate.process(&speech), GateEvent::Continue);

    // 100ms chunks: the utterance ends once quiet exceeds 300ms
    for _ in 0..3 {
        assert_eq!(gate.process(&silence), GateEvent::Continue);
    }
    assert_eq!(gate.process(&silence), GateEvent::Ended);
    assert!(!gate.is_speaking());

    assert_eq!(gate.process(&speech), GateEvent::Started);
}
