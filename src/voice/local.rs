//! Local microphone and speakers
//!
//! Runs a session against the default audio devices instead of a voice
//! channel. The microphone is gated by [`SpeechGate`] and treated as a single
//! speaker; artifacts are decoded (WAV or MP3) and played on the default
//! output device.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::activity::{GateEvent, SpeechGate};
use super::wav::{self, WavSpec};
use super::{PlayTicket, PlaybackDone, PlaybackSink, SpeakerId};
use crate::coordinator::SessionInput;
use crate::{Error, Result};

/// Speaker id used for the local microphone
pub const LOCAL_SPEAKER: SpeakerId = 0;

/// Chunks buffered between the gate and the capture segment
const STREAM_BUFFER: usize = 256;

/// How often blocking loops check their stop flag
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default microphone, captured on a dedicated thread
///
/// cpal streams are not `Send`, so the stream lives on its own thread and
/// hands f32 chunks out over a channel until the handle is dropped.
pub struct Microphone {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Microphone {
    /// Open the default input device at 16 kHz mono
    ///
    /// # Errors
    ///
    /// Returns error if no suitable input device can be opened
    pub async fn open() -> Result<(Self, mpsc::UnboundedReceiver<Vec<f32>>)> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("parley-mic".to_string())
            .spawn(move || run_microphone(chunk_tx, ready_tx, &thread_stop))?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("microphone thread exited during setup".to_string()))??;

        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            chunk_rx,
        ))
    }

    /// Sample rate of delivered chunks
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        WavSpec::MICROPHONE.sample_rate
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        tracing::debug!("microphone closed");
    }
}

fn run_microphone(
    chunks: mpsc::UnboundedSender<Vec<f32>>,
    ready: oneshot::Sender<Result<()>>,
    stop: &AtomicBool,
) {
    let stream = match open_input_stream(chunks) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
    }
    drop(stream);
}

fn open_input_stream(chunks: mpsc::UnboundedSender<Vec<f32>>) -> Result<cpal::Stream> {
    let rate = WavSpec::MICROPHONE.sample_rate;
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(rate)
                && c.max_sample_rate() >= SampleRate(rate)
        })
        .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

    let config = supported_config.with_sample_rate(SampleRate(rate)).config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = rate,
        channels = config.channels,
        "microphone initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = chunks.send(data.to_vec());
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Gate microphone chunks into session speaker events
///
/// Runs until the microphone channel or the session closes.
pub async fn listen(
    mut chunks: mpsc::UnboundedReceiver<Vec<f32>>,
    mut gate: SpeechGate,
    input: mpsc::UnboundedSender<SessionInput>,
) {
    let mut stream: Option<mpsc::Sender<Result<Vec<i16>>>> = None;

    while let Some(chunk) = chunks.recv().await {
        let forwarded = match gate.process(&chunk) {
            GateEvent::Idle => continue,
            GateEvent::Started => open_stream(&mut stream, &input),
            // The segment ended on its own while the speaker kept talking
            GateEvent::Continue if stream.as_ref().is_some_and(mpsc::Sender::is_closed) => {
                tracing::debug!("capture segment closed mid-utterance, opening another");
                open_stream(&mut stream, &input)
            }
            GateEvent::Continue => Ok(()),
            GateEvent::Ended => {
                stream = None;
                input.send(SessionInput::SpeakerEnded(LOCAL_SPEAKER))
            }
        };

        if forwarded.is_err() {
            tracing::debug!("session closed, microphone listener stopping");
            return;
        }

        if let Some(tx) = &stream
            && tx.try_send(Ok(wav::f32_to_i16(&chunk))).is_err()
        {
            tracing::trace!("capture segment not reading, dropping microphone chunk");
        }
    }
}

fn open_stream(
    stream: &mut Option<mpsc::Sender<Result<Vec<i16>>>>,
    input: &mpsc::UnboundedSender<SessionInput>,
) -> std::result::Result<(), mpsc::error::SendError<SessionInput>> {
    let (tx, audio) = mpsc::channel(STREAM_BUFFER);
    *stream = Some(tx);
    input.send(SessionInput::SpeakerStarted {
        speaker: LOCAL_SPEAKER,
        audio,
    })
}

/// Decoded artifact ready for output
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Samples per second
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Playback length
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.samples.len() as u64 * 1000 / u64::from(self.sample_rate))
    }
}

/// Decode an artifact by extension
///
/// # Errors
///
/// Returns `Decode` if the extension is unknown or the bytes are malformed
pub fn decode_artifact(path: &Path, bytes: &[u8]) -> Result<DecodedAudio> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("wav") => decode_wav(bytes),
        Some("mp3") => decode_mp3(bytes),
        _ => Err(Error::Decode(format!(
            "unsupported artifact: {}",
            path.display()
        ))),
    }
}

#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Decode(e.to_string()))?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Decode(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Decode(e.to_string()))?
        }
    };

    Ok(DecodedAudio {
        samples: downmix(&interleaved, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
    })
}

fn decode_mp3(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or_default();
                let pcm: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&pcm, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Decode(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Decode("no MP3 frames found".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Average interleaved channels down to mono
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }

    #[allow(clippy::cast_precision_loss)]
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    mono
}

/// Play decoded audio on the default output device, blocking until done
///
/// Returns early without error once `stop` is set.
///
/// # Errors
///
/// Returns error if the output device cannot be opened
pub fn play_blocking(audio: &DecodedAudio, stop: &AtomicBool) -> Result<()> {
    if audio.samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let rate = SampleRate(audio.sample_rate);
    let config: StreamConfig = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.channels() <= 2)
        .find(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?
        .with_sample_rate(rate)
        .config();

    let channels = usize::from(config.channels);
    let samples = Arc::new(audio.samples.clone());
    let position = Arc::new(AtomicUsize::new(0));

    let stream_samples = Arc::clone(&samples);
    let stream_position = Arc::clone(&position);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pos = stream_position.load(Ordering::Relaxed);
                for frame in data.chunks_mut(channels) {
                    let sample = stream_samples.get(pos).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    if pos < stream_samples.len() {
                        pos += 1;
                    }
                }
                stream_position.store(pos, Ordering::Relaxed);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let start = Instant::now();
    let timeout = audio.duration() + Duration::from_millis(500);

    while position.load(Ordering::Relaxed) < samples.len() {
        if stop.load(Ordering::SeqCst) || start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    drop(stream);
    tracing::debug!(samples = samples.len(), "playback complete");
    Ok(())
}

/// Default output device as a playback sink
#[derive(Debug, Default)]
pub struct SpeakerSink {
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl SpeakerSink {
    /// Create a sink on the default output device
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn replace_current(&self, next: Option<Arc<AtomicBool>>) {
        if let Ok(mut current) = self.current.lock()
            && let Some(previous) = std::mem::replace(&mut *current, next)
        {
            previous.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl PlaybackSink for SpeakerSink {
    async fn start(&self, ticket: PlayTicket, path: &Path, done: PlaybackDone) -> Result<()> {
        let bytes = tokio::fs::read(path).await?;
        let audio = decode_artifact(path, &bytes)?;

        let stop = Arc::new(AtomicBool::new(false));
        self.replace_current(Some(Arc::clone(&stop)));

        tracing::debug!(%ticket, path = %path.display(), duration = ?audio.duration(), "speaker playback starting");

        tokio::task::spawn_blocking(move || {
            let result = play_blocking(&audio, &stop);
            if stop.load(Ordering::SeqCst) {
                return;
            }
            done.finish(result);
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.replace_current(None);
        Ok(())
    }
}

/// Build a sine tone for speaker diagnostics
#[must_use]
pub fn tone(frequency: f32, duration: Duration, sample_rate: u32) -> DecodedAudio {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let count = (sample_rate as f32 * duration.as_secs_f32()) as usize;

    #[allow(clippy::cast_precision_loss)]
    let samples = (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    DecodedAudio {
        samples,
        sample_rate,
    }
}
