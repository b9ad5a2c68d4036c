//! WebSocket connection to the speech service
//!
//! One background task owns the connection for the life of the channel:
//! wait the initial delay, connect, serve frames until the link drops, wait
//! the fixed reconnect delay, repeat. There is never more than one loop, so a
//! disconnect schedules exactly one follow-up attempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ControlMessage, ControlSink};
use crate::Error;

/// Inbound messages buffered per subscriber
const INBOUND_CAPACITY: usize = 64;

type Writer = Arc<Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>;

/// Connection settings
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// WebSocket URL of the speech service
    pub url: String,
    /// Fixed delay before every reconnect attempt
    pub reconnect_delay: Duration,
    /// Delay before the first attempt
    pub initial_delay: Duration,
}

#[derive(Debug, Default)]
struct LinkState {
    connected: AtomicBool,
    attempts: AtomicU64,
}

/// Persistent duplex link to the speech service
pub struct ControlChannel {
    config: ControlConfig,
    inbound: broadcast::Sender<ControlMessage>,
    writer: Writer,
    state: Arc<LinkState>,
    task: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Create a channel; nothing happens until [`connect`](Self::connect)
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            config,
            inbound,
            writer: Arc::new(Mutex::new(None)),
            state: Arc::new(LinkState::default()),
            task: None,
        }
    }

    /// Start the connection loop
    ///
    /// A no-op while the loop is already running.
    pub fn connect(&mut self) {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        tracing::info!(url = %self.config.url, "control channel starting");
        self.task = Some(tokio::spawn(run(
            self.config.clone(),
            self.inbound.clone(),
            Arc::clone(&self.writer),
            Arc::clone(&self.state),
        )));
    }

    /// Receive every inbound message from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.inbound.subscribe()
    }

    /// Cloneable sending half
    #[must_use]
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            writer: Arc::clone(&self.writer),
        }
    }

    /// Whether the link is currently open
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Connection attempts made so far
    #[must_use]
    pub fn attempts(&self) -> u64 {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Stop the connection loop and close the link
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        clear_writer(&self.writer);
        self.state.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sending half of a [`ControlChannel`]
#[derive(Clone)]
pub struct ControlHandle {
    writer: Writer,
}

impl ControlSink for ControlHandle {
    fn send(&self, message: ControlMessage) {
        let Ok(writer) = self.writer.lock() else {
            return;
        };

        let Some(tx) = writer.as_ref() else {
            tracing::debug!(%message, "control channel down, dropping message");
            return;
        };

        for frame in message.frames() {
            if tx.send(WsMessage::Text(frame.into())).is_err() {
                tracing::debug!(%message, "control channel closing, dropping message");
                return;
            }
        }
        tracing::debug!(%message, "control message sent");
    }
}

async fn run(
    config: ControlConfig,
    inbound: broadcast::Sender<ControlMessage>,
    writer: Writer,
    state: Arc<LinkState>,
) {
    tokio::time::sleep(config.initial_delay).await;

    loop {
        let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        match tokio_tungstenite::connect_async(config.url.as_str()).await {
            Ok((ws, _response)) => {
                tracing::info!(url = %config.url, attempt, "control channel connected");
                serve(ws, &inbound, &writer, &state).await;
                state.connected.store(false, Ordering::SeqCst);
                clear_writer(&writer);
                tracing::warn!(url = %config.url, "control channel closed");
            }
            Err(e) => {
                let e = Error::from(e);
                tracing::warn!(url = %config.url, attempt, kind = ?e.kind(), error = %e, "control channel connect failed");
            }
        }

        tracing::debug!(delay = ?config.reconnect_delay, "control channel reconnect scheduled");
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn serve(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    inbound: &broadcast::Sender<ControlMessage>,
    writer: &Writer,
    state: &LinkState,
) {
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    if let Ok(mut slot) = writer.lock() {
        *slot = Some(tx);
    }
    state.connected.store(true, Ordering::SeqCst);

    loop {
        tokio::select! {
            Some(outbound) = rx.recv() => {
                if let Err(e) = sink.send(outbound).await {
                    tracing::warn!(error = %e, "control channel write failed");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match ControlMessage::parse(text.as_str()) {
                        Some(message) => {
                            tracing::debug!(%message, "control message received");
                            let _ = inbound.send(message);
                        }
                        None => tracing::trace!(frame = text.as_str(), "ignoring unknown control frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "control channel read failed");
                    break;
                }
            },
        }
    }
}

fn clear_writer(writer: &Writer) {
    if let Ok(mut slot) = writer.lock() {
        *slot = None;
    }
}
