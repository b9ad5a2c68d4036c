//! Sharing one control channel between several sessions
//!
//! The speech service answers over a single link, so replies carry no hint
//! of which session they belong to. The router hands them to the session
//! that most recently announced a capture with `speech_end`. Before any
//! session has done so, the most recently attached one receives them.
//! `ready` reaches every session.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{ControlMessage, ControlSink};

/// Inbound messages buffered per route
const ROUTE_CAPACITY: usize = 64;

/// Identifies one attached session
pub type RouteId = u64;

#[derive(Debug, Default)]
struct RouteTable {
    routes: BTreeMap<RouteId, broadcast::Sender<ControlMessage>>,
    last_speaker: Option<RouteId>,
    next_id: RouteId,
}

impl RouteTable {
    fn owner(&self) -> Option<RouteId> {
        self.last_speaker
            .filter(|id| self.routes.contains_key(id))
            .or_else(|| self.routes.keys().next_back().copied())
    }

    fn deliver(&self, message: ControlMessage) {
        if message == ControlMessage::Ready {
            for route in self.routes.values() {
                let _ = route.send(ControlMessage::Ready);
            }
            return;
        }

        let Some(id) = self.owner() else {
            tracing::debug!(%message, "no session attached, dropping control message");
            return;
        };
        if let Some(route) = self.routes.get(&id) {
            tracing::trace!(route = id, %message, "routing control message");
            let _ = route.send(message);
        }
    }
}

type Table = Arc<Mutex<RouteTable>>;

/// Dispatches one inbound control stream to the session it concerns
pub struct ControlRouter {
    outbound: Arc<dyn ControlSink>,
    table: Table,
    task: JoinHandle<()>,
}

impl ControlRouter {
    /// Start routing `inbound`; sessions send through `outbound`
    #[must_use]
    pub fn new(
        outbound: Arc<dyn ControlSink>,
        inbound: broadcast::Receiver<ControlMessage>,
    ) -> Self {
        let table = Table::default();
        let task = tokio::spawn(dispatch(inbound, Arc::clone(&table)));
        Self {
            outbound,
            table,
            task,
        }
    }

    /// Attach a session
    #[must_use]
    pub fn attach(&self) -> Route {
        let (tx, inbound) = broadcast::channel(ROUTE_CAPACITY);
        let id = {
            let mut table = lock(&self.table);
            let id = table.next_id;
            table.next_id += 1;
            table.routes.insert(id, tx);
            id
        };

        tracing::debug!(route = id, "session attached to control channel");
        Route {
            id,
            sink: Arc::new(RoutedSink {
                id,
                outbound: Arc::clone(&self.outbound),
                table: Arc::clone(&self.table),
            }),
            inbound,
        }
    }

    /// Detach a session; its pending inbound messages are dropped
    pub fn detach(&self, id: RouteId) {
        let mut table = lock(&self.table);
        table.routes.remove(&id);
        if table.last_speaker == Some(id) {
            table.last_speaker = None;
        }
        tracing::debug!(route = id, remaining = table.routes.len(), "session detached from control channel");
    }

    /// Route that currently receives replies
    #[must_use]
    pub fn owner(&self) -> Option<RouteId> {
        lock(&self.table).owner()
    }
}

impl Drop for ControlRouter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A session's view of a routed control channel
pub struct Route {
    /// Route identity, for [`ControlRouter::detach`]
    pub id: RouteId,
    /// Outbound messages; `speech_end` makes this route the reply owner
    pub sink: Arc<dyn ControlSink>,
    /// Inbound messages routed to this session
    pub inbound: broadcast::Receiver<ControlMessage>,
}

struct RoutedSink {
    id: RouteId,
    outbound: Arc<dyn ControlSink>,
    table: Table,
}

impl ControlSink for RoutedSink {
    fn send(&self, message: ControlMessage) {
        if matches!(message, ControlMessage::SpeechEnded(_)) {
            lock(&self.table).last_speaker = Some(self.id);
        }
        self.outbound.send(message);
    }
}

fn lock(table: &Table) -> std::sync::MutexGuard<'_, RouteTable> {
    table
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn dispatch(mut inbound: broadcast::Receiver<ControlMessage>, table: Table) {
    loop {
        match inbound.recv().await {
            Ok(message) => lock(&table).deliver(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "control router lagged behind control channel");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
