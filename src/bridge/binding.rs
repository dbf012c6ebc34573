//! Handle to room binding
//!
//! Each bound session gets one forwarding task that reads the handle's event
//! stream and publishes it to the room. Output stays in production order; the
//! task never tries to recover a failing handle.
//!
//! Joins are served by the same task: it replays the buffered output it has
//! already forwarded and only then adds the connection to the room, so a late
//! subscriber sees history followed by live output without gaps or repeats.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::decode::{char_boundary, Utf8Decoder};
use super::rooms::{session_room, BridgeEvent, ConnectionId, RoomRegistry};
use crate::session::{OutputBuffer, SessionEvent, SessionHandle};

/// Pending join requests per forwarding task
const JOIN_QUEUE: usize = 16;

/// Turns one session's event stream into room events
struct EventTranslator {
    decoder: Utf8Decoder,
    /// Sequence number of the next output chunk expected on the stream
    next_seq: u64,
}

impl EventTranslator {
    fn new(next_seq: u64) -> Self {
        Self {
            decoder: Utf8Decoder::new(),
            next_seq,
        }
    }

    fn translate(&mut self, event: SessionEvent) -> Vec<BridgeEvent> {
        match event {
            SessionEvent::Output {
                session_id,
                seq,
                data,
                timestamp,
            } => {
                self.next_seq = seq + 1;
                let data = self.decoder.decode(&data);
                if data.is_empty() {
                    return Vec::new();
                }
                vec![BridgeEvent::Output {
                    session_id,
                    data,
                    timestamp,
                }]
            }
            SessionEvent::Resync {
                session_id,
                data,
                timestamp,
            } => vec![BridgeEvent::Output {
                session_id,
                data,
                timestamp,
            }],
            SessionEvent::Exited {
                session_id,
                exit_code,
                timestamp,
            } => {
                let mut events = Vec::with_capacity(2);
                let tail = self.decoder.finish();
                if !tail.is_empty() {
                    events.push(BridgeEvent::Output {
                        session_id: session_id.clone(),
                        data: tail,
                        timestamp,
                    });
                }
                events.push(BridgeEvent::Ended {
                    session_id,
                    exit_code,
                    timestamp,
                });
                events
            }
            SessionEvent::Error {
                session_id,
                message,
                timestamp,
            } => vec![BridgeEvent::Error {
                session_id,
                message,
                timestamp,
            }],
        }
    }

    /// The receiver lagged; a held-back partial character can no longer complete
    fn skipped(&mut self, session_id: &str, skipped: u64) -> BridgeEvent {
        self.decoder = Utf8Decoder::new();
        BridgeEvent::Overflow {
            session_id: session_id.to_string(),
            skipped,
            timestamp: Utc::now(),
        }
    }
}

/// Request to add a connection to a bound room
struct Join {
    connection: ConnectionId,
    tx: mpsc::Sender<BridgeEvent>,
    lines: usize,
    done: oneshot::Sender<()>,
}

struct Binding {
    room: String,
    buffer: Arc<Mutex<OutputBuffer>>,
    joins: mpsc::Sender<Join>,
    task: JoinHandle<()>,
}

impl Binding {
    fn serves(&self, handle: &SessionHandle, room: &str) -> bool {
        self.room == room
            && Arc::ptr_eq(&self.buffer, &handle.buffer())
            && !self.task.is_finished()
    }
}

/// Fans session events out to rooms
pub struct Bridge {
    rooms: Arc<RoomRegistry>,
    bindings: Mutex<HashMap<String, Binding>>,
}

impl Bridge {
    pub fn new(rooms: Arc<RoomRegistry>) -> Self {
        Self {
            rooms,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Publish `handle`'s events to `room`, replacing any earlier binding of
    /// the same session id
    pub async fn bind(&self, handle: &SessionHandle, room: &str) {
        let mut bindings = self.bindings.lock().await;
        self.bind_locked(&mut bindings, handle, room).await;
    }

    async fn bind_locked(
        &self,
        bindings: &mut HashMap<String, Binding>,
        handle: &SessionHandle,
        room: &str,
    ) -> mpsc::Sender<Join> {
        let (rx, next_seq) = handle.subscribe_at().await;
        let (joins, joins_rx) = mpsc::channel(JOIN_QUEUE);
        let buffer = handle.buffer();
        let session_id = handle.id().to_string();
        let task = tokio::spawn(forward_events(
            Arc::clone(&self.rooms),
            session_id.clone(),
            room.to_string(),
            Arc::clone(&buffer),
            rx,
            joins_rx,
            next_seq,
        ));

        let previous = bindings.insert(
            session_id.clone(),
            Binding {
                room: room.to_string(),
                buffer,
                joins: joins.clone(),
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }
        info!(session_id = %session_id, room = %room, "Bound session to room");
        joins
    }

    /// Add a connection to the session's room after sending it up to `lines`
    /// buffered chunks, binding the handle first unless it already is.
    pub async fn join(
        &self,
        handle: &SessionHandle,
        connection: ConnectionId,
        tx: mpsc::Sender<BridgeEvent>,
        lines: usize,
    ) {
        let room = session_room(handle.id());
        let joins = {
            let mut bindings = self.bindings.lock().await;
            match bindings.get(handle.id()) {
                Some(binding) if binding.serves(handle, &room) => binding.joins.clone(),
                _ => self.bind_locked(&mut bindings, handle, &room).await,
            }
        };

        let (done, finished) = oneshot::channel();
        let request = Join {
            connection,
            tx: tx.clone(),
            lines,
            done,
        };
        if joins.send(request).await.is_err() || finished.await.is_err() {
            // Forwarder is gone; join without history
            debug!(session_id = %handle.id(), "Forwarder unavailable, joining without replay");
            self.rooms.join(&room, connection, tx).await;
        }
    }

    /// Stop forwarding a session's events
    pub async fn unbind(&self, session_id: &str) -> bool {
        match self.bindings.lock().await.remove(session_id) {
            Some(binding) => {
                binding.task.abort();
                debug!(session_id = %session_id, room = %binding.room, "Unbound session");
                true
            }
            None => false,
        }
    }

    /// Abort every forwarding task
    pub async fn shutdown(&self) {
        for (_, binding) in self.bindings.lock().await.drain() {
            binding.task.abort();
        }
    }
}

/// Buffered output below `next_seq`, decoded as one event
async fn replay(
    buffer: &Mutex<OutputBuffer>,
    session_id: &str,
    next_seq: u64,
    lines: usize,
) -> Option<BridgeEvent> {
    let chunks = buffer.lock().await.recent_before(next_seq, lines);
    let timestamp = chunks.last()?.timestamp;

    let mut decoder = Utf8Decoder::new();
    let mut data = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let bytes = if i == 0 {
            char_boundary(&chunk.data)
        } else {
            &chunk.data
        };
        data.push_str(&decoder.decode(bytes));
    }
    // A trailing partial character is completed by the live stream

    if data.is_empty() {
        return None;
    }
    Some(BridgeEvent::Output {
        session_id: session_id.to_string(),
        data,
        timestamp,
    })
}

async fn forward_events(
    rooms: Arc<RoomRegistry>,
    session_id: String,
    room: String,
    buffer: Arc<Mutex<OutputBuffer>>,
    mut rx: broadcast::Receiver<SessionEvent>,
    mut joins: mpsc::Receiver<Join>,
    next_seq: u64,
) {
    let mut translator = EventTranslator::new(next_seq);
    loop {
        tokio::select! {
            biased;

            Some(join) = joins.recv() => {
                let history =
                    replay(&buffer, &session_id, translator.next_seq, join.lines).await;
                if let Some(history) = history {
                    if join.tx.try_send(history).is_err() {
                        warn!(
                            session_id = %session_id,
                            connection = %join.connection,
                            "Dropped history replay"
                        );
                    }
                }
                rooms.join(&room, join.connection, join.tx).await;
                let _ = join.done.send(());
            }
            result = rx.recv() => match result {
                Ok(event) => {
                    for event in translator.translate(event) {
                        rooms.broadcast(&room, &event).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(session_id = %session_id, "Bridge lagged, skipped {} events", n);
                    let overflow = translator.skipped(&session_id, n);
                    rooms.broadcast(&room, &overflow).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(session_id = %session_id, "Session event stream closed");
                    break;
                }
            },
        }
    }
}
