//! Actor-per-connection: one reader task and one writer task per user.
//!
//! ```text
//!              ┌──────────── ConnectionActor ────────────┐
//! socket ────► │ read loop ── State (local lock)          │ ──► Event queue
//!              │                                          │     (dispatcher)
//! socket ◄──── │ write loop ◄── outbound queue ◄── send() │ ◄── RoomRegistry
//!              └──────────────────────────────────────────┘
//! ```
//!
//! The actor never references the registry. It reports upstream only through
//! the shared [`Event`] queue: state updates as [`Event::Message`] and the
//! first connection failure as [`Event::Evict`]. Writes to one socket happen
//! only on the writer task, so they are never interleaved.
//!
//! The outbound queue is bounded. A peer that lets it fill up is treated like
//! a failed write: it is evicted and its writer abandons the socket without
//! waiting for the pending frame.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::protocol::{Inbound, Message};
use crate::state::State;

/// Transport-level frame, independent of the WebSocket library in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame carrying JSON or a blank keepalive
    Text(String),
    /// Peer-initiated close (inbound) or polite close request (outbound)
    Close,
    /// Anything else (binary, control frames); ignored by the read loop
    Other,
}

/// Notifications from connection actors to the dispatch loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A state update to fan out to the sender's room
    Message(Message),
    /// The actor's connection failed and it must leave its room
    Evict(ConnectionActor),
}

/// Sender half of the shared event queue.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Default number of frames buffered per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Work items for the writer task.
#[derive(Debug)]
enum Outbound {
    Message(Message),
    Echo(String),
    Close,
}

/// Outbound queue consumed by the writer task once the actor is started.
pub(crate) struct Mailbox(mpsc::Receiver<Outbound>);

struct ActorInner {
    room_id: u64,
    user_id: u64,
    /// Distinguishes this connection from later ones reusing the same ids
    serial: u64,
    state: Mutex<State>,
    evicted: AtomicBool,
    stop_reading: Notify,
    /// Tells the writer to give up on the socket without flushing
    stop_writing: Notify,
    outbound: mpsc::Sender<Outbound>,
    events: EventSender,
}

/// Handle to the actor owning one user's connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionActor {
    inner: Arc<ActorInner>,
}

impl std::fmt::Debug for ConnectionActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionActor")
            .field("room_id", &self.inner.room_id)
            .field("user_id", &self.inner.user_id)
            .field("serial", &self.inner.serial)
            .finish()
    }
}

impl ConnectionActor {
    /// Create an actor whose tasks are not running yet.
    ///
    /// Messages sent before [`ConnectionActor::start`] are queued and written
    /// first once the writer starts, so `capacity` must cover them. It is
    /// raised to 1 if zero.
    pub(crate) fn new(
        room_id: u64,
        user_id: u64,
        serial: u64,
        capacity: usize,
        events: EventSender,
    ) -> (Self, Mailbox) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let actor = Self {
            inner: Arc::new(ActorInner {
                room_id,
                user_id,
                serial,
                state: Mutex::new(State::default()),
                evicted: AtomicBool::new(false),
                stop_reading: Notify::new(),
                stop_writing: Notify::new(),
                outbound,
                events,
            }),
        };
        (actor, Mailbox(rx))
    }

    /// Spawn the read and write loops over the two halves of a connection.
    pub(crate) fn start<St, E, Si>(&self, mailbox: Mailbox, reader: St, writer: Si)
    where
        St: Stream<Item = Result<Frame, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
        Si: Sink<Frame> + Unpin + Send + 'static,
        Si::Error: Display + Send,
    {
        tokio::spawn(read_loop(self.clone(), reader));
        tokio::spawn(write_loop(self.clone(), writer, mailbox.0));
    }

    pub fn room_id(&self) -> u64 {
        self.inner.room_id
    }

    pub fn user_id(&self) -> u64 {
        self.inner.user_id
    }

    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// Copy of the current state. Never waits on I/O.
    pub fn snapshot(&self) -> State {
        *self.lock_state()
    }

    /// Queue a message for this user without blocking.
    ///
    /// Messages to a connection that is already gone are dropped. A full
    /// queue evicts the user.
    pub fn send(&self, msg: Message) {
        self.enqueue(Outbound::Message(msg));
    }

    /// Ask both loops to stop; the writer sends a close frame first unless
    /// its queue is full, in which case it drops the connection at once.
    ///
    /// Safe to call any number of times.
    pub fn close(&self) {
        if let Err(TrySendError::Full(_)) = self.inner.outbound.try_send(Outbound::Close) {
            self.inner.stop_writing.notify_one();
        }
        self.inner.stop_reading.notify_one();
    }

    /// Resolves once the writer has stopped and released its half of the
    /// connection.
    pub async fn closed(&self) {
        self.inner.outbound.closed().await;
    }

    /// Whether a connection failure has already been reported.
    pub fn is_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::Acquire)
    }

    /// Report this actor for eviction. Only the first call has an effect.
    fn evict(&self) {
        if self.inner.evicted.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(
            "Evicting user {} from room {}",
            self.inner.user_id,
            self.inner.room_id
        );
        let _ = self.inner.events.send(Event::Evict(self.clone()));
    }

    fn enqueue(&self, outbound: Outbound) {
        match self.inner.outbound.try_send(outbound) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "Outbound queue full for user {} in room {}",
                    self.inner.user_id,
                    self.inner.room_id
                );
                self.evict();
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!(
                    "Dropping frame for closed connection {}/{}",
                    self.inner.room_id,
                    self.inner.user_id
                );
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_text(&self, text: &str) {
        match Inbound::decode(text) {
            Ok(Inbound::Keepalive(echo)) => self.enqueue(Outbound::Echo(echo)),
            Ok(Inbound::Message(msg)) => {
                let msg = msg.addressed(self.inner.room_id, self.inner.user_id);
                if !msg.kind.is_state_update() {
                    log::trace!("Ignoring {:?} from user {}", msg.kind, self.inner.user_id);
                    return;
                }
                self.lock_state().update(&msg);
                let _ = self.inner.events.send(Event::Message(msg));
            }
            Err(e) => {
                log::debug!(
                    "Dropping malformed frame from user {} in room {}: {e}",
                    self.inner.user_id,
                    self.inner.room_id
                );
            }
        }
    }
}

async fn read_loop<St, E>(actor: ConnectionActor, mut reader: St)
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = actor.inner.stop_reading.notified() => break,
        };
        match frame {
            Some(Ok(Frame::Text(text))) => actor.handle_text(&text),
            Some(Ok(Frame::Other)) => {}
            Some(Ok(Frame::Close)) | None => {
                log::info!(
                    "Connection closed by user {} in room {}",
                    actor.inner.user_id,
                    actor.inner.room_id
                );
                break;
            }
            Some(Err(e)) => {
                log::info!(
                    "Read error from user {} in room {}: {e}",
                    actor.inner.user_id,
                    actor.inner.room_id
                );
                break;
            }
        }
    }
    actor.evict();
}

async fn write_loop<Si>(actor: ConnectionActor, mut writer: Si, mut rx: mpsc::Receiver<Outbound>)
where
    Si: Sink<Frame> + Unpin,
    Si::Error: Display,
{
    loop {
        let outbound = tokio::select! {
            biased;
            _ = actor.inner.stop_writing.notified() => break,
            outbound = rx.recv() => match outbound {
                Some(outbound) => outbound,
                None => break,
            },
        };
        let frame = match outbound {
            Outbound::Message(msg) => match msg.encode() {
                Ok(text) => Frame::Text(text),
                Err(e) => {
                    log::warn!("Failed to encode {msg:?}: {e}");
                    continue;
                }
            },
            Outbound::Echo(text) => Frame::Text(text),
            Outbound::Close => {
                let _ = writer.send(Frame::Close).await;
                let _ = writer.close().await;
                break;
            }
        };
        let result = tokio::select! {
            biased;
            _ = actor.inner.stop_writing.notified() => break,
            result = writer.send(frame) => result,
        };
        if let Err(e) = result {
            log::warn!(
                "Write error to user {} in room {}: {e}",
                actor.inner.user_id,
                actor.inner.room_id
            );
            actor.evict();
            break;
        }
    }
}
