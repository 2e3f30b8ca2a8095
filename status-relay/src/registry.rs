//! Room membership: admission, reconciliation, fan-out and eviction.
//!
//! All membership changes and fan-out go through one `RwLock` around the
//! room map. Delivery to a member is a non-blocking enqueue on that member's
//! outbound queue, so the lock is never held across socket I/O and a slow
//! client cannot stall the others.
//!
//! A room entry exists only while it has at least one member. Once
//! [`RoomRegistry::close_all`] has run, no further connections are admitted.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::{Sink, SinkExt, Stream};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::actor::{ConnectionActor, EventSender, Frame};
use crate::protocol::Message;
use crate::state::MAX_SNAPSHOT_MESSAGES;

/// Members of one room, keyed by user id.
type Room = HashMap<u64, ConnectionActor>;

/// Consistent snapshot of registry size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub num_rooms: usize,
    pub num_users: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("user {user_id} is already connected to room {room_id}")]
    AlreadyPresent { room_id: u64, user_id: u64 },
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Maps room ids to the connection actors of their occupants.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<u64, Room>>,
    next_serial: AtomicU64,
    /// Frames buffered per connection on top of its join snapshot
    outbound_capacity: usize,
    /// Set by `close_all`; only read or written under the `rooms` write lock
    closing: AtomicBool,
    events: EventSender,
}

impl RoomRegistry {
    /// Create an empty registry whose actors report to `events`.
    ///
    /// `outbound_capacity` is how many frames each connection may have
    /// queued before it is evicted as too slow. A newcomer's queue is
    /// enlarged to also hold the snapshot of every occupant.
    pub fn new(events: EventSender, outbound_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(0),
            outbound_capacity,
            closing: AtomicBool::new(false),
            events,
        }
    }

    /// Admit a new connection for `(room_id, user_id)`.
    ///
    /// The newcomer is first sent the current state of every occupant, then
    /// joins the room and starts its read/write loops. If the pair is already
    /// connected, or the registry is shutting down, the new connection is
    /// closed and nothing else changes.
    pub async fn add_user<St, E, Si>(
        &self,
        room_id: u64,
        user_id: u64,
        reader: St,
        mut writer: Si,
    ) -> Result<ConnectionActor, RegistryError>
    where
        St: Stream<Item = Result<Frame, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
        Si: Sink<Frame> + Unpin + Send + 'static,
        Si::Error: Display + Send,
    {
        let mut rooms = self.rooms.write().await;

        let rejection = if self.closing.load(Ordering::Acquire) {
            Some(RegistryError::ShuttingDown)
        } else if rooms
            .get(&room_id)
            .is_some_and(|room| room.contains_key(&user_id))
        {
            Some(RegistryError::AlreadyPresent { room_id, user_id })
        } else {
            None
        };
        if let Some(err) = rejection {
            drop(rooms);
            log::warn!("Rejecting connection for user {user_id} in room {room_id}: {err}");
            tokio::spawn(async move {
                let _ = writer.send(Frame::Close).await;
                let _ = writer.close().await;
                drop(reader);
            });
            return Err(err);
        }

        let room = rooms.entry(room_id).or_default();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let capacity = self.outbound_capacity + MAX_SNAPSHOT_MESSAGES * room.len();
        let (actor, mailbox) =
            ConnectionActor::new(room_id, user_id, serial, capacity, self.events.clone());

        for member in room.values() {
            for msg in member.snapshot().to_messages(room_id, member.user_id()) {
                actor.send(msg);
            }
        }
        room.insert(user_id, actor.clone());
        let occupants = room.len();

        actor.start(mailbox, reader, writer);

        log::info!("User {user_id} joined room {room_id} ({occupants} occupants)");
        Ok(actor)
    }

    /// Deliver `msg` to every member of its room except the sender.
    ///
    /// Returns the number of members it was queued for. A missing room is
    /// not an error: the sender may have just been evicted.
    pub async fn broadcast(&self, msg: &Message) -> usize {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&msg.room_id) else {
            log::trace!("Dropping {:?} for vanished room {}", msg.kind, msg.room_id);
            return 0;
        };

        let mut delivered = 0;
        for member in room.values().filter(|m| m.user_id() != msg.user_id) {
            member.send(*msg);
            delivered += 1;
        }
        log::trace!(
            "Fanned out {:?} from user {} to {delivered} members of room {}",
            msg.kind,
            msg.user_id,
            msg.room_id
        );
        delivered
    }

    /// Remove `actor` from its room and close its connection.
    ///
    /// The remaining members are told with a `quit` message; an emptied room
    /// is deleted. Returns `false` (and changes nothing) if this connection
    /// is no longer a member, so repeated or stale evictions are harmless.
    pub async fn remove_user(&self, actor: &ConnectionActor) -> bool {
        let removed = self.remove_member(actor).await;
        actor.close();
        removed
    }

    async fn remove_member(&self, actor: &ConnectionActor) -> bool {
        let (room_id, user_id) = (actor.room_id(), actor.user_id());
        let mut rooms = self.rooms.write().await;

        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };
        if !room
            .get(&user_id)
            .is_some_and(|member| member.serial() == actor.serial())
        {
            return false;
        }
        room.remove(&user_id);

        if room.is_empty() {
            rooms.remove(&room_id);
            log::info!("User {user_id} left room {room_id}; room removed (empty)");
        } else {
            let quit = Message::quit(room_id, user_id);
            for member in room.values() {
                member.send(quit);
            }
            log::info!(
                "User {user_id} left room {room_id} ({} occupants)",
                room.len()
            );
        }
        true
    }

    /// Room and user counts, taken under the registry lock.
    pub async fn stats(&self) -> RoomStats {
        let rooms = self.rooms.read().await;
        RoomStats {
            num_rooms: rooms.len(),
            num_users: rooms.values().map(HashMap::len).sum(),
        }
    }

    /// User ids currently in `room_id`, in ascending order.
    pub async fn room_members(&self, room_id: u64) -> Vec<u64> {
        let rooms = self.rooms.read().await;
        let mut members: Vec<u64> = rooms
            .get(&room_id)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Empty every room, ask each connection to close and refuse any
    /// connection admitted later.
    ///
    /// Returns the closed actors so the caller can wait for them to finish.
    pub async fn close_all(&self) -> Vec<ConnectionActor> {
        let drained: Vec<ConnectionActor> = {
            let mut rooms = self.rooms.write().await;
            self.closing.store(true, Ordering::Release);
            rooms.drain().flat_map(|(_, room)| room.into_values()).collect()
        };
        for actor in &drained {
            actor.close();
        }
        if !drained.is_empty() {
            log::info!("Closed {} connections", drained.len());
        }
        drained
    }
}
