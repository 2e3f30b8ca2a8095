//! Per-user activity state.
//!
//! ## Active flag encoding
//!
//! [`State::to_messages`] never emits an explicit `active=1` message. A
//! client that receives a snapshot without an `active` message must treat
//! the user as active. Deployed clients depend on this, so it is kept as is.

use crate::protocol::{Message, MessageKind};

/// Upper bound on the length of [`State::to_messages`].
pub const MAX_SNAPSHOT_MESSAGES: usize = 3;

/// Snapshot of one user's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct State {
    /// Input box currently focused
    pub active: bool,
    /// Position of the last message the user has read
    pub last_message_read: i64,
    /// Timestamp of the user's last keystroke
    pub last_char_entered: i64,
}

impl State {
    /// Apply an update from the owning user.
    ///
    /// Kinds other than `active`, `position` and `typing` are ignored.
    pub fn update(&mut self, msg: &Message) {
        match msg.kind {
            MessageKind::Active => self.active = msg.value != 0,
            MessageKind::Position => {
                self.active = true;
                self.last_message_read = msg.value;
            }
            MessageKind::Typing => self.last_char_entered = msg.value,
            MessageKind::Ping | MessageKind::Quit => {}
        }
    }

    /// Expand the snapshot into the messages sent to a newcomer.
    ///
    /// Always `position` then `typing`, followed by `active=0` only when the
    /// user is inactive.
    pub fn to_messages(&self, room_id: u64, user_id: u64) -> Vec<Message> {
        let mut messages = Vec::with_capacity(MAX_SNAPSHOT_MESSAGES);
        messages.push(Message::new(
            room_id,
            user_id,
            MessageKind::Position,
            self.last_message_read,
        ));
        messages.push(Message::new(
            room_id,
            user_id,
            MessageKind::Typing,
            self.last_char_entered,
        ));
        if !self.active {
            messages.push(Message::new(room_id, user_id, MessageKind::Active, 0));
        }
        messages
    }
}
