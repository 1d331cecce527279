use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque room identifier assigned by the matchmaking server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        RoomId(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Searching,
    Negotiating,
    Connected,
    PartnerLeft,
    Ended,
}

/// Who sends the first offer in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn from_initiator(initiator: bool) -> Self {
        if initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// One active or pending pairing.
///
/// `room_id` and `role` are only set between a `matched` event and the
/// next teardown; a fresh `matched` always replaces both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: CallState,
    pub room_id: Option<RoomId>,
    pub role: Option<Role>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            room_id: None,
            role: None,
        }
    }
}

impl Session {
    pub fn assign(&mut self, room_id: RoomId, role: Role) {
        self.room_id = Some(room_id);
        self.role = Some(role);
        self.state = CallState::Negotiating;
    }

    /// Drops the pairing and returns the room that was vacated.
    pub fn vacate(&mut self, next: CallState) -> Option<RoomId> {
        self.role = None;
        self.state = next;
        self.room_id.take()
    }

    /// True when `room` names the current pairing.
    pub fn is_current(&self, room: &RoomId) -> bool {
        self.room_id.as_ref() == Some(room)
    }
}
