//! Notifications delivered on a room subscription.

use uuid::Uuid;

use super::{Participant, Room};

/// Lifecycle of the room channel as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionStatus {
    Subscribing,
    Subscribed,
    Closed,
    Failed(String),
}

/// A single push notification for the subscribed room.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Status(SubscriptionStatus),
    RoomChanged(Room),
    ParticipantInserted(Participant),
    ParticipantUpdated(Participant),
    /// Delete payloads may carry nothing but the primary key.
    ParticipantDeleted { id: Uuid },
    PresenceSynced { participant_ids: Vec<Uuid> },
    PresenceJoined { participant_id: Uuid },
    PresenceLeft { participant_id: Uuid },
}
