//! Participant model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named member of a room holding at most one current vote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: Uuid,
    pub room_id: Uuid,
    pub name: String,
    /// `None` means "no vote yet"
    #[serde(default)]
    pub vote: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn has_voted(&self) -> bool {
        self.vote.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// Insert payload for a new participant.
#[derive(Debug, Clone, Serialize)]
pub struct NewParticipant<'a> {
    pub room_id: Uuid,
    pub name: &'a str,
    pub vote: Option<&'a str>,
}

/// Opaque payload tracked on the presence channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceMeta {
    pub participant_id: Uuid,
    pub name: String,
    pub online_at: DateTime<Utc>,
}

impl PresenceMeta {
    pub fn for_participant(participant: &Participant) -> Self {
        Self {
            participant_id: participant.id,
            name: participant.name.clone(),
            online_at: Utc::now(),
        }
    }
}
