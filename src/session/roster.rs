//! Participant roster keyed by id.
//!
//! Every change is applied by id with full-row replacement, so replaying or
//! interleaving events from independent streams converges on the same state.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::models::{Participant, RemoteEvent};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    participants: BTreeMap<Uuid, Participant>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&Participant> {
        self.participants.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.participants.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Participants in join order.
    pub fn ordered(&self) -> Vec<&Participant> {
        let mut list: Vec<&Participant> = self.participants.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Add a participant unless one with the same id is already known.
    pub fn insert(&mut self, participant: Participant) -> bool {
        if self.participants.contains_key(&participant.id) {
            return false;
        }
        self.participants.insert(participant.id, participant);
        true
    }

    /// Replace (or add) the row with this id.
    pub fn upsert(&mut self, participant: Participant) -> bool {
        match self.participants.get(&participant.id) {
            Some(existing) if *existing == participant => false,
            _ => {
                self.participants.insert(participant.id, participant);
                true
            }
        }
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Participant> {
        self.participants.remove(&id)
    }

    /// Replace the whole roster with a freshly fetched baseline.
    pub fn reset_to(&mut self, participants: Vec<Participant>) {
        self.participants = participants.into_iter().map(|p| (p.id, p)).collect();
    }

    pub fn set_vote(&mut self, id: Uuid, vote: Option<String>) {
        if let Some(participant) = self.participants.get_mut(&id) {
            participant.vote = vote;
        }
    }

    pub fn clear_votes(&mut self) {
        for participant in self.participants.values_mut() {
            participant.vote = None;
        }
    }

    /// How many participants have not voted yet.
    pub fn missing_votes(&self) -> usize {
        self.participants.values().filter(|p| !p.has_voted()).count()
    }

    /// Apply a participant change event. Returns whether the roster changed.
    pub fn apply(&mut self, event: &RemoteEvent) -> bool {
        match event {
            RemoteEvent::ParticipantInserted(participant) => self.insert(participant.clone()),
            RemoteEvent::ParticipantUpdated(participant) => self.upsert(participant.clone()),
            RemoteEvent::ParticipantDeleted { id } => self.remove(*id).is_some(),
            _ => false,
        }
    }
}
