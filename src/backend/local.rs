//! Embedded backend: SQLite rows plus an in-process change feed.
//!
//! Every committed write is published on a broadcast feed tagged with its
//! room; each subscription filters the feed down to one room. Presence is
//! an in-memory registry, so only subscribers in this process see each other.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use super::{Backend, Subscription};
use crate::db::{init_database, Repository};
use crate::errors::AppError;
use crate::models::{
    Participant, PresenceMeta, RemoteEvent, Room, SubscriptionStatus, VotingSystem,
};

const FEED_CAPACITY: usize = 256;

type PresenceRegistry = Arc<Mutex<HashMap<Uuid, HashMap<Uuid, PresenceMeta>>>>;

#[derive(Debug, Clone)]
struct FeedItem {
    room_id: Uuid,
    event: RemoteEvent,
}

/// Backend over the embedded SQLite store.
#[derive(Clone)]
pub struct LocalBackend {
    repo: Repository,
    feed: broadcast::Sender<FeedItem>,
    presence: PresenceRegistry,
}

impl LocalBackend {
    pub fn new(repo: Repository) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            repo,
            feed,
            presence: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open (or create) the database file and wrap it.
    pub async fn open(db_path: &Path) -> Result<Self, AppError> {
        let pool = init_database(db_path).await?;
        Ok(Self::new(Repository::new(pool)))
    }

    /// Stop serving requests. Open subscriptions stay up until closed.
    pub async fn shutdown(&self) {
        self.repo.close().await;
    }

    /// Participants currently tracked as online in a room.
    pub fn online(&self, room_id: Uuid) -> Vec<Uuid> {
        self.presence
            .lock()
            .get(&room_id)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default()
    }

    fn publish(&self, room_id: Uuid, event: RemoteEvent) {
        // No receivers is fine: nobody is watching this room.
        let _ = self.feed.send(FeedItem { room_id, event });
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn create_room(
        &self,
        name: &str,
        voting_system: VotingSystem,
    ) -> Result<Room, AppError> {
        self.repo.create_room(name, voting_system).await
    }

    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, AppError> {
        self.repo.get_room(room_id).await
    }

    async fn set_revealed(&self, room_id: Uuid, revealed: bool) -> Result<(), AppError> {
        let room = self
            .repo
            .set_revealed(room_id, revealed)
            .await?
            .ok_or_else(|| AppError::RoomNotFound(room_id.to_string()))?;
        self.publish(room_id, RemoteEvent::RoomChanged(room));
        Ok(())
    }

    async fn find_participant_by_name(
        &self,
        room_id: Uuid,
        name: &str,
    ) -> Result<Option<Participant>, AppError> {
        self.repo.find_participant_by_name(room_id, name).await
    }

    async fn create_participant(
        &self,
        room_id: Uuid,
        name: &str,
    ) -> Result<Participant, AppError> {
        let participant = self.repo.create_participant(room_id, name).await?;
        self.publish(room_id, RemoteEvent::ParticipantInserted(participant.clone()));
        Ok(participant)
    }

    async fn list_participants(&self, room_id: Uuid) -> Result<Vec<Participant>, AppError> {
        self.repo.list_participants(room_id).await
    }

    async fn set_vote(&self, participant_id: Uuid, vote: Option<&str>) -> Result<(), AppError> {
        if let Some(participant) = self.repo.set_vote(participant_id, vote).await? {
            self.publish(
                participant.room_id,
                RemoteEvent::ParticipantUpdated(participant),
            );
        }
        Ok(())
    }

    async fn clear_votes(&self, room_id: Uuid) -> Result<(), AppError> {
        for participant in self.repo.clear_votes(room_id).await? {
            self.publish(room_id, RemoteEvent::ParticipantUpdated(participant));
        }
        Ok(())
    }

    async fn delete_participant(&self, participant_id: Uuid) -> Result<(), AppError> {
        if let Some(removed) = self.repo.delete_participant(participant_id).await? {
            self.publish(
                removed.room_id,
                RemoteEvent::ParticipantDeleted { id: removed.id },
            );
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: Uuid,
        presence: PresenceMeta,
    ) -> Result<Subscription, AppError> {
        // Subscribe before spawning so nothing committed from here on is missed.
        let mut feed = self.feed.subscribe();
        let publisher = self.feed.clone();
        let registry = self.presence.clone();
        let (tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let participant_id = presence.participant_id;

        let task = tokio::spawn(async move {
            let _ = tx.send(RemoteEvent::Status(SubscriptionStatus::Subscribed));

            let online: Vec<Uuid> = {
                let mut registry = registry.lock();
                let room = registry.entry(room_id).or_default();
                room.insert(participant_id, presence);
                room.keys().copied().collect()
            };
            let _ = tx.send(RemoteEvent::PresenceSynced {
                participant_ids: online,
            });
            let _ = publisher.send(FeedItem {
                room_id,
                event: RemoteEvent::PresenceJoined { participant_id },
            });

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    item = feed.recv() => match item {
                        Ok(item) if item.room_id == room_id => {
                            if tx.send(item.event).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // A lagged receiver rebuilds its baseline.
                            tracing::warn!(%room_id, skipped, "Change feed lagged, requesting refetch");
                            let _ = tx.send(RemoteEvent::Status(SubscriptionStatus::Subscribed));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }

            {
                let mut registry = registry.lock();
                if let Some(room) = registry.get_mut(&room_id) {
                    room.remove(&participant_id);
                    if room.is_empty() {
                        registry.remove(&room_id);
                    }
                }
            }
            let _ = publisher.send(FeedItem {
                room_id,
                event: RemoteEvent::PresenceLeft { participant_id },
            });
            let _ = tx.send(RemoteEvent::Status(SubscriptionStatus::Closed));
            tracing::debug!(%room_id, %participant_id, "Local subscription closed");
        });

        Ok(Subscription::new(room_id, events, shutdown_tx, task))
    }
}
