//! Backend collaborator seam.
//!
//! The session controller only talks to a [`Backend`] handed to it at
//! construction. Two implementations exist: [`LocalBackend`] keeps rows in
//! an embedded SQLite file and fans changes out in-process, [`RestBackend`]
//! talks to the hosted row API and its realtime socket.

mod local;
mod realtime;
mod rest;

pub use local::LocalBackend;
pub use rest::RestBackend;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Participant, PresenceMeta, RemoteEvent, Room, VotingSystem};

/// Row CRUD, change subscription and presence for the two shared tables.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_room(&self, name: &str, voting_system: VotingSystem)
        -> Result<Room, AppError>;

    async fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, AppError>;

    async fn set_revealed(&self, room_id: Uuid, revealed: bool) -> Result<(), AppError>;

    async fn find_participant_by_name(
        &self,
        room_id: Uuid,
        name: &str,
    ) -> Result<Option<Participant>, AppError>;

    async fn create_participant(&self, room_id: Uuid, name: &str)
        -> Result<Participant, AppError>;

    async fn list_participants(&self, room_id: Uuid) -> Result<Vec<Participant>, AppError>;

    async fn set_vote(&self, participant_id: Uuid, vote: Option<&str>) -> Result<(), AppError>;

    async fn clear_votes(&self, room_id: Uuid) -> Result<(), AppError>;

    async fn delete_participant(&self, participant_id: Uuid) -> Result<(), AppError>;

    /// Open the room's single change channel and start tracking `presence`.
    async fn subscribe(&self, room_id: Uuid, presence: PresenceMeta)
        -> Result<Subscription, AppError>;
}

/// Live change channel for one room.
///
/// Dropping the handle asks the channel task to untrack presence and exit.
pub struct Subscription {
    room_id: Uuid,
    events: mpsc::UnboundedReceiver<RemoteEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        room_id: Uuid,
        events: mpsc::UnboundedReceiver<RemoteEvent>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            room_id,
            events,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Wait for the next event. `None` once the channel task has exited.
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<RemoteEvent> {
        self.events.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<RemoteEvent> {
        self.events.try_recv().ok()
    }

    /// Tear the channel down and wait for the task to finish.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(room_id = %self.room_id, "Subscription task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
