//! Session state controller.
//!
//! Holds the local view of one room and reconciles it against the backend's
//! push notifications. All mutation happens through `&mut self`, either from
//! a user action or from a delivered [`RemoteEvent`].

mod roster;

pub use roster::Roster;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::aggregate;
use crate::backend::{Backend, Subscription};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::{Participant, PresenceMeta, RemoteEvent, Room, SubscriptionStatus, VotingSystem};

/// Where the room's change channel currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Knobs for a controller instance.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Label set used for rooms this controller creates
    pub voting_system: VotingSystem,
    /// Drop roster entries when their presence leaves
    pub prune_on_presence_leave: bool,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            voting_system: config.voting_system,
            prune_on_presence_leave: config.prune_on_presence_leave,
        }
    }
}

/// Local view of one room.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub room_id: Option<Uuid>,
    pub room_name: Option<String>,
    pub voting_system: VotingSystem,
    pub self_participant_id: Option<Uuid>,
    pub participants: Roster,
    pub revealed: bool,
    /// Own vote as last written by this controller
    pub local_vote: Option<String>,
    pub joined: bool,
    pub channel: ChannelState,
    /// Advisory presence; row existence decides membership.
    pub online: BTreeSet<Uuid>,
    /// Mean of numeric votes, only while revealed
    pub average: Option<f64>,
}

/// Controller for a single participant's session.
pub struct SessionController {
    backend: Arc<dyn Backend>,
    options: SessionOptions,
    state: SessionState,
    subscription: Option<Subscription>,
}

impl SessionController {
    pub fn new(backend: Arc<dyn Backend>, options: SessionOptions) -> Self {
        Self {
            backend,
            state: SessionState {
                voting_system: options.voting_system,
                ..SessionState::default()
            },
            options,
            subscription: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn average(&self) -> Option<f64> {
        self.state.average
    }

    /// Participants the presence channel reports online. Advisory only.
    pub fn online(&self) -> &BTreeSet<Uuid> {
        &self.state.online
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Whether every known participant has voted.
    pub fn can_reveal(&self) -> bool {
        self.state.joined && self.state.participants.missing_votes() == 0
    }

    /// Link other participants can use to join this room.
    pub fn share_link(&self, base_url: &str) -> Option<String> {
        self.state
            .room_id
            .map(|id| format!("{}/?room={}", base_url.trim_end_matches('/'), id))
    }

    // ==================== USER ACTIONS ====================

    /// Create a room and join it as `participant_name`.
    pub async fn create_room(
        &mut self,
        room_name: &str,
        participant_name: &str,
    ) -> Result<Room, AppError> {
        self.ensure_not_joined()?;
        let room_name = room_name.trim();
        if room_name.is_empty() {
            return Err(AppError::Validation("Room name is required".to_string()));
        }
        let name = validate_name(participant_name)?;

        let room = self
            .backend
            .create_room(room_name, self.options.voting_system)
            .await?;
        if self
            .backend
            .find_participant_by_name(room.id, name)
            .await?
            .is_some()
        {
            return Err(AppError::DuplicateName(name.to_string()));
        }
        let me = self.backend.create_participant(room.id, name).await?;
        tracing::info!(room_id = %room.id, participant_id = %me.id, "Created room");

        self.enter_room(&room, me).await?;
        Ok(room)
    }

    /// Join an existing room as `participant_name`.
    pub async fn join_room(&mut self, room_id: Uuid, participant_name: &str) -> Result<Room, AppError> {
        self.ensure_not_joined()?;
        let name = validate_name(participant_name)?;

        let room = self
            .backend
            .get_room(room_id)
            .await?
            .ok_or_else(|| AppError::RoomNotFound(room_id.to_string()))?;
        // Check-then-act: two joins racing on one name can both pass.
        if self
            .backend
            .find_participant_by_name(room.id, name)
            .await?
            .is_some()
        {
            return Err(AppError::DuplicateName(name.to_string()));
        }
        let me = self.backend.create_participant(room.id, name).await?;
        tracing::info!(room_id = %room.id, participant_id = %me.id, "Joined room");

        self.enter_room(&room, me).await?;
        Ok(room)
    }

    /// Record this participant's vote. Rolled back locally if the write fails.
    pub async fn submit_vote(&mut self, label: &str) -> Result<(), AppError> {
        let (_, me) = self.ensure_joined()?;
        let label = label.trim();
        if label.is_empty() {
            return Err(AppError::Validation("Vote must not be empty".to_string()));
        }
        if !self.state.voting_system.accepts(label) {
            return Err(AppError::Validation(format!(
                "\"{}\" is not a {} vote",
                label,
                self.state.voting_system.as_str()
            )));
        }

        let previous = self.state.local_vote.replace(label.to_string());
        if let Err(e) = self.backend.set_vote(me, Some(label)).await {
            tracing::warn!(participant_id = %me, "Vote not stored, rolling back");
            self.state.local_vote = previous;
            return Err(e);
        }

        self.state.participants.set_vote(me, Some(label.to_string()));
        self.recompute_average();
        Ok(())
    }

    /// Reveal all votes. Refused while anyone has not voted.
    pub async fn reveal(&mut self) -> Result<(), AppError> {
        let (room_id, _) = self.ensure_joined()?;
        let missing = self.state.participants.missing_votes();
        if missing > 0 {
            return Err(AppError::VotesOutstanding { missing });
        }

        self.backend.set_revealed(room_id, true).await?;
        tracing::info!(%room_id, "Votes revealed");
        self.apply_revealed(true);
        self.recompute_average();
        Ok(())
    }

    /// Hide votes again and clear every vote in the room.
    ///
    /// Two dependent writes; if the second fails the room stays hidden with
    /// the old votes in place.
    pub async fn reset(&mut self) -> Result<(), AppError> {
        let (room_id, _) = self.ensure_joined()?;

        self.backend.set_revealed(room_id, false).await?;
        self.apply_revealed(false);
        self.recompute_average();

        if let Err(e) = self.backend.clear_votes(room_id).await {
            tracing::warn!(%room_id, "Reset hid votes but could not clear them");
            return Err(e);
        }

        self.state.participants.clear_votes();
        self.state.local_vote = None;
        tracing::info!(%room_id, "Room reset");
        Ok(())
    }

    /// Delete own participant row and drop all room state.
    ///
    /// Local state is torn down even when the delete fails; the failure is
    /// still reported.
    pub async fn leave(&mut self) -> Result<(), AppError> {
        let (room_id, me) = self.ensure_joined()?;

        let result = self.backend.delete_participant(me).await;
        if let Some(subscription) = self.subscription.take() {
            subscription.close().await;
        }
        self.state = SessionState {
            voting_system: self.options.voting_system,
            ..SessionState::default()
        };

        match &result {
            Ok(()) => tracing::info!(%room_id, participant_id = %me, "Left room"),
            Err(e) => tracing::warn!(%room_id, participant_id = %me, "Left room, delete failed: {}", e),
        }
        result
    }

    /// Re-open the room channel after it closed.
    pub async fn resubscribe(&mut self) -> Result<(), AppError> {
        self.ensure_joined()?;
        if let Some(subscription) = self.subscription.take() {
            subscription.close().await;
        }
        self.open_subscription().await
    }

    // ==================== RECONCILIATION ====================

    /// Wait for the next remote event without applying it.
    ///
    /// Cancel-safe: an event is only taken off the channel when this returns.
    /// Returns `None` when there is no open channel; a channel that ended is
    /// dropped and the state goes back to unsubscribed.
    pub async fn recv_event(&mut self) -> Option<RemoteEvent> {
        let subscription = self.subscription.as_mut()?;
        let received = subscription.recv().await;
        if received.is_none() {
            self.drop_subscription();
        }
        received
    }

    /// Wait for the next remote event and reconcile it.
    ///
    /// Not cancel-safe; inside `select!` use [`Self::recv_event`] and apply
    /// the event with [`Self::on_remote_event`] in the branch body.
    pub async fn next_event(&mut self) -> Result<Option<RemoteEvent>, AppError> {
        let Some(event) = self.recv_event().await else {
            return Ok(None);
        };
        self.on_remote_event(&event).await?;
        Ok(Some(event))
    }

    /// Reconcile every event that has already arrived.
    pub async fn process_pending(&mut self) -> Result<usize, AppError> {
        let mut applied = 0;
        loop {
            let Some(event) = self.subscription.as_mut().and_then(Subscription::try_recv) else {
                break;
            };
            self.on_remote_event(&event).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Fold one remote notification into local state.
    pub async fn on_remote_event(&mut self, event: &RemoteEvent) -> Result<(), AppError> {
        let (Some(room_id), Some(me)) = (self.state.room_id, self.state.self_participant_id)
        else {
            tracing::debug!(?event, "Ignoring event outside a room");
            return Ok(());
        };
        tracing::debug!(%room_id, ?event, "Reconciling");

        match event {
            RemoteEvent::Status(SubscriptionStatus::Subscribing) => {
                self.state.channel = ChannelState::Subscribing;
            }
            RemoteEvent::Status(SubscriptionStatus::Subscribed) => {
                self.state.channel = ChannelState::Subscribed;
                self.refresh_baseline(room_id, me).await?;
            }
            RemoteEvent::Status(SubscriptionStatus::Closed) => {
                tracing::info!(%room_id, "Room channel closed");
                self.drop_subscription();
            }
            RemoteEvent::Status(SubscriptionStatus::Failed(reason)) => {
                tracing::warn!(%room_id, "Room channel failed: {}", reason);
                self.drop_subscription();
            }
            RemoteEvent::RoomChanged(room) => {
                if room.id == room_id {
                    self.state.room_name = Some(room.name.clone());
                    self.apply_revealed(room.revealed);
                }
            }
            RemoteEvent::ParticipantInserted(participant) => {
                if participant.room_id == room_id {
                    self.state.participants.apply(event);
                }
            }
            RemoteEvent::ParticipantUpdated(participant) => {
                if participant.room_id == room_id {
                    self.state.participants.apply(event);
                    if participant.id == me && !participant.has_voted() {
                        self.state.local_vote = None;
                    }
                }
            }
            RemoteEvent::ParticipantDeleted { .. } => {
                self.state.participants.apply(event);
            }
            RemoteEvent::PresenceSynced { participant_ids } => {
                self.state.online = participant_ids.iter().copied().collect();
            }
            RemoteEvent::PresenceJoined { participant_id } => {
                self.state.online.insert(*participant_id);
            }
            RemoteEvent::PresenceLeft { participant_id } => {
                self.state.online.remove(participant_id);
                if self.options.prune_on_presence_leave && *participant_id != me {
                    self.state.participants.remove(*participant_id);
                }
            }
        }

        self.recompute_average();
        Ok(())
    }

    // ==================== INTERNALS ====================

    /// Open the room channel, then adopt the room. Nothing is committed if
    /// the channel cannot be opened; the fresh participant row is removed.
    async fn enter_room(&mut self, room: &Room, me: Participant) -> Result<(), AppError> {
        let subscription = match self
            .backend
            .subscribe(room.id, PresenceMeta::for_participant(&me))
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(room_id = %room.id, "Could not open room channel: {}", e);
                if let Err(cleanup) = self.backend.delete_participant(me.id).await {
                    tracing::warn!(participant_id = %me.id, "Participant row left behind: {}", cleanup);
                }
                return Err(e);
            }
        };

        let me_id = me.id;
        let mut participants = Roster::default();
        participants.insert(me);

        self.state = SessionState {
            room_id: Some(room.id),
            room_name: Some(room.name.clone()),
            voting_system: room.voting_system,
            self_participant_id: Some(me_id),
            participants,
            revealed: room.revealed,
            local_vote: None,
            joined: true,
            channel: ChannelState::Subscribing,
            online: BTreeSet::new(),
            average: None,
        };
        self.subscription = Some(subscription);
        self.recompute_average();
        Ok(())
    }

    async fn open_subscription(&mut self) -> Result<(), AppError> {
        let (room_id, me) = self.ensure_joined()?;
        let presence = match self.state.participants.get(me) {
            Some(own) => PresenceMeta::for_participant(own),
            None => PresenceMeta {
                participant_id: me,
                name: String::new(),
                online_at: Utc::now(),
            },
        };

        self.state.channel = ChannelState::Subscribing;
        match self.backend.subscribe(room_id, presence).await {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%room_id, "Could not open room channel: {}", e);
                self.state.channel = ChannelState::Unsubscribed;
                Err(e)
            }
        }
    }

    /// Fetch room and roster in full; deltas only cover what follows.
    async fn refresh_baseline(&mut self, room_id: Uuid, me: Uuid) -> Result<(), AppError> {
        if let Some(room) = self.backend.get_room(room_id).await? {
            self.state.room_name = Some(room.name.clone());
            self.apply_revealed(room.revealed);
        }

        let participants = self.backend.list_participants(room_id).await?;
        if let Some(own) = participants.iter().find(|p| p.id == me) {
            self.state.local_vote = own.vote.clone().filter(|v| !v.is_empty());
        }
        tracing::debug!(%room_id, count = participants.len(), "Roster baseline fetched");
        self.state.participants.reset_to(participants);
        Ok(())
    }

    fn drop_subscription(&mut self) {
        self.subscription = None;
        self.state.channel = ChannelState::Unsubscribed;
    }

    /// Adopt a reveal flag. Hiding votes again also hides our own.
    fn apply_revealed(&mut self, revealed: bool) {
        if self.state.revealed && !revealed {
            self.state.local_vote = None;
        }
        self.state.revealed = revealed;
    }

    fn recompute_average(&mut self) {
        self.state.average = self
            .state
            .revealed
            .then(|| aggregate::average(self.state.participants.iter()));
    }

    fn ensure_joined(&self) -> Result<(Uuid, Uuid), AppError> {
        match (
            self.state.joined,
            self.state.room_id,
            self.state.self_participant_id,
        ) {
            (true, Some(room_id), Some(me)) => Ok((room_id, me)),
            _ => Err(AppError::NotJoined),
        }
    }

    fn ensure_not_joined(&self) -> Result<(), AppError> {
        if self.state.joined {
            return Err(AppError::Validation(
                "Leave the current room first".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<&str, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Name is required".to_string()));
    }
    Ok(name)
}
