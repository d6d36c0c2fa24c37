//! Database repository for room and participant rows.
//!
//! Every write returns the affected rows so callers can publish them as
//! change events.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Participant, Room, VotingSystem};

const PARTICIPANT_COLUMNS: &str = "id, room_id, name, vote, created_at";
const ROOM_COLUMNS: &str = "id, name, voting_system, revealed, created_at";

/// Database repository for all data operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Close the underlying pool. Every later call fails.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ==================== ROOM OPERATIONS ====================

    /// Create a new room with `revealed = false`.
    pub async fn create_room(
        &self,
        name: &str,
        voting_system: VotingSystem,
    ) -> Result<Room, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO rooms (id, name, voting_system, revealed, created_at) VALUES (?, ?, ?, 0, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(voting_system.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Room {
            id,
            name: name.to_string(),
            voting_system,
            revealed: false,
            created_at: now,
        })
    }

    /// Get a room by ID.
    pub async fn get_room(&self, id: Uuid) -> Result<Option<Room>, AppError> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(room_from_row).transpose()
    }

    /// Set the reveal flag and return the updated room.
    pub async fn set_revealed(&self, id: Uuid, revealed: bool) -> Result<Option<Room>, AppError> {
        let result = sqlx::query("UPDATE rooms SET revealed = ? WHERE id = ?")
            .bind(revealed as i32)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_room(id).await
    }

    // ==================== PARTICIPANT OPERATIONS ====================

    /// Find a participant of a room by exact display name.
    pub async fn find_participant_by_name(
        &self,
        room_id: Uuid,
        name: &str,
    ) -> Result<Option<Participant>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE room_id = ? AND name = ? LIMIT 1"
        ))
        .bind(room_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(participant_from_row).transpose()
    }

    /// Get a participant by ID.
    pub async fn get_participant(&self, id: Uuid) -> Result<Option<Participant>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(participant_from_row).transpose()
    }

    /// Create a participant with no vote.
    pub async fn create_participant(
        &self,
        room_id: Uuid,
        name: &str,
    ) -> Result<Participant, AppError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO participants (id, room_id, name, vote, created_at) VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(id.to_string())
        .bind(room_id.to_string())
        .bind(name)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Participant {
            id,
            room_id,
            name: name.to_string(),
            vote: None,
            created_at: now,
        })
    }

    /// List all participants of a room in join order.
    pub async fn list_participants(&self, room_id: Uuid) -> Result<Vec<Participant>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE room_id = ? ORDER BY created_at, rowid"
        ))
        .bind(room_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(participant_from_row).collect()
    }

    /// Replace a participant's vote and return the updated row.
    pub async fn set_vote(
        &self,
        id: Uuid,
        vote: Option<&str>,
    ) -> Result<Option<Participant>, AppError> {
        let result = sqlx::query("UPDATE participants SET vote = ? WHERE id = ?")
            .bind(vote)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_participant(id).await
    }

    /// Clear every vote in a room and return the updated rows.
    pub async fn clear_votes(&self, room_id: Uuid) -> Result<Vec<Participant>, AppError> {
        sqlx::query("UPDATE participants SET vote = NULL WHERE room_id = ?")
            .bind(room_id.to_string())
            .execute(&self.pool)
            .await?;

        self.list_participants(room_id).await
    }

    /// Delete a participant and return the removed row.
    pub async fn delete_participant(&self, id: Uuid) -> Result<Option<Participant>, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(existing) = row.as_ref().map(participant_from_row).transpose()? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM participants WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(existing))
    }
}

// Helper functions for row conversion

fn room_from_row(row: &SqliteRow) -> Result<Room, AppError> {
    let revealed: i32 = row.try_get("revealed")?;
    let voting_system: String = row.try_get("voting_system")?;
    Ok(Room {
        id: parse_uuid(row, "id")?,
        name: row.try_get("name")?,
        voting_system: VotingSystem::parse(&voting_system).unwrap_or_default(),
        revealed: revealed != 0,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn participant_from_row(row: &SqliteRow) -> Result<Participant, AppError> {
    Ok(Participant {
        id: parse_uuid(row, "id")?,
        room_id: parse_uuid(row, "room_id")?,
        name: row.try_get("name")?,
        vote: row.try_get("vote")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
    })
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid, AppError> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| {
        AppError::BackendUnavailable(format!("Corrupt {} column \"{}\": {}", column, raw, e))
    })
}
